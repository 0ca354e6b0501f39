use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use log::{debug, error};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use crate::clock::{CachedClock, TimeHandle};
use crate::error::{Error, Result};
use crate::signal;

const EVENTS_CAPACITY: usize = 1024;

/// Readiness bits delivered to a handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub timed_out: bool,
}

impl Readiness {
    pub(crate) const TIMEOUT: Readiness = Readiness {
        readable: false,
        writable: false,
        timed_out: true,
    };
}

/// Receives readiness and timeout notifications from an event base.
///
/// Handlers run inline on the loop thread. A handler may re-arm,
/// disarm or remove any registry entry from inside `handle_event`,
/// including its own.
pub trait EventHandler {
    fn handle_event(&mut self, ev: Readiness);
}

struct Entry {
    handler: Weak<RefCell<dyn EventHandler>>,
    fd: RawFd,
    armed: Option<Interest>,
    deadline: Option<Instant>,
    dead: bool,
}

pub(crate) struct BaseInner {
    poll: Poll,
    entries: Slab<Entry>,
    deadlines: BinaryHeap<Reverse<(Instant, usize)>>,
    dispatching: bool,
    deferred: Vec<usize>,
    exit: bool,
    pub(crate) signals: Option<signal::SignalTable>,
}

impl BaseInner {
    /// Time until the nearest live deadline, dropping stale heap items.
    fn next_timeout(&mut self) -> Option<Duration> {
        let now = Instant::now();
        while let Some(&Reverse((deadline, key))) = self.deadlines.peek() {
            let live = self
                .entries
                .get(key)
                .map_or(false, |e| !e.dead && e.deadline == Some(deadline));
            if !live {
                self.deadlines.pop();
                continue;
            }
            return Some(deadline.saturating_duration_since(now));
        }
        None
    }

    /// Move expired deadlines into the fired list. Deadlines are
    /// one-shot: the stored deadline is cleared before the handler runs
    /// and state machines re-arm through `arm`.
    fn collect_expired(&mut self, now: Instant, fired: &mut Vec<(usize, Readiness)>) {
        while let Some(&Reverse((deadline, key))) = self.deadlines.peek() {
            if deadline > now {
                break;
            }
            self.deadlines.pop();
            let Some(entry) = self.entries.get_mut(key) else {
                continue;
            };
            if entry.dead || entry.deadline != Some(deadline) {
                continue;
            }
            entry.deadline = None;
            fired.push((key, Readiness::TIMEOUT));
        }
    }
}

/// One event loop and its cached clock.
///
/// Cloning yields another handle on the same loop; a base is owned by
/// exactly one thread for its lifetime and none of its types are Send.
#[derive(Clone)]
pub struct EventBase {
    inner: Rc<RefCell<BaseInner>>,
    clock: TimeHandle,
}

impl EventBase {
    /// Create a base. With `handle_signals`, this base claims the
    /// process-wide signal table so `SignalSet`s can bind to it; only
    /// one base per process may do so.
    pub fn create(handle_signals: bool) -> Result<EventBase> {
        let poll = Poll::new()?;
        let base = EventBase {
            inner: Rc::new(RefCell::new(BaseInner {
                poll,
                entries: Slab::new(),
                deadlines: BinaryHeap::new(),
                dispatching: false,
                deferred: Vec::new(),
                exit: false,
                signals: None,
            })),
            clock: CachedClock::new(),
        };
        if handle_signals {
            signal::install_pipe(&base)?;
        }
        debug!("event base uses mio readiness polling");
        Ok(base)
    }

    pub(crate) fn inner(&self) -> &Rc<RefCell<BaseInner>> {
        &self.inner
    }

    /// Read handle on the cached clock.
    pub fn time(&self) -> TimeHandle {
        Rc::clone(&self.clock)
    }

    /// Allocate a registry slot for `handler`. The slot holds a weak
    /// reference: dropping the handler's owner retires the slot.
    pub fn add(&self, handler: Weak<RefCell<dyn EventHandler>>) -> Token {
        let mut inner = self.inner.borrow_mut();
        let key = inner.entries.insert(Entry {
            handler,
            fd: -1,
            armed: None,
            deadline: None,
            dead: false,
        });
        Token(key)
    }

    /// Register `token` for readiness on `fd` (when `interest` is set)
    /// and arm a fresh one-shot deadline (when `timeout` is set).
    /// Passing `interest: None` keeps the entry as a pure timeout.
    pub fn arm(
        &self,
        token: Token,
        fd: RawFd,
        interest: Option<Interest>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let entry = inner
            .entries
            .get_mut(token.0)
            .filter(|e| !e.dead)
            .ok_or(Error::UnknownToken)?;
        match interest {
            Some(interest) => {
                if entry.armed.is_some() && entry.fd == fd {
                    inner
                        .poll
                        .registry()
                        .reregister(&mut SourceFd(&fd), token, interest)?;
                } else {
                    if entry.armed.is_some() && entry.fd >= 0 {
                        let _ = inner.poll.registry().deregister(&mut SourceFd(&entry.fd));
                    }
                    inner
                        .poll
                        .registry()
                        .register(&mut SourceFd(&fd), token, interest)?;
                }
                entry.fd = fd;
                entry.armed = Some(interest);
            }
            None => {
                if entry.armed.take().is_some() && entry.fd >= 0 {
                    let _ = inner.poll.registry().deregister(&mut SourceFd(&entry.fd));
                }
                entry.fd = fd;
            }
        }
        entry.deadline = timeout.map(|t| Instant::now() + t);
        if let Some(deadline) = entry.deadline {
            inner.deadlines.push(Reverse((deadline, token.0)));
        }
        Ok(())
    }

    /// Drop readiness registration and any pending deadline, keeping
    /// the slot for a later `arm`.
    pub fn disarm(&self, token: Token) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let entry = inner
            .entries
            .get_mut(token.0)
            .filter(|e| !e.dead)
            .ok_or(Error::UnknownToken)?;
        if entry.armed.take().is_some() && entry.fd >= 0 {
            let _ = inner.poll.registry().deregister(&mut SourceFd(&entry.fd));
        }
        entry.deadline = None;
        Ok(())
    }

    /// Retire a registry slot. Safe to call from inside a handler; the
    /// slot is not reused until the current dispatch batch completes.
    pub fn remove(&self, token: Token) {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        let Some(entry) = inner.entries.get_mut(token.0) else {
            return;
        };
        if entry.armed.take().is_some() && entry.fd >= 0 {
            let _ = inner.poll.registry().deregister(&mut SourceFd(&entry.fd));
        }
        entry.deadline = None;
        entry.dead = true;
        if inner.dispatching {
            inner.deferred.push(token.0);
        } else {
            inner.entries.remove(token.0);
        }
    }

    /// Run the loop until `exit` is requested from inside a callback.
    ///
    /// A readiness-layer failure other than an interrupted poll is
    /// fatal: the resolver cannot run without its loop, so the process
    /// terminates.
    pub fn dispatch(&self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut fired: Vec<(usize, Readiness)> = Vec::new();
        self.inner.borrow_mut().exit = false;
        loop {
            if self.inner.borrow().exit {
                break;
            }
            let timeout = self.inner.borrow_mut().next_timeout();
            if let Err(e) = self.inner.borrow_mut().poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("event poll failed: {e}");
                std::process::exit(1);
            }
            self.clock.refresh();
            fired.clear();
            for ev in events.iter() {
                // Error and hangup conditions surface as both readable
                // and writable so the owning state machine notices them
                // in whichever direction it is registered for.
                let broken = ev.is_error();
                fired.push((
                    ev.token().0,
                    Readiness {
                        readable: ev.is_readable() || ev.is_read_closed() || broken,
                        writable: ev.is_writable() || ev.is_write_closed() || broken,
                        timed_out: false,
                    },
                ));
            }
            {
                let mut inner = self.inner.borrow_mut();
                inner.dispatching = true;
                inner.collect_expired(Instant::now(), &mut fired);
            }
            for &(key, ev) in fired.iter() {
                let handler = {
                    let inner = self.inner.borrow();
                    match inner.entries.get(key) {
                        Some(entry) if !entry.dead => entry.handler.upgrade(),
                        _ => None,
                    }
                };
                match handler {
                    Some(handler) => handler.borrow_mut().handle_event(ev),
                    // Owner gone without removing; reap the slot.
                    None => self.remove(Token(key)),
                }
            }
            let mut inner = self.inner.borrow_mut();
            inner.dispatching = false;
            let deferred = mem::take(&mut inner.deferred);
            for key in deferred {
                inner.entries.try_remove(key);
            }
            if inner.exit {
                break;
            }
        }
    }

    /// Request loop termination after the current batch.
    pub fn exit(&self) {
        self.inner.borrow_mut().exit = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FlagHandler {
        hits: Rc<Cell<usize>>,
        last: Rc<Cell<Readiness>>,
    }

    impl EventHandler for FlagHandler {
        fn handle_event(&mut self, ev: Readiness) {
            self.hits.set(self.hits.get() + 1);
            self.last.set(ev);
        }
    }

    fn flag_handler() -> (Rc<RefCell<FlagHandler>>, Rc<Cell<usize>>, Rc<Cell<Readiness>>) {
        let hits = Rc::new(Cell::new(0));
        let last = Rc::new(Cell::new(Readiness::default()));
        let handler = Rc::new(RefCell::new(FlagHandler {
            hits: Rc::clone(&hits),
            last: Rc::clone(&last),
        }));
        (handler, hits, last)
    }

    #[test]
    fn test_add_and_remove_slots() {
        let base = EventBase::create(false).unwrap();
        let (handler, _, _) = flag_handler();
        let handler_dyn: Rc<RefCell<dyn EventHandler>> = handler.clone();
        let weak: Weak<RefCell<dyn EventHandler>> = Rc::downgrade(&handler_dyn);
        let token = base.add(weak);
        assert!(base.disarm(token).is_ok());
        base.remove(token);
        assert!(matches!(base.disarm(token), Err(Error::UnknownToken)));
    }

    #[test]
    fn test_pure_timeout_entry_fires_once() {
        let base = EventBase::create(false).unwrap();
        let (handler, hits, last) = flag_handler();
        let handler_dyn: Rc<RefCell<dyn EventHandler>> = handler.clone();
        let weak: Weak<RefCell<dyn EventHandler>> = Rc::downgrade(&handler_dyn);
        let token = base.add(weak);
        base.arm(token, -1, None, Some(Duration::from_millis(10)))
            .unwrap();

        // A second entry exits the loop a little later so the test
        // observes that the first deadline did not re-arm itself.
        struct ExitHandler {
            base: EventBase,
        }
        impl EventHandler for ExitHandler {
            fn handle_event(&mut self, _ev: Readiness) {
                self.base.exit();
            }
        }
        let stop = Rc::new(RefCell::new(ExitHandler { base: base.clone() }));
        let stop_dyn: Rc<RefCell<dyn EventHandler>> = stop.clone();
        let stop_weak: Weak<RefCell<dyn EventHandler>> = Rc::downgrade(&stop_dyn);
        let stop_token = base.add(stop_weak);
        base.arm(stop_token, -1, None, Some(Duration::from_millis(60)))
            .unwrap();

        base.dispatch();
        assert_eq!(hits.get(), 1);
        assert!(last.get().timed_out);
    }

    #[test]
    fn test_dropped_handler_is_reaped() {
        let base = EventBase::create(false).unwrap();
        let (handler, hits, _) = flag_handler();
        let weak: Weak<RefCell<dyn EventHandler>> = {
            let handler_dyn: Rc<RefCell<dyn EventHandler>> = handler.clone();
            Rc::downgrade(&handler_dyn)
        };
        let token = base.add(weak);
        base.arm(token, -1, None, Some(Duration::from_millis(5)))
            .unwrap();
        drop(handler);

        struct ExitHandler {
            base: EventBase,
        }
        impl EventHandler for ExitHandler {
            fn handle_event(&mut self, _ev: Readiness) {
                self.base.exit();
            }
        }
        let stop = Rc::new(RefCell::new(ExitHandler { base: base.clone() }));
        let stop_dyn: Rc<RefCell<dyn EventHandler>> = stop.clone();
        let stop_weak: Weak<RefCell<dyn EventHandler>> = Rc::downgrade(&stop_dyn);
        let stop_token = base.add(stop_weak);
        base.arm(stop_token, -1, None, Some(Duration::from_millis(30)))
            .unwrap();

        base.dispatch();
        assert_eq!(hits.get(), 0);
        assert!(matches!(base.arm(token, -1, None, None), Err(Error::UnknownToken)));
    }

    #[test]
    fn test_clock_refreshed_before_callbacks() {
        let base = EventBase::create(false).unwrap();
        let time = base.time();
        struct ClockCheck {
            base: EventBase,
            time: TimeHandle,
            seen: Rc<Cell<u32>>,
        }
        impl EventHandler for ClockCheck {
            fn handle_event(&mut self, _ev: Readiness) {
                self.seen.set(self.time.secs());
                self.base.exit();
            }
        }
        let seen = Rc::new(Cell::new(0));
        let handler = Rc::new(RefCell::new(ClockCheck {
            base: base.clone(),
            time,
            seen: Rc::clone(&seen),
        }));
        let handler_dyn: Rc<RefCell<dyn EventHandler>> = handler.clone();
        let weak: Weak<RefCell<dyn EventHandler>> = Rc::downgrade(&handler_dyn);
        let token = base.add(weak);
        base.arm(token, -1, None, Some(Duration::from_millis(5)))
            .unwrap();
        base.dispatch();
        assert!(seen.get() > 0);
    }
}
