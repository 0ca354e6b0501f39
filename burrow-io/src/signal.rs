//! Signal delivery through the event loop.
//!
//! Binding installs a minimal async-signal-safe handler that writes the
//! signal number into a non-blocking pipe; the owning base drains the
//! pipe on the loop thread and invokes the bound callback there, never
//! from the asynchronous signal context. The OS signal table is
//! process-wide, so only the one base created with signal handling may
//! carry signal sets.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use log::{error, trace};
use mio::Interest;

use crate::base::{EventBase, EventHandler, Readiness};
use crate::error::{Error, Result};

/// Write end of the wakeup pipe, shared with the signal context.
static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);
/// Claimed by the one base that handles signals.
static SIGNAL_CLAIM: AtomicBool = AtomicBool::new(false);

extern "C" fn wakeup_on_signal(sig: libc::c_int) {
    let fd = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = sig as u8;
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

fn new_pipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as libc::c_int; 2];
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        for fd in fds {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
            unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) };
        }
    }
    Ok((fds[0], fds[1]))
}

type SignalCallback = Rc<RefCell<dyn FnMut(i32)>>;

pub(crate) struct SignalTable {
    pipe_rd: RawFd,
    pipe_wr: RawFd,
    bound: HashMap<i32, Weak<RefCell<dyn FnMut(i32)>>>,
    // Keeps the registered drain handler alive for the base's lifetime.
    _drain: Rc<RefCell<PipeDrain>>,
}

impl Drop for SignalTable {
    fn drop(&mut self) {
        SIGNAL_PIPE_WR.store(-1, Ordering::SeqCst);
        unsafe {
            libc::close(self.pipe_wr);
            libc::close(self.pipe_rd);
        }
        SIGNAL_CLAIM.store(false, Ordering::SeqCst);
    }
}

/// Drains the wakeup pipe and dispatches signal numbers.
struct PipeDrain {
    base: EventBase,
    pipe_rd: RawFd,
}

impl EventHandler for PipeDrain {
    fn handle_event(&mut self, ev: Readiness) {
        if !ev.readable {
            return;
        }
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.pipe_rd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                for &byte in &buf[..n as usize] {
                    self.dispatch_signal(byte as i32);
                }
                continue;
            }
            if n == 0 {
                return;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return,
                _ => {
                    error!("signal pipe read: {err}");
                    return;
                }
            }
        }
    }
}

impl PipeDrain {
    fn dispatch_signal(&self, sig: i32) {
        let callback = {
            let inner = self.base.inner().borrow();
            inner
                .signals
                .as_ref()
                .and_then(|table| table.bound.get(&sig))
                .and_then(Weak::upgrade)
        };
        match callback {
            Some(callback) => (callback.borrow_mut())(sig),
            None => trace!("signal {sig} arrived with no bound handler"),
        }
    }
}

/// Claim the process signal table for `base` and start draining the
/// wakeup pipe through its loop.
pub(crate) fn install_pipe(base: &EventBase) -> Result<()> {
    if SIGNAL_CLAIM
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(Error::SignalsClaimed);
    }
    let (pipe_rd, pipe_wr) = match new_pipe() {
        Ok(p) => p,
        Err(e) => {
            SIGNAL_CLAIM.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
    };
    SIGNAL_PIPE_WR.store(pipe_wr, Ordering::SeqCst);
    let drain = Rc::new(RefCell::new(PipeDrain {
        base: base.clone(),
        pipe_rd,
    }));
    let drain_dyn: Rc<RefCell<dyn EventHandler>> = drain.clone();
    let handler: Weak<RefCell<dyn EventHandler>> = Rc::downgrade(&drain_dyn);
    let token = base.add(handler);
    base.inner().borrow_mut().signals = Some(SignalTable {
        pipe_rd,
        pipe_wr,
        bound: HashMap::new(),
        _drain: drain,
    });
    base.arm(token, pipe_rd, Some(Interest::READABLE), None)?;
    Ok(())
}

impl EventBase {
    fn bind_signal(&self, sig: i32, callback: Weak<RefCell<dyn FnMut(i32)>>) -> Result<()> {
        let mut inner = self.inner().borrow_mut();
        let table = inner.signals.as_mut().ok_or(Error::SignalsDisabled)?;
        table.bound.insert(sig, callback);
        Ok(())
    }

    fn unbind_signal(&self, sig: i32) {
        if let Some(table) = self.inner().borrow_mut().signals.as_mut() {
            table.bound.remove(&sig);
        }
    }
}

/// Binds OS signals to one callback through a base.
///
/// Signals stay bound until the set is dropped, which restores the
/// default disposition for every signal it bound.
pub struct SignalSet {
    base: EventBase,
    callback: SignalCallback,
    bound: Vec<i32>,
}

impl SignalSet {
    pub fn create(base: &EventBase, callback: impl FnMut(i32) + 'static) -> SignalSet {
        SignalSet {
            base: base.clone(),
            callback: Rc::new(RefCell::new(callback)),
            bound: Vec::new(),
        }
    }

    /// Route `sig` to this set's callback. The callback runs on the
    /// loop thread once the pipe surfaces the signal.
    pub fn bind(&mut self, sig: i32) -> Result<()> {
        let callback: Weak<RefCell<dyn FnMut(i32)>> = Rc::downgrade(&self.callback);
        self.base.bind_signal(sig, callback)?;
        let trampoline: extern "C" fn(libc::c_int) = wakeup_on_signal;
        let mut act: libc::sigaction = unsafe { mem::zeroed() };
        act.sa_sigaction = trampoline as usize;
        act.sa_flags = libc::SA_RESTART;
        unsafe {
            libc::sigemptyset(&mut act.sa_mask);
        }
        if unsafe { libc::sigaction(sig, &act, ptr::null_mut()) } != 0 {
            self.base.unbind_signal(sig);
            return Err(io::Error::last_os_error().into());
        }
        self.bound.push(sig);
        Ok(())
    }
}

impl Drop for SignalSet {
    fn drop(&mut self) {
        for &sig in &self.bound {
            let mut act: libc::sigaction = unsafe { mem::zeroed() };
            act.sa_sigaction = libc::SIG_DFL;
            unsafe {
                libc::sigemptyset(&mut act.sa_mask);
                libc::sigaction(sig, &act, ptr::null_mut());
            }
            self.base.unbind_signal(sig);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_claim_per_process() {
        let first = EventBase::create(true).unwrap();
        assert!(matches!(EventBase::create(true), Err(Error::SignalsClaimed)));
        drop(first);
        let again = EventBase::create(true);
        assert!(again.is_ok());
    }

    #[test]
    fn test_bind_needs_signal_base() {
        let base = EventBase::create(false).unwrap();
        let mut set = SignalSet::create(&base, |_| {});
        assert!(matches!(
            set.bind(libc::SIGUSR2),
            Err(Error::SignalsDisabled)
        ));
    }
}
