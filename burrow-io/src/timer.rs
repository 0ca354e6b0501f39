use std::cell::RefCell;
use std::mem;
use std::rc::{Rc, Weak};
use std::time::Duration;

use log::error;
use mio::Token;

use crate::base::{EventBase, EventHandler, Readiness};

struct TimerInner {
    enabled: bool,
    callback: Box<dyn FnMut()>,
}

impl EventHandler for TimerInner {
    fn handle_event(&mut self, ev: Readiness) {
        if !ev.timed_out {
            return;
        }
        self.enabled = false;
        (self.callback)();
    }
}

/// One-shot timer bound to a base.
///
/// Firing clears the enabled flag and then runs the callback, so the
/// callback observes `is_set() == false` and may re-arm. Dropping the
/// timer unbinds it.
pub struct Timer {
    base: EventBase,
    token: Token,
    inner: Rc<RefCell<TimerInner>>,
}

impl Timer {
    pub fn create(base: &EventBase, callback: impl FnMut() + 'static) -> Timer {
        let inner = Rc::new(RefCell::new(TimerInner {
            enabled: false,
            callback: Box::new(callback),
        }));
        let inner_dyn: Rc<RefCell<dyn EventHandler>> = inner.clone();
        let handler: Weak<RefCell<dyn EventHandler>> = Rc::downgrade(&inner_dyn);
        let token = base.add(handler);
        Timer {
            base: base.clone(),
            token,
            inner,
        }
    }

    /// Arm the timer. An already-armed timer is disabled first; the
    /// deadline is re-established so the loop sees the new duration.
    pub fn set(&self, duration: Duration) {
        if self.inner.borrow().enabled {
            self.disable();
        }
        if let Err(e) = self.base.arm(self.token, -1, None, Some(duration)) {
            error!("timer set: {e}");
            return;
        }
        self.inner.borrow_mut().enabled = true;
    }

    pub fn disable(&self) {
        if let Err(e) = self.base.disarm(self.token) {
            error!("timer disable: {e}");
        }
        self.inner.borrow_mut().enabled = false;
    }

    pub fn is_set(&self) -> bool {
        self.inner.borrow().enabled
    }

    /// Approximate heap footprint, for operational accounting.
    pub fn get_mem(&self) -> usize {
        mem::size_of::<Timer>() + mem::size_of::<TimerInner>()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.disable();
        self.base.remove(self.token);
    }
}
