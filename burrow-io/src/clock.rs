use std::cell::Cell;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::error;

/// Wall-clock snapshot, seconds and microseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i32,
}

/// Current time cached by an event base.
///
/// The base refreshes the cache once per loop wakeup, before any
/// callback of that batch runs, so callbacks read the time without a
/// syscall. Downstream TTL arithmetic tolerates the one-wakeup quantum
/// of skew this introduces.
pub struct CachedClock {
    secs: Cell<u32>,
    now: Cell<Timeval>,
}

/// Shared read handle on a base's cached clock.
pub type TimeHandle = Rc<CachedClock>;

impl CachedClock {
    pub(crate) fn new() -> TimeHandle {
        let clock = Rc::new(CachedClock {
            secs: Cell::new(0),
            now: Cell::new(Timeval::default()),
        });
        clock.refresh();
        clock
    }

    /// Re-read the wall clock into the cache.
    pub fn refresh(&self) {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => {
                self.secs.set(d.as_secs() as u32);
                self.now.set(Timeval {
                    sec: d.as_secs() as i64,
                    usec: d.subsec_micros() as i32,
                });
            }
            Err(e) => error!("gettimeofday: {e}"),
        }
    }

    /// Cached whole seconds.
    pub fn secs(&self) -> u32 {
        self.secs.get()
    }

    /// Cached seconds and microseconds.
    pub fn now(&self) -> Timeval {
        self.now.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_tracks_wall_clock() {
        let clock = CachedClock::new();
        assert!(clock.secs() > 0);
        let before = clock.now();
        clock.refresh();
        let after = clock.now();
        assert!(after.sec >= before.sec);
        assert_eq!(after.sec as u32, clock.secs());
    }

    #[test]
    fn test_usec_in_range() {
        let clock = CachedClock::new();
        assert!(clock.now().usec < 1_000_000);
    }
}
