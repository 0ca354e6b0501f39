//! Event notification for the burrow resolver.
//!
//! Each resolver thread owns one [`EventBase`]: a single-threaded
//! readiness loop that multiplexes socket descriptors, one-shot timers
//! and OS signals onto handler callbacks. Handlers run inline on the
//! loop thread and must not block; anything long-running has to be
//! chunked by the caller.
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │                 Handler callbacks              │
//! │      (comm points, timers, signal sets)        │
//! └──────────────▲────────────────┬────────────────┘
//!                │ handle_event   │ arm / disarm
//! ┌──────────────┴────────────────▼────────────────┐
//! │                   EventBase                    │
//! │   registry (slab) · deadline wheel · clock     │
//! └──────────────────────┬─────────────────────────┘
//!                        │ poll
//! ┌──────────────────────▼─────────────────────────┐
//! │        mio (epoll / kqueue readiness)          │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! The base also caches the wall clock, refreshed once per wakeup, so
//! callbacks can read the current time without a syscall.

pub mod base;
pub mod clock;
pub mod error;
pub mod signal;
pub mod timer;

pub use base::{EventBase, EventHandler, Readiness};
pub use clock::{CachedClock, TimeHandle, Timeval};
pub use error::{Error, Result};
pub use mio::{Interest, Token};
pub use signal::SignalSet;
pub use timer::Timer;
