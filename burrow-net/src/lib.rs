//! DNS transport endpoints for the burrow event loop.
//!
//! A comm point couples one socket descriptor with its event
//! registration and drives the transport-level state the resolver
//! itself stays out of: datagram batching, the two-byte length framing
//! on streams, per-connection timeouts, the preallocated TCP handler
//! pool behind a listening socket, and source-interface pinning for
//! UDP replies on multi-homed hosts.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Resolver callbacks                       │
//! │        (parse query, produce reply, return true/false)      │
//! └──────────────▲──────────────────────────┬───────────────────┘
//!                │ CommCallback::event      │ send_reply / drop_reply
//! ┌──────────────┴──────────────────────────▼───────────────────┐
//! │                        CommPoint                            │
//! │  udp batch · tcp framing · accept pool · ancillary replies  │
//! └──────────────────────────┬──────────────────────────────────┘
//!                            │ arm / disarm / handle_event
//! ┌──────────────────────────▼──────────────────────────────────┐
//! │                   burrow-io EventBase                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Callbacks run on the loop thread and may close or re-point their
//! own comm point; the dispatch paths re-check descriptor identity
//! after every callback before touching the point again.

pub mod ancil;
pub mod buffer;
pub mod comm;
pub mod errors;
mod sys;

pub use ancil::PktInfo;
pub use buffer::SizedBuffer;
pub use comm::{
    Comm, CommCallback, CommPoint, ListenTimeout, NetEvent, ReplyInfo, NUM_UDP_PER_WAKEUP,
    TCP_QUERY_TIMEOUT,
};
pub use errors::{NetworkError, Result};
