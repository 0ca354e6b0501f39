//! Minimal datagram echo service on the event loop.
//!
//! Every datagram that arrives is handed to the callback, which leaves
//! the buffer untouched and returns true, so the core sends it
//! straight back to the peer. SIGINT and SIGTERM stop the loop.
//!
//! Run with: cargo run --example udp_echo -- 127.0.0.1:5553

use std::env;
use std::net::UdpSocket;
use std::os::unix::io::IntoRawFd;

use burrow_io::{EventBase, SignalSet};
use burrow_net::{CommPoint, NetEvent, ReplyInfo, SizedBuffer};
use log::info;

fn main() {
    env_logger::init();
    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5553".to_string());

    let socket = UdpSocket::bind(&addr).expect("bind echo socket");
    socket.set_nonblocking(true).expect("set non-blocking");
    info!("echoing datagrams on {addr}");

    let base = EventBase::create(true).expect("create event base");
    let time = base.time();
    let _point = CommPoint::create_udp(
        &base,
        socket.into_raw_fd(),
        SizedBuffer::new(65535),
        move |c: &mut CommPoint, ev: NetEvent, reply: Option<&mut ReplyInfo>| {
            if ev != NetEvent::NoError {
                return false;
            }
            let peer = reply.and_then(|r| r.addr);
            info!(
                "[{}] {} bytes from {:?}",
                time.secs(),
                c.buffer().map_or(0, |b| b.remaining()),
                peer,
            );
            true
        },
    )
    .expect("create udp comm point");

    let stop = base.clone();
    let mut signals = SignalSet::create(&base, move |sig| {
        info!("signal {sig}, shutting down");
        stop.exit();
    });
    signals.bind(libc::SIGINT).expect("bind SIGINT");
    signals.bind(libc::SIGTERM).expect("bind SIGTERM");

    base.dispatch();
}
