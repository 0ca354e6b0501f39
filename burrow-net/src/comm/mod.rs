//! Comm points: socket endpoints and their event registrations.
//!
//! A comm point owns one descriptor in one of seven roles (UDP with or
//! without ancillary data, TCP accept, pooled TCP handler, outbound
//! TCP, local stream, raw) and turns readiness notifications into
//! resolver callbacks, sending prepared replies synchronously when the
//! callback asks for it.

mod tcp;
mod udp;

use std::cell::RefCell;
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use burrow_io::{EventBase, EventHandler, Readiness};
use log::{error, trace};
use mio::{Interest, Token};

use crate::ancil::PktInfo;
use crate::buffer::SizedBuffer;
use crate::errors::Result;
use crate::sys;

/// The TCP reading or writing query timeout.
pub const TCP_QUERY_TIMEOUT: Duration = Duration::from_secs(120);
/// Receive attempts per UDP readable wakeup, so one busy socket cannot
/// starve the rest of the loop.
pub const NUM_UDP_PER_WAKEUP: usize = 100;
/// Smallest framed payload accepted from remote stream peers.
const DNS_HEADER_SIZE: usize = 12;

/// Why a callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    /// A complete message is in the buffer.
    NoError,
    /// The peer closed the connection.
    Closed,
    /// The per-connection timeout fired.
    TimedOut,
    /// Reserved for spoofed-answer fallback handling.
    CapsFail,
}

/// Peer description handed to callbacks and used to send the reply.
pub struct ReplyInfo {
    pub addr: Option<SocketAddr>,
    /// Source-interface capture for UDP; `PktInfo::None` elsewhere.
    pub src: PktInfo,
}

/// A resolver-side callback attached to a comm point.
///
/// On `NetEvent::NoError` the buffer holds a complete message and the
/// return value decides the reply: `true` means the buffer now contains
/// a response to send, `false` drops it (or the owner answers later
/// through `send_reply`). On `Closed` and `TimedOut` the reply
/// descriptor is absent and the return value is ignored.
pub trait CommCallback {
    fn event(&mut self, c: &mut CommPoint, ev: NetEvent, reply: Option<&mut ReplyInfo>) -> bool;
}

impl<F> CommCallback for F
where
    F: FnMut(&mut CommPoint, NetEvent, Option<&mut ReplyInfo>) -> bool,
{
    fn event(&mut self, c: &mut CommPoint, ev: NetEvent, reply: Option<&mut ReplyInfo>) -> bool {
        self(c, ev, reply)
    }
}

/// Shared handle on a comm point, as handed out by the constructors.
pub type Comm = Rc<RefCell<CommPoint>>;

type Callback = Rc<RefCell<dyn CommCallback>>;

/// Timeout argument for `start_listening`.
#[derive(Debug, Clone, Copy)]
pub enum ListenTimeout {
    /// Re-arm with the timeout already stored on the point.
    Keep,
    /// Listen without a timeout.
    Off,
    /// Store and arm a new timeout.
    Set(Duration),
}

pub(crate) enum Role {
    Udp {
        ancillary: bool,
    },
    TcpAccept {
        handlers: Vec<Comm>,
        /// Stack of idle handler indices. Empty means accept is paused.
        free: Vec<usize>,
    },
    TcpHandler {
        parent: Weak<RefCell<CommPoint>>,
        index: usize,
    },
    TcpOut,
    Local,
    Raw {
        writing: bool,
    },
}

/// Framing state shared by the stream roles.
#[derive(Default)]
pub(crate) struct TcpState {
    /// Reading a query, as opposed to writing a reply.
    pub is_reading: bool,
    /// Bytes of the current direction transferred so far, counting the
    /// two-byte length prefix before the payload.
    pub byte_count: usize,
    /// Completing one direction flips to the other.
    pub do_toggle_rw: bool,
    /// First writable event must consult SO_ERROR.
    pub check_nb_connect: bool,
    /// Suppress the terminal callback on close and timeout.
    pub do_close: bool,
}

/// One socket endpoint and its event registration.
pub struct CommPoint {
    pub(crate) base: EventBase,
    pub(crate) token: Token,
    /// Descriptor, -1 when closed.
    pub(crate) fd: RawFd,
    pub(crate) buffer: Option<SizedBuffer>,
    pub(crate) timeout: Option<Duration>,
    /// Leave the descriptor open on close; the owner manages it.
    pub(crate) do_not_close: bool,
    pub(crate) tcp: TcpState,
    pub(crate) role: Role,
    pub(crate) callback: Option<Callback>,
    /// Remote address of the current exchange.
    pub(crate) peer: Option<SocketAddr>,
}

impl EventHandler for CommPoint {
    fn handle_event(&mut self, ev: Readiness) {
        match self.role {
            Role::Udp { ancillary } => self.udp_event(ev, ancillary),
            Role::TcpAccept { .. } => self.accept_event(ev),
            Role::TcpHandler { .. } | Role::TcpOut => self.tcp_event(ev),
            Role::Local => self.local_event(ev),
            Role::Raw { .. } => self.raw_event(ev),
        }
    }
}

fn new_point(
    base: &EventBase,
    role: Role,
    fd: RawFd,
    buffer: Option<SizedBuffer>,
    callback: Option<Callback>,
) -> Comm {
    Rc::new_cyclic(|weak: &Weak<RefCell<CommPoint>>| {
        let handler: Weak<RefCell<dyn EventHandler>> = weak.clone();
        let token = base.add(handler);
        RefCell::new(CommPoint {
            base: base.clone(),
            token,
            fd,
            buffer,
            timeout: None,
            do_not_close: false,
            tcp: TcpState::default(),
            role,
            callback,
            peer: None,
        })
    })
}

impl CommPoint {
    /// UDP endpoint. Delivers each datagram to the callback and sends
    /// the buffer back to the peer when it returns true. The descriptor
    /// must already be non-blocking.
    pub fn create_udp(
        base: &EventBase,
        fd: RawFd,
        buffer: SizedBuffer,
        callback: impl CommCallback + 'static,
    ) -> Result<Comm> {
        let c = new_point(
            base,
            Role::Udp { ancillary: false },
            fd,
            Some(buffer),
            Some(Rc::new(RefCell::new(callback))),
        );
        let token = c.borrow().token;
        if fd != -1 {
            base.arm(token, fd, Some(Interest::READABLE), None)?;
        }
        Ok(c)
    }

    /// UDP endpoint that captures pktinfo on receive and pins replies
    /// to the same source interface. The socket must have the matching
    /// pktinfo option enabled.
    pub fn create_udp_ancil(
        base: &EventBase,
        fd: RawFd,
        buffer: SizedBuffer,
        callback: impl CommCallback + 'static,
    ) -> Result<Comm> {
        let c = new_point(
            base,
            Role::Udp { ancillary: true },
            fd,
            Some(buffer),
            Some(Rc::new(RefCell::new(callback))),
        );
        let token = c.borrow().token;
        if fd != -1 {
            base.arm(token, fd, Some(Interest::READABLE), None)?;
        }
        Ok(c)
    }

    /// TCP accept endpoint with `num` preallocated handlers, each with
    /// its own buffer of `bufsize` bytes. The callback is shared by the
    /// handlers; the accept point itself has none.
    pub fn create_tcp(
        base: &EventBase,
        fd: RawFd,
        num: usize,
        bufsize: usize,
        callback: impl CommCallback + 'static,
    ) -> Result<Comm> {
        let callback: Callback = Rc::new(RefCell::new(callback));
        let accept = new_point(
            base,
            Role::TcpAccept {
                handlers: Vec::with_capacity(num),
                free: Vec::with_capacity(num),
            },
            fd,
            None,
            None,
        );
        let token = accept.borrow().token;
        base.arm(token, fd, Some(Interest::READABLE), None)?;
        for index in 0..num {
            let handler = Self::new_tcp_handler(base, &accept, index, bufsize, Rc::clone(&callback));
            let mut a = accept.borrow_mut();
            let Role::TcpAccept { handlers, free } = &mut a.role else {
                unreachable!()
            };
            handlers.push(handler);
            free.push(index);
        }
        Ok(accept)
    }

    fn new_tcp_handler(
        base: &EventBase,
        parent: &Comm,
        index: usize,
        bufsize: usize,
        callback: Callback,
    ) -> Comm {
        let c = new_point(
            base,
            Role::TcpHandler {
                parent: Rc::downgrade(parent),
                index,
            },
            -1,
            Some(SizedBuffer::new(bufsize)),
            Some(callback),
        );
        {
            let mut h = c.borrow_mut();
            h.timeout = Some(TCP_QUERY_TIMEOUT);
            h.tcp.do_toggle_rw = true;
        }
        c
    }

    /// Outbound TCP endpoint. Created without a descriptor; the caller
    /// connects a non-blocking socket and hands it over with
    /// `start_listening`, after which the first writable event checks
    /// the pending connect error.
    pub fn create_tcp_out(
        base: &EventBase,
        bufsize: usize,
        callback: impl CommCallback + 'static,
    ) -> Result<Comm> {
        let c = new_point(
            base,
            Role::TcpOut,
            -1,
            Some(SizedBuffer::new(bufsize)),
            Some(Rc::new(RefCell::new(callback))),
        );
        {
            let mut p = c.borrow_mut();
            p.tcp.do_toggle_rw = true;
            p.tcp.check_nb_connect = true;
        }
        Ok(c)
    }

    /// Stream endpoint for a local control channel: same framing as
    /// TCP but without the minimum-size check, purely inbound, and the
    /// descriptor stays open for its owner.
    pub fn create_local(
        base: &EventBase,
        fd: RawFd,
        bufsize: usize,
        callback: impl CommCallback + 'static,
    ) -> Result<Comm> {
        let c = new_point(
            base,
            Role::Local,
            fd,
            Some(SizedBuffer::new(bufsize)),
            Some(Rc::new(RefCell::new(callback))),
        );
        let token = {
            let mut p = c.borrow_mut();
            p.tcp.is_reading = true;
            p.do_not_close = true;
            p.token
        };
        base.arm(token, fd, Some(Interest::READABLE), None)?;
        Ok(c)
    }

    /// Raw endpoint: every event, timeouts included, goes straight to
    /// the callback with no buffering or framing.
    pub fn create_raw(
        base: &EventBase,
        fd: RawFd,
        writing: bool,
        callback: impl CommCallback + 'static,
    ) -> Result<Comm> {
        let c = new_point(
            base,
            Role::Raw { writing },
            fd,
            None,
            Some(Rc::new(RefCell::new(callback))),
        );
        c.borrow_mut().do_not_close = true;
        let token = c.borrow().token;
        let interest = if writing {
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        base.arm(token, fd, Some(interest), None)?;
        Ok(c)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn buffer(&self) -> Option<&SizedBuffer> {
        self.buffer.as_ref()
    }

    pub fn buffer_mut(&mut self) -> Option<&mut SizedBuffer> {
        self.buffer.as_mut()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Record the remote address, for outbound points whose peer is
    /// known to the caller rather than learned from accept.
    pub fn set_peer(&mut self, addr: SocketAddr) {
        self.peer = Some(addr);
    }

    /// Skip the terminal callback when the connection closes or times
    /// out.
    pub fn set_tcp_do_close(&mut self, do_close: bool) {
        self.tcp.do_close = do_close;
    }

    /// Deregister and close the descriptor, unless the point is marked
    /// do-not-close, in which case the descriptor is merely forgotten.
    pub fn close(&mut self) {
        if self.fd != -1 {
            if let Err(e) = self.base.disarm(self.token) {
                error!("could not disarm on close: {e}");
            }
            if !self.do_not_close {
                trace!("close fd {}", self.fd);
                sys::close(self.fd);
            }
        }
        self.fd = -1;
    }

    /// Stop readiness and timeout notifications, keeping the
    /// registration slot for a later `start_listening`.
    pub fn stop_listening(&mut self) {
        trace!("comm point stop listening {}", self.fd);
        if let Err(e) = self.base.disarm(self.token) {
            error!("could not disarm to stop listening: {e}");
        }
    }

    fn listen_interest(&self) -> Interest {
        match &self.role {
            Role::TcpHandler { .. } | Role::TcpOut => {
                if self.tcp.is_reading {
                    Interest::READABLE
                } else {
                    Interest::WRITABLE
                }
            }
            Role::Raw { writing: true } => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }

    /// (Re)register for the direction the role is in. `newfd` replaces
    /// the descriptor, closing any old one. An accept point with no
    /// idle handlers stays paused.
    pub fn start_listening(&mut self, newfd: Option<RawFd>, timeout: ListenTimeout) {
        trace!(
            "comm point start listening {}",
            if self.fd == -1 {
                newfd.unwrap_or(-1)
            } else {
                self.fd
            }
        );
        if let Role::TcpAccept { free, .. } = &self.role {
            if free.is_empty() {
                // no use to start listening, no free slots
                return;
            }
        }
        let arm_timeout = match timeout {
            ListenTimeout::Set(d) => {
                self.timeout = Some(d);
                Some(d)
            }
            ListenTimeout::Keep => self.timeout,
            ListenTimeout::Off => None,
        };
        if let Some(newfd) = newfd {
            if self.fd != -1 {
                sys::close(self.fd);
            }
            self.fd = newfd;
        }
        if self.fd == -1 {
            error!("start listening without a descriptor");
            return;
        }
        if let Err(e) = self
            .base
            .arm(self.token, self.fd, Some(self.listen_interest()), arm_timeout)
        {
            error!("could not arm to start listening: {e}");
        }
    }

    /// Listen for an explicit readiness set, keeping the stored
    /// timeout armed.
    pub fn listen_for_rw(&mut self, rd: bool, wr: bool) {
        trace!("comm point listen_for_rw {} {}", self.fd, wr);
        let interest = match (rd, wr) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => {
                self.stop_listening();
                return;
            }
        };
        if let Err(e) = self
            .base
            .arm(self.token, self.fd, Some(interest), self.timeout)
        {
            error!("could not arm for listen_for_rw: {e}");
        }
    }

    /// Send the reply the callback prepared in the buffer.
    ///
    /// UDP replies leave immediately, through the ancillary path when a
    /// source interface was captured. TCP replies re-arm the connection
    /// for writing under the query timeout.
    pub fn send_reply(&mut self, reply: &ReplyInfo) {
        match self.role {
            Role::Udp { .. } => {
                let Some(addr) = reply.addr else {
                    error!("udp reply without a peer address");
                    return;
                };
                if reply.src.srctype() != 0 {
                    self.send_udp_ancil(&addr, &reply.src);
                } else {
                    self.send_udp(&addr);
                }
            }
            _ => self.start_listening(None, ListenTimeout::Set(TCP_QUERY_TIMEOUT)),
        }
    }

    /// Discard a reply: nothing to do for UDP, reclaim the handler for
    /// TCP.
    pub fn drop_reply(&mut self, _reply: &ReplyInfo) {
        debug_assert!(!matches!(self.role, Role::TcpAccept { .. }));
        if matches!(self.role, Role::Udp { .. }) {
            return;
        }
        self.reclaim();
    }

    pub(crate) fn invoke_callback(
        &mut self,
        ev: NetEvent,
        reply: Option<&mut ReplyInfo>,
    ) -> bool {
        let Some(callback) = self.callback.clone() else {
            return false;
        };
        let result = callback.borrow_mut().event(self, ev, reply);
        result
    }

    /// Approximate heap footprint of the point, its buffer, and for
    /// accept points the whole handler pool.
    pub fn get_mem(&self) -> usize {
        let mut total = mem::size_of::<CommPoint>();
        if let Some(buffer) = &self.buffer {
            total += buffer.capacity();
        }
        if let Role::TcpAccept { handlers, free } = &self.role {
            total += handlers.capacity() * mem::size_of::<Comm>();
            total += free.capacity() * mem::size_of::<usize>();
            for handler in handlers {
                total += handler.borrow().get_mem();
            }
        }
        total
    }
}

impl Drop for CommPoint {
    fn drop(&mut self) {
        self.close();
        self.base.remove(self.token);
    }
}

pub(crate) fn retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drop_all(_c: &mut CommPoint, _ev: NetEvent, _reply: Option<&mut ReplyInfo>) -> bool {
        false
    }

    #[test]
    fn test_get_mem_counts_pool() {
        let base = EventBase::create(false).unwrap();
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let fd = std::os::unix::io::IntoRawFd::into_raw_fd(listener);
        let accept = CommPoint::create_tcp(&base, fd, 4, 512, drop_all).unwrap();
        let total = accept.borrow().get_mem();
        // Four handler buffers dominate the accounting.
        assert!(total >= 4 * 512);
        let single = CommPoint::create_tcp_out(&base, 512, drop_all).unwrap();
        let single_mem = single.borrow().get_mem();
        assert!(single_mem >= 512);
        assert!(total > single_mem);
    }

    #[test]
    fn test_close_forgets_fd() {
        let base = EventBase::create(false).unwrap();
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let fd = std::os::unix::io::IntoRawFd::into_raw_fd(socket);
        let c = CommPoint::create_udp(&base, fd, SizedBuffer::new(512), drop_all).unwrap();
        assert_eq!(c.borrow().fd(), fd);
        c.borrow_mut().close();
        assert_eq!(c.borrow().fd(), -1);
    }

    #[test]
    fn test_stop_start_listening_roundtrip() {
        let base = EventBase::create(false).unwrap();
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let fd = std::os::unix::io::IntoRawFd::into_raw_fd(socket);
        let c = CommPoint::create_udp(&base, fd, SizedBuffer::new(512), drop_all).unwrap();
        let mut p = c.borrow_mut();
        p.stop_listening();
        p.start_listening(None, ListenTimeout::Off);
        assert_eq!(p.fd(), fd);
        // A second stop/start pair must behave the same.
        p.stop_listening();
        p.start_listening(None, ListenTimeout::Off);
        assert_eq!(p.fd(), fd);
    }
}
