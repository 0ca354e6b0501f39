//! TCP accept pool and the length-prefixed framing state machine.
//!
//! Each connection carries one framed DNS message per direction: a
//! two-byte big-endian length, then the payload. A pooled handler
//! reads a query, hands it to the callback, writes the reply, and
//! loops back to reading until the peer closes or the query timeout
//! fires, at which point it is reclaimed into its parent's free list.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use burrow_io::Readiness;
use log::{debug, error, info, trace, warn};

use crate::ancil::PktInfo;
use crate::comm::{
    retryable, CommPoint, ListenTimeout, NetEvent, ReplyInfo, Role, DNS_HEADER_SIZE,
    TCP_QUERY_TIMEOUT,
};
use crate::sys;

impl CommPoint {
    /// Prepare a pooled handler for a freshly accepted connection.
    fn setup_tcp(&mut self, fd: RawFd) {
        debug_assert!(self.fd == -1);
        self.buffer
            .as_mut()
            .expect("tcp handler without buffer")
            .clear();
        self.tcp.is_reading = true;
        self.tcp.byte_count = 0;
        self.start_listening(Some(fd), ListenTimeout::Keep);
    }

    fn perform_accept(&mut self) -> Option<(RawFd, SocketAddr)> {
        match sys::accept(self.fd) {
            Ok((fd, addr)) => {
                if let Err(e) = sys::set_nonblocking(fd) {
                    error!("cannot set non-blocking: {e}");
                }
                Some((fd, addr))
            }
            Err(e) => {
                // EINTR is signal interrupt; the others are connections
                // that went away between readiness and accept.
                let code = e.raw_os_error().unwrap_or(0);
                let quiet = code == libc::EINTR
                    || code == libc::EAGAIN
                    || code == libc::EWOULDBLOCK
                    || code == libc::ECONNABORTED
                    || code == libc::EPROTO;
                if !quiet {
                    error!("accept failed: {e}");
                }
                None
            }
        }
    }

    pub(crate) fn accept_event(&mut self, ev: Readiness) {
        if !ev.readable {
            info!("ignoring tcp accept event");
            return;
        }
        // Drain the backlog: an edge-triggered poll only reports new
        // arrivals, not connections already queued.
        loop {
            let child = {
                let Role::TcpAccept { handlers, free } = &self.role else {
                    error!("accept event on non-accept comm point");
                    return;
                };
                match free.last() {
                    Some(&index) => Rc::clone(&handlers[index]),
                    None => {
                        warn!("accepted too many tcp, connections full");
                        return;
                    }
                }
            };
            let Some((fd, addr)) = self.perform_accept() else {
                return;
            };
            let now_empty = {
                let Role::TcpAccept { free, .. } = &mut self.role else {
                    unreachable!()
                };
                free.pop();
                free.is_empty()
            };
            {
                let mut handler = child.borrow_mut();
                handler.peer = Some(addr);
                handler.setup_tcp(fd);
            }
            if now_empty {
                // Out of handlers; pause accepting until one returns.
                self.stop_listening();
                return;
            }
        }
    }

    /// Close and return this handler to its parent's free list,
    /// resuming accept when the list was empty.
    pub(crate) fn reclaim(&mut self) {
        self.close();
        if let Role::TcpHandler { parent, index } = &self.role {
            let index = *index;
            if let Some(parent) = parent.upgrade() {
                let mut parent = parent.borrow_mut();
                let was_empty = {
                    let Role::TcpAccept { free, .. } = &mut parent.role else {
                        error!("tcp handler with non-accept parent");
                        return;
                    };
                    let was_empty = free.is_empty();
                    free.push(index);
                    was_empty
                };
                if was_empty {
                    parent.start_listening(None, ListenTimeout::Keep);
                }
            }
        }
    }

    /// A complete message was read; flip to the callback and, when it
    /// prepared a reply, to writing.
    fn tcp_reader_done(&mut self) {
        self.buffer
            .as_mut()
            .expect("stream comm point without buffer")
            .flip();
        if self.tcp.do_toggle_rw {
            self.tcp.is_reading = false;
        }
        self.tcp.byte_count = 0;
        let local = matches!(self.role, Role::Local);
        if !local {
            self.stop_listening();
        }
        let mut reply = ReplyInfo {
            addr: self.peer,
            src: PktInfo::None,
        };
        if self.invoke_callback(NetEvent::NoError, Some(&mut reply)) {
            self.start_listening(None, ListenTimeout::Set(TCP_QUERY_TIMEOUT));
        } else if local && self.fd != -1 {
            // Edge-triggered readiness will not re-report a message
            // that is already buffered; re-register before reading the
            // next one.
            self.start_listening(None, ListenTimeout::Keep);
        }
    }

    /// A complete message was written; clear and go back to reading.
    fn tcp_writer_done(&mut self) {
        self.buffer
            .as_mut()
            .expect("stream comm point without buffer")
            .clear();
        if self.tcp.do_toggle_rw {
            self.tcp.is_reading = true;
        }
        self.tcp.byte_count = 0;
        // Switch from listening for write to listening for read.
        self.stop_listening();
        self.start_listening(None, ListenTimeout::Keep);
    }

    /// One readable step of the framing machine. False means the
    /// connection is finished, by error or orderly close.
    fn tcp_handle_read(&mut self, short_ok: bool) -> bool {
        if !self.tcp.is_reading {
            return false;
        }
        debug_assert!(self.fd != -1);
        let fd = self.fd;
        if self.tcp.byte_count < 2 {
            // The length prefix comes first.
            let byte_count = self.tcp.byte_count;
            let result = {
                let buffer = self.buffer.as_mut().expect("stream comm point without buffer");
                sys::recv(fd, &mut buffer.raw_mut()[byte_count..2])
            };
            let got = match result {
                Ok(0) => return false,
                Ok(n) => n,
                Err(e) if retryable(&e) => return true,
                Err(e) if e.raw_os_error() == Some(libc::ECONNRESET) => {
                    // Reset by peer happens routinely; stay quiet.
                    debug!("read (in tcp s): {e}");
                    return false;
                }
                Err(e) => {
                    error!(
                        "read (in tcp s): {e}, remote address is {:?}",
                        self.peer
                    );
                    return false;
                }
            };
            self.tcp.byte_count += got;
            if self.tcp.byte_count != 2 {
                return true;
            }
            let buffer = self.buffer.as_mut().expect("stream comm point without buffer");
            let want = buffer.read_u16_at(0) as usize;
            if want > buffer.capacity() {
                debug!("tcp: dropped larger than buffer");
                return false;
            }
            buffer.set_limit(want);
            if !short_ok && want < DNS_HEADER_SIZE {
                debug!("tcp: dropped bogus too short");
                return false;
            }
            trace!("reading tcp query of length {want}");
        }
        let result = {
            let buffer = self.buffer.as_mut().expect("stream comm point without buffer");
            debug_assert!(buffer.remaining() > 0);
            sys::recv(fd, buffer.as_mut_slice())
        };
        let got = match result {
            Ok(0) => return false,
            Ok(n) => n,
            Err(e) if retryable(&e) => return true,
            Err(e) => {
                error!("read (in tcp r): {e}, remote address is {:?}", self.peer);
                return false;
            }
        };
        let buffer = self.buffer.as_mut().expect("stream comm point without buffer");
        buffer.skip(got);
        if buffer.remaining() == 0 {
            self.tcp_reader_done();
        }
        true
    }

    /// One writable step of the framing machine. False means the
    /// connection is finished.
    fn tcp_handle_write(&mut self) -> bool {
        if self.tcp.is_reading {
            return false;
        }
        debug_assert!(self.fd != -1);
        let fd = self.fd;
        if self.tcp.byte_count == 0 && self.tcp.check_nb_connect {
            // Pending error from the non-blocking connect.
            let err = sys::take_socket_error(fd);
            if err == libc::EINPROGRESS || err == libc::EWOULDBLOCK {
                return true; // try again later
            }
            if err == libc::ECONNREFUSED || err == libc::EHOSTUNREACH || err == libc::EHOSTDOWN {
                // Common enough to flood logs; stay quiet.
                debug!("tcp connect: {}", io::Error::from_raw_os_error(err));
                return false;
            }
            if err != 0 {
                error!(
                    "tcp connect: {}, remote address is {:?}",
                    io::Error::from_raw_os_error(err),
                    self.peer
                );
                return false;
            }
        }
        if self.tcp.byte_count < 2 {
            let byte_count = self.tcp.byte_count;
            let result = {
                let buffer = self.buffer.as_ref().expect("stream comm point without buffer");
                let prefix = (buffer.limit() as u16).to_be_bytes();
                // Gathered write, so prefix and payload share a segment.
                sys::send_vectored(fd, &prefix[byte_count..], &buffer.raw()[..buffer.limit()])
            };
            let sent = match result {
                Ok(n) => n,
                Err(e) if retryable(&e) => return true,
                Err(e) => {
                    error!("tcp writev: {e}, remote address is {:?}", self.peer);
                    return false;
                }
            };
            self.tcp.byte_count += sent;
            if self.tcp.byte_count < 2 {
                return true;
            }
            let done = {
                let buffer = self.buffer.as_mut().expect("stream comm point without buffer");
                buffer.set_position(self.tcp.byte_count - 2);
                buffer.remaining() == 0
            };
            if done {
                self.tcp_writer_done();
                return true;
            }
        }
        let result = {
            let buffer = self.buffer.as_ref().expect("stream comm point without buffer");
            debug_assert!(buffer.remaining() > 0);
            sys::send(fd, buffer.as_slice())
        };
        let sent = match result {
            Ok(n) => n,
            Err(e) if retryable(&e) => return true,
            Err(e) => {
                error!("tcp send r: {e}, remote address is {:?}", self.peer);
                return false;
            }
        };
        let buffer = self.buffer.as_mut().expect("stream comm point without buffer");
        buffer.skip(sent);
        if buffer.remaining() == 0 {
            self.tcp_writer_done();
        }
        true
    }

    pub(crate) fn tcp_event(&mut self, ev: Readiness) {
        if ev.readable {
            if !self.tcp_handle_read(false) {
                self.tcp_finish(NetEvent::Closed);
            }
            return;
        }
        if ev.writable {
            if !self.tcp_handle_write() {
                self.tcp_finish(NetEvent::Closed);
            }
            return;
        }
        if ev.timed_out {
            debug!("tcp took too long, dropped");
            self.tcp_finish(NetEvent::TimedOut);
            return;
        }
        error!("ignored event for tcp handler");
    }

    /// Reclaim and, unless suppressed, surface the terminal condition.
    fn tcp_finish(&mut self, why: NetEvent) {
        self.reclaim();
        if !self.tcp.do_close {
            let _ = self.invoke_callback(why, None);
        }
    }

    pub(crate) fn local_event(&mut self, ev: Readiness) {
        if ev.readable {
            if !self.tcp_handle_read(true) {
                let _ = self.invoke_callback(NetEvent::Closed, None);
            }
            return;
        }
        error!("ignored event for local stream");
    }

    pub(crate) fn raw_event(&mut self, ev: Readiness) {
        let why = if ev.timed_out {
            NetEvent::TimedOut
        } else {
            NetEvent::NoError
        };
        let _ = self.invoke_callback(why, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Comm;
    use burrow_io::EventBase;
    use std::cell::RefCell;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::IntoRawFd;
    use std::rc::Rc;
    use std::time::Duration;

    fn pool_handler(accept: &Comm, index: usize) -> Comm {
        let point = accept.borrow();
        let Role::TcpAccept { handlers, .. } = &point.role else {
            panic!("not an accept point");
        };
        Rc::clone(&handlers[index])
    }

    fn free_len(accept: &Comm) -> usize {
        let point = accept.borrow();
        let Role::TcpAccept { free, .. } = &point.role else {
            panic!("not an accept point");
        };
        free.len()
    }

    #[test]
    fn test_stalled_connection_times_out_and_is_reclaimed() {
        let base = EventBase::create(false).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let events: Rc<RefCell<Vec<NetEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let events2 = Rc::clone(&events);
        let base2 = base.clone();
        let accept = CommPoint::create_tcp(
            &base,
            listener.into_raw_fd(),
            1,
            512,
            move |_c: &mut CommPoint, ev: NetEvent, _reply: Option<&mut ReplyInfo>| {
                events2.borrow_mut().push(ev);
                base2.exit();
                false
            },
        )
        .unwrap();
        // Shorten the per-query timeout so the test does not sit out
        // the full default.
        pool_handler(&accept, 0).borrow_mut().timeout = Some(Duration::from_millis(50));

        let mut client = TcpStream::connect(addr).unwrap();
        // A prefix promising twenty bytes that never arrive.
        client.write_all(&[0, 20]).unwrap();

        base.dispatch();

        assert_eq!(events.borrow().as_slice(), &[NetEvent::TimedOut]);
        assert_eq!(free_len(&accept), 1, "handler returned to the free list");
        assert_eq!(pool_handler(&accept, 0).borrow().fd(), -1);
    }

    #[test]
    fn test_oversized_frame_is_dropped() {
        let base = EventBase::create(false).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let events: Rc<RefCell<Vec<NetEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let events2 = Rc::clone(&events);
        let base2 = base.clone();
        let accept = CommPoint::create_tcp(
            &base,
            listener.into_raw_fd(),
            1,
            64,
            move |_c: &mut CommPoint, ev: NetEvent, _reply: Option<&mut ReplyInfo>| {
                events2.borrow_mut().push(ev);
                base2.exit();
                false
            },
        )
        .unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        // 300 bytes promised against a 64 byte buffer.
        client.write_all(&[0x01, 0x2c]).unwrap();

        base.dispatch();

        assert_eq!(events.borrow().as_slice(), &[NetEvent::Closed]);
        assert_eq!(free_len(&accept), 1);
    }

    #[test]
    fn test_undersized_frame_is_dropped() {
        let base = EventBase::create(false).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        listener.set_nonblocking(true).unwrap();

        let events: Rc<RefCell<Vec<NetEvent>>> = Rc::new(RefCell::new(Vec::new()));
        let events2 = Rc::clone(&events);
        let base2 = base.clone();
        let _accept = CommPoint::create_tcp(
            &base,
            listener.into_raw_fd(),
            1,
            64,
            move |_c: &mut CommPoint, ev: NetEvent, _reply: Option<&mut ReplyInfo>| {
                events2.borrow_mut().push(ev);
                base2.exit();
                false
            },
        )
        .unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        // Five bytes is below the smallest valid DNS message.
        client.write_all(&[0, 5]).unwrap();
        client.write_all(b"abcde").unwrap();

        base.dispatch();

        assert_eq!(events.borrow().as_slice(), &[NetEvent::Closed]);
    }
}
