//! The UDP receive and reply paths, with and without ancillary data.

use std::net::SocketAddr;

use burrow_io::Readiness;
use log::{debug, error, trace};

use crate::ancil::{self, PktInfo};
use crate::comm::{retryable, CommPoint, ListenTimeout, NetEvent, ReplyInfo, NUM_UDP_PER_WAKEUP};
use crate::sys;

impl CommPoint {
    pub(crate) fn udp_event(&mut self, ev: Readiness, ancillary: bool) {
        if !ev.readable {
            return;
        }
        debug_assert!(self.buffer.is_some());
        debug_assert!(self.fd != -1);
        let fd = self.fd;
        for _ in 0..NUM_UDP_PER_WAKEUP {
            let received = {
                let buffer = self.buffer.as_mut().expect("udp comm point without buffer");
                buffer.clear();
                if ancillary {
                    ancil::recv_msg(fd, buffer.raw_mut())
                } else {
                    sys::recv_from(fd, buffer.raw_mut()).map(|(n, addr)| (n, addr, PktInfo::None))
                }
            };
            let (n, addr, info) = match received {
                Ok(r) => r,
                Err(e) if retryable(&e) => return,
                Err(e) => {
                    if ancillary {
                        error!("recvmsg failed: {e}");
                    } else {
                        error!("recvfrom {fd} failed: {e}");
                    }
                    return;
                }
            };
            let buffer = self.buffer.as_mut().expect("udp comm point without buffer");
            buffer.skip(n);
            buffer.flip();
            if ancillary {
                ancil::trace_ancil("receive_udp on interface", &info);
            }
            let mut reply = ReplyInfo {
                addr: Some(addr),
                src: info,
            };
            if self.invoke_callback(NetEvent::NoError, Some(&mut reply)) {
                // send back immediate reply
                if let Some(addr) = reply.addr {
                    if ancillary {
                        self.send_udp_ancil(&addr, &reply.src);
                    } else {
                        self.send_udp(&addr);
                    }
                }
            }
            if self.fd != fd {
                // The callback closed the point or moved it to another
                // socket; the rest of the batch is not ours.
                return;
            }
        }
        // The batch limit was hit with the socket possibly still
        // readable. Re-register so the edge-triggered poll reports it
        // again on the next wakeup.
        self.start_listening(None, ListenTimeout::Off);
    }

    pub(crate) fn send_udp(&mut self, addr: &SocketAddr) -> bool {
        debug_assert!(self.fd != -1);
        let buffer = self.buffer.as_ref().expect("udp comm point without buffer");
        debug_assert!(buffer.remaining() > 0, "send empty UDP packet");
        match sys::send_to(self.fd, buffer.as_slice(), addr) {
            Err(e) if e.raw_os_error() == Some(libc::ENETUNREACH) => {
                trace!("sendto failed: {e}");
                false
            }
            Err(e) => {
                debug!("sendto failed: {e}, remote address is {addr}");
                false
            }
            Ok(sent) if sent != buffer.remaining() => {
                error!("sent {sent} in place of {} bytes", buffer.remaining());
                false
            }
            Ok(_) => true,
        }
    }

    pub(crate) fn send_udp_ancil(&mut self, addr: &SocketAddr, info: &PktInfo) -> bool {
        debug_assert!(self.fd != -1);
        let buffer = self.buffer.as_ref().expect("udp comm point without buffer");
        debug_assert!(buffer.remaining() > 0, "send empty UDP packet");
        ancil::trace_ancil("send_udp over interface", info);
        match ancil::send_msg(self.fd, buffer.as_slice(), addr, info) {
            Err(e) => {
                debug!("sendmsg failed: {e}, remote address is {addr}");
                false
            }
            Ok(sent) if sent != buffer.remaining() => {
                error!("sent {sent} in place of {} bytes", buffer.remaining());
                false
            }
            Ok(_) => true,
        }
    }
}
