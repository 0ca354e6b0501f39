//! Ancillary-data plumbing for UDP.
//!
//! On a multi-homed host the reply to a query must leave through the
//! interface and source address the query arrived on, or many peers
//! discard it. The receive path records the pktinfo control message
//! accompanying each datagram; the send path emits a matching one. All
//! `cmsghdr` arithmetic stays behind helpers that validate the
//! advertised length before any payload is copied out.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::ptr;

use log::trace;

use crate::sys::{sockaddr_to_std, std_to_sockaddr};

/// Control buffer sized for one pktinfo message with room to spare.
const CONTROL_SIZE: usize = 256;

/// Keeps the control bytes aligned for `cmsghdr` access.
#[repr(C)]
union ControlBuf {
    buf: [u8; CONTROL_SIZE],
    _align: libc::cmsghdr,
}

/// IPv4 source-interface information, in the form this platform's
/// kernel hands out.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub type V4Info = libc::in_pktinfo;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub type V4Info = libc::in_addr;

/// Source-interface information captured with a datagram.
///
/// `None` means no control message arrived; a reply then carries a
/// zero-filled IPv6 pktinfo so the kernel picks the default route.
#[derive(Clone, Copy)]
pub enum PktInfo {
    None,
    V4(V4Info),
    V6(libc::in6_pktinfo),
}

impl PktInfo {
    /// The wire tag for this source kind: 0, 4 or 6.
    pub fn srctype(&self) -> u8 {
        match self {
            PktInfo::None => 0,
            PktInfo::V4(_) => 4,
            PktInfo::V6(_) => 6,
        }
    }
}

/// Copy out a control payload after validating the advertised length.
unsafe fn cmsg_payload<T: Copy>(cmsg: *const libc::cmsghdr) -> Option<T> {
    let have = (*cmsg).cmsg_len as usize;
    let need = libc::CMSG_LEN(mem::size_of::<T>() as libc::c_uint) as usize;
    if have < need {
        return None;
    }
    Some(ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const T))
}

/// Write one control message and return the space it occupies.
unsafe fn cmsg_fill<T: Copy>(
    cmsg: *mut libc::cmsghdr,
    level: libc::c_int,
    kind: libc::c_int,
    payload: &T,
) -> usize {
    (*cmsg).cmsg_level = level;
    (*cmsg).cmsg_type = kind;
    (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<T>() as libc::c_uint) as _;
    ptr::copy_nonoverlapping(
        payload as *const T as *const u8,
        libc::CMSG_DATA(cmsg),
        mem::size_of::<T>(),
    );
    (*cmsg).cmsg_len as usize
}

fn parse_control(msg: &libc::msghdr) -> PktInfo {
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let (level, kind) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type) };
        if level == libc::IPPROTO_IPV6 && kind == libc::IPV6_PKTINFO {
            if let Some(info) = unsafe { cmsg_payload::<libc::in6_pktinfo>(cmsg) } {
                return PktInfo::V6(info);
            }
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if level == libc::IPPROTO_IP && kind == libc::IP_PKTINFO {
            if let Some(info) = unsafe { cmsg_payload::<libc::in_pktinfo>(cmsg) } {
                return PktInfo::V4(info);
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        if level == libc::IPPROTO_IP && kind == libc::IP_RECVDSTADDR {
            if let Some(info) = unsafe { cmsg_payload::<libc::in_addr>(cmsg) } {
                return PktInfo::V4(info);
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    PktInfo::None
}

/// Receive one datagram and whatever pktinfo came with it.
pub(crate) fn recv_msg(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, PktInfo)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut control = ControlBuf {
        buf: [0u8; CONTROL_SIZE],
    };
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = unsafe { control.buf.as_mut_ptr() } as *mut libc::c_void;
    msg.msg_controllen = CONTROL_SIZE as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let addr = sockaddr_to_std(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))?;
    Ok((n as usize, addr, parse_control(&msg)))
}

/// Send one datagram, pinned to the captured source interface. With no
/// captured pktinfo an all-zero IPv6 pktinfo is attached instead.
pub(crate) fn send_msg(
    fd: RawFd,
    buf: &[u8],
    addr: &SocketAddr,
    info: &PktInfo,
) -> io::Result<usize> {
    let (mut storage, addrlen) = std_to_sockaddr(addr);
    let mut control = ControlBuf {
        buf: [0u8; CONTROL_SIZE],
    };
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
    msg.msg_namelen = addrlen;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = unsafe { control.buf.as_mut_ptr() } as *mut libc::c_void;
    msg.msg_controllen = CONTROL_SIZE as _;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    let used = unsafe {
        match info {
            #[cfg(any(target_os = "linux", target_os = "android"))]
            PktInfo::V4(v4) => cmsg_fill(cmsg, libc::IPPROTO_IP, libc::IP_PKTINFO, v4),
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            PktInfo::V4(v4) => cmsg_fill(cmsg, libc::IPPROTO_IP, libc::IP_RECVDSTADDR, v4),
            PktInfo::V6(v6) => cmsg_fill(cmsg, libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, v6),
            PktInfo::None => {
                let zero: libc::in6_pktinfo = mem::zeroed();
                cmsg_fill(cmsg, libc::IPPROTO_IPV6, libc::IPV6_PKTINFO, &zero)
            }
        }
    };
    msg.msg_controllen = used as _;

    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Trace what pktinfo a datagram carried or a reply will carry.
pub(crate) fn trace_ancil(what: &str, info: &PktInfo) {
    if !log::log_enabled!(log::Level::Trace) {
        return;
    }
    match info {
        PktInfo::None => trace!("{what}: no pktinfo"),
        #[cfg(any(target_os = "linux", target_os = "android"))]
        PktInfo::V4(v4) => trace!(
            "{what}: {} {} {}",
            v4.ipi_ifindex,
            Ipv4Addr::from(u32::from_be(v4.ipi_addr.s_addr)),
            Ipv4Addr::from(u32::from_be(v4.ipi_spec_dst.s_addr)),
        ),
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        PktInfo::V4(v4) => trace!("{what}: {}", Ipv4Addr::from(u32::from_be(v4.s_addr))),
        PktInfo::V6(v6) => trace!(
            "{what}: {} {}",
            Ipv6Addr::from(v6.ipi6_addr.s6_addr),
            v6.ipi6_ifindex,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_srctype_tags() {
        assert_eq!(PktInfo::None.srctype(), 0);
        let v6: libc::in6_pktinfo = unsafe { mem::zeroed() };
        assert_eq!(PktInfo::V6(v6).srctype(), 6);
        let v4: V4Info = unsafe { mem::zeroed() };
        assert_eq!(PktInfo::V4(v4).srctype(), 4);
    }

    #[test]
    fn test_short_cmsg_rejected() {
        // A header that advertises less than a full payload must not be
        // read out.
        let mut raw = ControlBuf {
            buf: [0u8; CONTROL_SIZE],
        };
        let cmsg = unsafe { raw.buf.as_mut_ptr() } as *mut libc::cmsghdr;
        unsafe {
            (*cmsg).cmsg_len = libc::CMSG_LEN(4) as _;
        }
        let got = unsafe { cmsg_payload::<libc::in6_pktinfo>(cmsg) };
        assert!(got.is_none());
    }
}
