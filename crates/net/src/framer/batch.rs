//! One packet per datagram, many datagrams per syscall.
//!
//! Uses `sendmmsg`/`recvmmsg` on Linux and Android and the private
//! `sendmsg_x`/`recvmsg_x` calls on macOS. The message header arrays are
//! built once; each header's `msg_iov` points at the matching iovec inside
//! the pool, so the pool must outlive the headers and never reallocate. Both
//! live in the same `ToPeer`/`FromPeer` half, which guarantees it.

use super::{PEER_STALL_TIMEOUT, os_error, send_with_retry, truncated};
use crate::pool::PacketPool;
use crate::socketpair::Connection;
use nix::errno::Errno;
use std::os::fd::AsRawFd;
use tracing::{debug, trace, warn};
use vmnet_core::{Error, Result};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod sys {
    use nix::errno::Errno;
    use std::os::fd::RawFd;

    pub type MsgHdr = libc::mmsghdr;

    pub fn header(iov: *mut libc::iovec) -> MsgHdr {
        // SAFETY: an all-zero mmsghdr is a valid empty message.
        let mut hdr: MsgHdr = unsafe { std::mem::zeroed() };
        hdr.msg_hdr.msg_iov = iov;
        hdr.msg_hdr.msg_iovlen = 1;
        hdr
    }

    pub fn clear(hdr: &mut MsgHdr) {
        hdr.msg_len = 0;
        hdr.msg_hdr.msg_flags = 0;
    }

    pub fn received_len(hdr: &MsgHdr) -> usize {
        hdr.msg_len as usize
    }

    pub fn is_truncated(hdr: &MsgHdr) -> bool {
        hdr.msg_hdr.msg_flags & libc::MSG_TRUNC != 0
    }

    pub fn send(fd: RawFd, hdrs: *mut MsgHdr, count: usize) -> nix::Result<usize> {
        // SAFETY: `hdrs` points at `count` initialised headers whose iovecs
        // reference live pool memory.
        let n = unsafe { libc::sendmmsg(fd, hdrs, count as libc::c_uint, libc::MSG_NOSIGNAL as _) };
        Errno::result(n).map(|n| n as usize)
    }

    pub fn recv(fd: RawFd, hdrs: *mut MsgHdr, count: usize) -> nix::Result<usize> {
        // SAFETY: as for `send`; the iovecs are writable pool buffers.
        let n = unsafe {
            libc::recvmmsg(
                fd,
                hdrs,
                count as libc::c_uint,
                libc::MSG_DONTWAIT as _,
                std::ptr::null_mut(),
            )
        };
        Errno::result(n).map(|n| n as usize)
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use nix::errno::Errno;
    use std::os::fd::RawFd;

    /// `struct msghdr_x` from xnu's `sys/socket_private.h`.
    #[repr(C)]
    pub struct MsgHdr {
        msg_name: *mut libc::c_void,
        msg_namelen: libc::socklen_t,
        msg_iov: *mut libc::iovec,
        msg_iovlen: libc::c_int,
        msg_control: *mut libc::c_void,
        msg_controllen: libc::socklen_t,
        msg_flags: libc::c_int,
        msg_datalen: libc::size_t,
    }

    unsafe extern "C" {
        fn sendmsg_x(s: libc::c_int, msgp: *const MsgHdr, cnt: libc::c_uint, flags: libc::c_int) -> isize;
        fn recvmsg_x(s: libc::c_int, msgp: *const MsgHdr, cnt: libc::c_uint, flags: libc::c_int) -> isize;
    }

    pub fn header(iov: *mut libc::iovec) -> MsgHdr {
        MsgHdr {
            msg_name: std::ptr::null_mut(),
            msg_namelen: 0,
            msg_iov: iov,
            msg_iovlen: 1,
            msg_control: std::ptr::null_mut(),
            msg_controllen: 0,
            msg_flags: 0,
            msg_datalen: 0,
        }
    }

    pub fn clear(hdr: &mut MsgHdr) {
        hdr.msg_datalen = 0;
        hdr.msg_flags = 0;
    }

    pub fn received_len(hdr: &MsgHdr) -> usize {
        hdr.msg_datalen
    }

    pub fn is_truncated(hdr: &MsgHdr) -> bool {
        hdr.msg_flags & libc::MSG_TRUNC != 0
    }

    pub fn send(fd: RawFd, hdrs: *mut MsgHdr, count: usize) -> nix::Result<usize> {
        // SAFETY: `hdrs` points at `count` initialised headers whose iovecs
        // reference live pool memory. Name and control fields are zero.
        let n = unsafe { sendmsg_x(fd, hdrs, count as libc::c_uint, 0) };
        Errno::result(n).map(|n| n as usize)
    }

    pub fn recv(fd: RawFd, hdrs: *mut MsgHdr, count: usize) -> nix::Result<usize> {
        // SAFETY: as for `send`; the iovecs are writable pool buffers.
        let n = unsafe { recvmsg_x(fd, hdrs, count as libc::c_uint, libc::MSG_DONTWAIT) };
        Errno::result(n).map(|n| n as usize)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
mod sys {
    pub type MsgHdr = ();
}

/// Send side: headers aliasing the pool's write iovecs.
pub(super) struct BatchWriter {
    #[cfg_attr(
        not(any(target_os = "linux", target_os = "android", target_os = "macos")),
        allow(dead_code)
    )]
    headers: Box<[sys::MsgHdr]>,
    /// Bytes one call may carry; learned from `SO_SNDBUF` on first use.
    max_batch_bytes: Option<usize>,
}

/// Receive side: headers aliasing the pool's read iovecs.
pub(super) struct BatchReader {
    #[cfg_attr(
        not(any(target_os = "linux", target_os = "android", target_os = "macos")),
        allow(dead_code)
    )]
    headers: Box<[sys::MsgHdr]>,
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
impl BatchWriter {
    pub(super) fn new(pool: &PacketPool) -> Result<Self> {
        let headers = (0..pool.capacity())
            .map(|i| sys::header(pool.write_iov_ptr(i)))
            .collect();
        Ok(Self {
            headers,
            max_batch_bytes: None,
        })
    }

    pub(super) fn write_packets(
        &mut self,
        conn: &Connection,
        pool: &mut PacketPool,
        n: usize,
    ) -> Result<bool> {
        let n = n.min(self.headers.len());
        let lengths: Vec<usize> = pool.prepare_write_view(n)?.iter().map(|iov| iov.iov_len).collect();
        for hdr in &mut self.headers[..n] {
            sys::clear(hdr);
        }

        let max_bytes = match self.max_batch_bytes {
            Some(bytes) => bytes,
            None => {
                let bytes = conn.send_buffer_size()?;
                self.max_batch_bytes = Some(bytes);
                bytes
            }
        };

        let fd = conn.as_raw_fd();
        let mut sent = 0;
        while sent < n {
            let count = fitting_count(&lengths[sent..n], max_bytes);
            // SAFETY: sent < n <= headers.len().
            let hdrs = unsafe { self.headers.as_mut_ptr().add(sent) };
            let accepted = send_with_retry(conn, Some(PEER_STALL_TIMEOUT), || {
                sys::send(fd, hdrs, count)
            })?;
            let Some(accepted) = accepted else {
                warn!(dropped = n - sent, "batch: peer not draining, dropping packets");
                return Ok(false);
            };
            sent += accepted;
        }
        trace!(packets = n, "batch: wrote batch to peer");
        Ok(true)
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "macos"))]
impl BatchReader {
    pub(super) fn new(pool: &PacketPool) -> Result<Self> {
        let headers = (0..pool.capacity())
            .map(|i| sys::header(pool.read_iov_ptr(i)))
            .collect();
        Ok(Self { headers })
    }

    pub(super) fn read_packets(
        &mut self,
        conn: &Connection,
        pool: &mut PacketPool,
        limit: usize,
    ) -> Result<usize> {
        let limit = limit.min(self.headers.len());
        let max = pool.max_payload();
        for hdr in &mut self.headers[..limit] {
            sys::clear(hdr);
        }

        let fd = conn.as_raw_fd();
        let received = loop {
            match sys::recv(fd, self.headers.as_mut_ptr(), limit) {
                Ok(n) => break n,
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => conn.wait_readable()?,
                Err(e) => return Err(os_error(e)),
            }
        };

        if received == 0 {
            conn.close();
            return Err(Error::PeerClosed);
        }

        for (i, hdr) in self.headers[..received].iter().enumerate() {
            let len = sys::received_len(hdr);
            if sys::is_truncated(hdr) {
                return Err(truncated(len, max));
            }
            if len == 0 {
                debug!(count = i, "batch: zero-length datagram, treating as closed");
                conn.close();
                return if i > 0 { Ok(i) } else { Err(Error::PeerClosed) };
            }
            pool.set_len(i, len)?;
        }
        trace!(packets = received, "batch: read batch from peer");
        Ok(received)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
impl BatchWriter {
    pub(super) fn new(_pool: &PacketPool) -> Result<Self> {
        Err(unsupported())
    }

    pub(super) fn write_packets(&mut self, _: &Connection, _: &mut PacketPool, _: usize) -> Result<bool> {
        Err(unsupported())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
impl BatchReader {
    pub(super) fn new(_pool: &PacketPool) -> Result<Self> {
        Err(unsupported())
    }

    pub(super) fn read_packets(&mut self, _: &Connection, _: &mut PacketPool, _: usize) -> Result<usize> {
        Err(unsupported())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "macos")))]
fn unsupported() -> Error {
    Error::ConfigurationInvalid("batched datagram I/O is not available on this platform".to_string())
}

/// How many of `lengths` fit in one call of at most `max_bytes`; always at
/// least one so an oversized packet still gets its own call.
fn fitting_count(lengths: &[usize], max_bytes: usize) -> usize {
    let mut total = 0;
    let mut count = 0;
    for &len in lengths {
        total += len;
        if total > max_bytes && count > 0 {
            break;
        }
        count += 1;
    }
    count.max(1).min(lengths.len())
}
