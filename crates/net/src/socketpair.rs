//! Connected socket pairs handed out to a VM monitor.
//!
//! One end stays with the forwarder as a [`Connection`]; the other is returned
//! to the caller as an [`OwnedFd`] to pass to QEMU, krunkit or
//! `VZFileHandleNetworkDeviceAttachment`.

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use socket2::{Domain, Socket, Type};
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use vmnet_core::{BufferSizes, Error, Result};

/// Minimum Ethernet frame length.
const ETHER_MIN_LEN: usize = 64;

/// `SO_SNDLOWAT`: a length header plus the smallest Ethernet frame.
pub const SEND_LOW_WATER: usize = 4 + ETHER_MIN_LEN;

/// Smallest buffer size tried when the kernel rejects a request outright.
const MIN_BUFFER_SIZE: usize = 4096;

#[cfg(target_vendor = "apple")]
const SEND_FLAGS: libc::c_int = 0;
#[cfg(not(target_vendor = "apple"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;

/// Socket type of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

impl SocketKind {
    fn socket_type(self) -> Type {
        match self {
            SocketKind::Stream => Type::STREAM,
            SocketKind::Datagram => Type::DGRAM,
        }
    }
}

/// Create a connected `AF_UNIX` socket pair.
///
/// Both ends are non-blocking and get the same buffer sizes. Returns
/// `(connection, peer_fd)`; `peer_fd` belongs to the caller.
pub fn socket_pair(kind: SocketKind, sizes: BufferSizes) -> Result<(Connection, OwnedFd)> {
    let (local, remote) = Socket::pair(Domain::UNIX, kind.socket_type(), None)?;
    configure(&local, sizes)?;
    configure(&remote, sizes)?;

    debug!(
        ?kind,
        requested_send = sizes.send,
        requested_recv = sizes.receive,
        granted_send = local.send_buffer_size().unwrap_or(0),
        granted_recv = local.recv_buffer_size().unwrap_or(0),
        "socket pair created"
    );

    Ok((Connection::new(local, kind)?, OwnedFd::from(remote)))
}

fn configure(socket: &Socket, sizes: BufferSizes) -> io::Result<()> {
    socket.set_nonblocking(true)?;
    #[cfg(target_vendor = "apple")]
    socket.set_nosigpipe(true)?;
    set_send_low_water(socket, SEND_LOW_WATER)?;
    if sizes.receive > 0 {
        set_buffer_size(sizes.receive, |size| socket.set_recv_buffer_size(size))?;
    }
    if sizes.send > 0 {
        set_buffer_size(sizes.send, |size| socket.set_send_buffer_size(size))?;
    }
    Ok(())
}

/// Apply a buffer size, halving it while the kernel refuses the value.
///
/// Linux caps oversized requests silently; macOS fails with `ENOBUFS`
/// above `kern.ipc.maxsockbuf`.
fn set_buffer_size(size: usize, set: impl Fn(usize) -> io::Result<()>) -> io::Result<()> {
    let mut size = size;
    loop {
        match set(size) {
            Ok(()) => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) && size / 2 >= MIN_BUFFER_SIZE => {
                trace!(size, "socket buffer size refused, halving");
                size /= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

fn set_send_low_water(socket: &Socket, bytes: usize) -> io::Result<()> {
    let value = bytes as libc::c_int;
    // SAFETY: `value` outlives the call and the length matches its type.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDLOWAT,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    match Errno::result(rc) {
        Ok(_) => Ok(()),
        // Linux does not allow changing SO_SNDLOWAT.
        Err(Errno::ENOPROTOOPT) => {
            trace!("SO_SNDLOWAT not supported, keeping default");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// The forwarder's end of a socket pair.
///
/// Shared by the interface callback (writes), the peer reader (reads) and the
/// cancellation watcher (close). The descriptor is released when the last
/// owner drops; [`Connection::close`] only shuts it down.
///
/// Waits block in `poll(2)` on the socket and on an internal wake pair that
/// [`Connection::close`] writes to, so a waiter returns on I/O or on close
/// and never on a timer.
#[derive(Debug)]
pub struct Connection {
    socket: Socket,
    kind: SocketKind,
    closed: AtomicBool,
    wake_rx: Socket,
    wake_tx: Socket,
}

impl Connection {
    fn new(socket: Socket, kind: SocketKind) -> io::Result<Self> {
        let (wake_rx, wake_tx) = Socket::pair(Domain::UNIX, Type::STREAM, None)?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;
        Ok(Self {
            socket,
            kind,
            closed: AtomicBool::new(false),
            wake_rx,
            wake_tx,
        })
    }

    pub fn kind(&self) -> SocketKind {
        self.kind
    }

    /// Shut the connection down in both directions.
    ///
    /// Returns `true` for the call that actually closed it; later calls are
    /// no-ops and return `false`.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Never drained: the wake end stays readable for every later wait.
        if let Err(e) = self.wake_tx.send(&[1]) {
            trace!(error = %e, "wake on close failed");
        }
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            // ENOTCONN once the peer is gone; the flag is what matters.
            trace!(error = %e, "shutdown on close failed");
        }
        debug!(fd = self.socket.as_raw_fd(), "connection closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// `SO_SNDBUF` as granted by the kernel.
    pub fn send_buffer_size(&self) -> Result<usize> {
        Ok(self.socket.send_buffer_size()?)
    }

    /// `SO_RCVBUF` as granted by the kernel.
    pub fn recv_buffer_size(&self) -> Result<usize> {
        Ok(self.socket.recv_buffer_size()?)
    }

    /// Block until the socket is readable, or fail with `PeerClosed` once
    /// the connection has been closed.
    pub fn wait_readable(&self) -> Result<()> {
        self.wait(PollFlags::POLLIN)
    }

    /// Block until the socket is writable, or fail with `PeerClosed` once
    /// the connection has been closed.
    pub fn wait_writable(&self) -> Result<()> {
        self.wait(PollFlags::POLLOUT)
    }

    /// Like [`wait_writable`](Self::wait_writable), giving up after
    /// `timeout`. Returns `false` if the socket is still not writable.
    pub fn wait_writable_for(&self, timeout: Duration) -> Result<bool> {
        self.wait_until(PollFlags::POLLOUT, Some(Instant::now() + timeout))
    }

    fn wait(&self, events: PollFlags) -> Result<()> {
        self.wait_until(events, None).map(|_| ())
    }

    fn wait_until(&self, events: PollFlags, deadline: Option<Instant>) -> Result<bool> {
        loop {
            if self.is_closed() {
                return Err(Error::PeerClosed);
            }
            let timeout = match deadline {
                None => PollTimeout::NONE,
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Ok(false);
                    }
                    let ms = left.as_millis().clamp(1, u16::MAX as u128) as u16;
                    PollTimeout::from(ms)
                }
            };
            let mut fds = [
                PollFd::new(self.socket.as_fd(), events),
                PollFd::new(self.wake_rx.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, timeout) {
                Ok(0) | Err(Errno::EINTR) => continue,
                // Readiness, hang-up and errors all go back to the caller,
                // whose next syscall reports the actual condition.
                Ok(_) if !self.is_closed() => return Ok(true),
                Ok(_) => return Err(Error::PeerClosed),
                Err(e) => return Err(io::Error::from(e).into()),
            }
        }
    }

    /// Single non-blocking `recvmsg(2)` into `buf`.
    ///
    /// Returns the received length and whether the kernel truncated the
    /// datagram to fit.
    pub(crate) fn recv(&self, buf: &mut [u8]) -> nix::Result<(usize, bool)> {
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: an all-zero msghdr is a valid empty message.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        // SAFETY: `iov` describes `buf`, which is valid for writes.
        let n = unsafe { libc::recvmsg(self.socket.as_raw_fd(), &mut msg, 0) };
        let n = Errno::result(n)? as usize;
        Ok((n, msg.msg_flags & libc::MSG_TRUNC != 0))
    }

    /// Single non-blocking `readv(2)`.
    ///
    /// Every iovec must describe writable memory that stays valid for the
    /// duration of the call.
    pub(crate) fn readv(&self, iovs: &[libc::iovec]) -> nix::Result<usize> {
        // SAFETY: caller guarantees the iovecs point at live, writable buffers.
        let n = unsafe {
            libc::readv(
                self.socket.as_raw_fd(),
                iovs.as_ptr(),
                iovs.len() as libc::c_int,
            )
        };
        Errno::result(n).map(|n| n as usize)
    }

    /// Single non-blocking gather `sendmsg(2)`.
    ///
    /// Every iovec must describe readable memory that stays valid for the
    /// duration of the call.
    pub(crate) fn send_iovs(&self, iovs: &[libc::iovec]) -> nix::Result<usize> {
        // SAFETY: an all-zero msghdr is a valid empty message.
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iovs.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iovs.len() as _;
        // SAFETY: caller guarantees the iovecs point at live buffers.
        let n = unsafe { libc::sendmsg(self.socket.as_raw_fd(), &msg, SEND_FLAGS) };
        Errno::result(n).map(|n| n as usize)
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl AsFd for Connection {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}
