//! One packet per datagram, one syscall per packet.

use super::{PEER_STALL_TIMEOUT, os_error, send_with_retry, truncated};
use crate::pool::PacketPool;
use crate::socketpair::Connection;
use nix::errno::Errno;
use tracing::{debug, trace, warn};
use vmnet_core::{Error, Result};

/// Send `n` packets as `n` datagrams, in index order.
///
/// A packet the kernel refuses for lack of buffers is retried until it is
/// accepted. If the peer leaves its socket full for [`PEER_STALL_TIMEOUT`],
/// the packets not yet sent are dropped and `Ok(false)` is returned.
pub(super) fn write_packets(conn: &Connection, pool: &mut PacketPool, n: usize) -> Result<bool> {
    let iovs = pool.prepare_write_view(n)?;
    for i in 0..iovs.len() {
        let sent = send_with_retry(conn, Some(PEER_STALL_TIMEOUT), || {
            conn.send_iovs(&iovs[i..=i])
        })?;
        if sent.is_none() {
            warn!(dropped = iovs.len() - i, "datagram: peer not draining, dropping packets");
            return Ok(false);
        }
    }
    trace!(packets = n, "datagram: wrote batch to peer");
    Ok(true)
}

/// Receive up to `limit` datagrams.
///
/// Waits for the first one, then takes whatever else is already queued.
/// A zero-length datagram means the peer is gone: the connection is closed
/// and packets received before it are still returned.
pub(super) fn read_packets(conn: &Connection, pool: &mut PacketPool, limit: usize) -> Result<usize> {
    let limit = limit.min(pool.capacity());
    let max = pool.max_payload();
    let mut count = 0;

    while count < limit {
        match conn.recv(pool.buffer_mut(count)) {
            Ok((_, true)) => return Err(truncated(max, max)),
            Ok((0, false)) => {
                debug!(count, "datagram: zero-length read, treating as closed");
                conn.close();
                return if count > 0 {
                    Ok(count)
                } else {
                    Err(Error::PeerClosed)
                };
            }
            Ok((len, false)) => {
                pool.set_len(count, len)?;
                count += 1;
            }
            Err(Errno::EINTR) => {}
            Err(Errno::EAGAIN) if count > 0 => break,
            Err(Errno::EAGAIN) => conn.wait_readable()?,
            Err(e) => return Err(os_error(e)),
        }
    }

    Ok(count)
}
