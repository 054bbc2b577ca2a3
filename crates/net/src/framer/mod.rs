//! Strategies mapping pool packets to bytes on the connection.
//!
//! A [`Framing`] is picked once per forwarder. [`Framing::allocate`] splits it
//! into a [`ToPeer`] half (interface → peer, owned by the interface callback)
//! and a [`FromPeer`] half (peer → interface, owned by the peer reader), each
//! with its own pool.

mod batch;
mod datagram;
mod stream;

use crate::pool::{PacketPool, STREAM_HEADER_SIZE};
use crate::socketpair::{Connection, SocketKind};
use nix::errno::Errno;
use std::io;
use std::time::{Duration, Instant};
use vmnet_core::{BufferSizes, Error, InterfaceParams, Result, SocketOptions};

/// Pause before retrying a send the kernel refused with `ENOBUFS`.
pub const ENOBUFS_BACKOFF: Duration = Duration::from_micros(100);

/// Longest a write to the peer waits for room in the socket before the
/// packets not yet sent are dropped.
pub const PEER_STALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest iovec count passed to a single vectored call.
const IOV_MAX: usize = 1024;

/// Wire format used on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// `BE32(len) || payload` per packet over `SOCK_STREAM`.
    Stream,
    /// One packet per datagram, one `sendmsg` per packet.
    Datagram,
    /// One packet per datagram, many datagrams per syscall.
    DatagramBatch,
}

impl Framing {
    pub fn socket_kind(self) -> SocketKind {
        match self {
            Framing::Stream => SocketKind::Stream,
            Framing::Datagram | Framing::DatagramBatch => SocketKind::Datagram,
        }
    }

    /// Bytes reserved in front of every packet buffer.
    pub fn header_size(self) -> usize {
        match self {
            Framing::Stream => STREAM_HEADER_SIZE,
            Framing::Datagram | Framing::DatagramBatch => 0,
        }
    }

    /// Socket buffer sizes for an interface, honouring the user's choices
    /// where they exceed what the interface needs.
    pub fn tune_socket_options(
        self,
        params: &InterfaceParams,
        user: &SocketOptions,
    ) -> BufferSizes {
        let packet_size = params.max_payload() + self.header_size();
        let batch = params.max_batch();
        let (min_send, min_recv) = match self.socket_kind() {
            SocketKind::Stream => {
                let size = packet_size.saturating_mul(batch);
                (size, size)
            }
            SocketKind::Datagram => (packet_size, packet_size.saturating_mul(batch)),
        };
        user.resolve(min_send, min_recv)
    }

    /// Allocate both directions' pools and strategy state.
    pub fn allocate(self, params: &InterfaceParams) -> Result<(ToPeer, FromPeer)> {
        params.validate()?;
        let capacity = params.max_batch();
        let max_payload = params.max_payload();
        let rx = PacketPool::new(capacity, max_payload, self.header_size())?;
        let tx = PacketPool::new(capacity, max_payload, self.header_size())?;

        let (writer, reader) = match self {
            Framing::Stream => (
                PeerWriter::Stream(stream::StreamWriter::default()),
                PeerReader::Stream,
            ),
            Framing::Datagram => (PeerWriter::Datagram, PeerReader::Datagram),
            Framing::DatagramBatch => (
                PeerWriter::Batch(batch::BatchWriter::new(&rx)?),
                PeerReader::Batch(batch::BatchReader::new(&tx)?),
            ),
        };

        Ok((
            ToPeer {
                pool: rx,
                writer,
                limit: params.max_read_packets,
            },
            FromPeer {
                pool: tx,
                reader,
                limit: params.max_write_packets,
            },
        ))
    }
}

enum PeerWriter {
    Stream(stream::StreamWriter),
    Datagram,
    Batch(batch::BatchWriter),
}

enum PeerReader {
    Stream,
    Datagram,
    Batch(batch::BatchReader),
}

/// Interface → peer half: the RX pool and the write side of the strategy.
pub struct ToPeer {
    pool: PacketPool,
    writer: PeerWriter,
    limit: usize,
}

impl ToPeer {
    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut PacketPool {
        &mut self.pool
    }

    /// Most packets one interface read may return.
    pub fn read_limit(&self) -> usize {
        self.limit.min(self.pool.capacity())
    }

    /// Send the first `n` packets of the pool to the peer, in index order.
    ///
    /// Returns `false` if the peer stopped draining its socket and some of
    /// the packets were dropped.
    pub fn write_packets_to_peer(&mut self, conn: &Connection, n: usize) -> Result<bool> {
        let n = n.min(self.pool.capacity());
        if n == 0 {
            return Ok(true);
        }
        match &mut self.writer {
            PeerWriter::Stream(writer) => writer.write_packets(conn, &mut self.pool, n),
            PeerWriter::Datagram => datagram::write_packets(conn, &mut self.pool, n),
            PeerWriter::Batch(writer) => writer.write_packets(conn, &mut self.pool, n),
        }
    }
}

/// Peer → interface half: the TX pool and the read side of the strategy.
pub struct FromPeer {
    pool: PacketPool,
    reader: PeerReader,
    limit: usize,
}

impl FromPeer {
    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut PacketPool {
        &mut self.pool
    }

    /// Most packets one peer read may frame.
    pub fn read_limit(&self) -> usize {
        self.limit.min(self.pool.capacity())
    }

    /// Frame packets from the peer into the pool.
    ///
    /// Blocks until at least one packet is available. Returns the number of
    /// packets framed; `Error::PeerClosed` once the peer is gone.
    pub fn read_packets_from_peer(&mut self, conn: &Connection) -> Result<usize> {
        let limit = self.read_limit();
        self.pool.reset();
        match &mut self.reader {
            PeerReader::Stream => stream::read_packets(conn, &mut self.pool, limit),
            PeerReader::Datagram => datagram::read_packets(conn, &mut self.pool, limit),
            PeerReader::Batch(reader) => reader.read_packets(conn, &mut self.pool, limit),
        }
    }
}

// SAFETY: batch headers hold pointers into the pool stored next to them; the
// pair only ever moves between threads together.
unsafe impl Send for ToPeer {}
// SAFETY: as above.
unsafe impl Send for FromPeer {}

/// Retry a send until the kernel accepts it.
///
/// `EAGAIN` waits for writability: for at most `patience` in total, after
/// which `Ok(None)` says the peer is not draining. `None` patience waits
/// until the socket drains or closes. `ENOBUFS` backs off briefly and tries
/// the same packet again. Both give up with `PeerClosed` once the connection
/// is closed.
pub(crate) fn send_with_retry(
    conn: &Connection,
    patience: Option<Duration>,
    mut send: impl FnMut() -> nix::Result<usize>,
) -> Result<Option<usize>> {
    let mut deadline = None;
    loop {
        match send() {
            Ok(n) => return Ok(Some(n)),
            Err(Errno::EINTR) => {}
            Err(Errno::EAGAIN) => match patience {
                None => conn.wait_writable()?,
                Some(patience) => {
                    let deadline = *deadline.get_or_insert_with(|| Instant::now() + patience);
                    let left = deadline.saturating_duration_since(Instant::now());
                    if !conn.wait_writable_for(left)? {
                        return Ok(None);
                    }
                }
            },
            Err(Errno::ENOBUFS) => {
                if conn.is_closed() {
                    return Err(Error::PeerClosed);
                }
                std::thread::sleep(ENOBUFS_BACKOFF);
            }
            Err(e) => return Err(os_error(e)),
        }
    }
}

pub(crate) fn os_error(errno: Errno) -> Error {
    Error::Io(io::Error::from(errno))
}

/// Error for a datagram the kernel cut short: longer than `max`.
pub(crate) fn truncated(received: usize, max: usize) -> Error {
    Error::PacketTooLarge {
        len: received.max(max + 1),
        max,
    }
}
