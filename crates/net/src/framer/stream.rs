//! Length-prefixed framing over `SOCK_STREAM`.

use super::{IOV_MAX, PEER_STALL_TIMEOUT, os_error, send_with_retry};
use crate::pool::{PacketPool, STREAM_HEADER_SIZE};
use crate::socketpair::Connection;
use nix::errno::Errno;
use tracing::{trace, warn};
use vmnet_core::{Error, Result};

/// Write side of the stream framing.
///
/// Holds the unsent tail of a packet the peer stopped accepting halfway, so
/// the next batch finishes it before anything else goes out.
#[derive(Debug, Default)]
pub(super) struct StreamWriter {
    pending: Vec<u8>,
}

impl StreamWriter {
    /// Write `n` packets as one gather list, draining short writes.
    ///
    /// If the peer leaves its socket full for [`PEER_STALL_TIMEOUT`], whole
    /// packets not yet started are dropped and `Ok(false)` is returned. A
    /// packet already partly on the wire is kept and finished first on the
    /// next call, so the stream never loses sync.
    pub(super) fn write_packets(
        &mut self,
        conn: &Connection,
        pool: &mut PacketPool,
        n: usize,
    ) -> Result<bool> {
        let mut iovs = pool.prepare_write_view(n)?;
        if !self.flush_pending(conn)? {
            warn!(dropped = n, "stream: peer not draining, dropping packets");
            return Ok(false);
        }

        let mut mid_packet = false;
        while !iovs.is_empty() {
            let chunk = iovs.len().min(IOV_MAX);
            let sent = send_with_retry(conn, Some(PEER_STALL_TIMEOUT), || {
                conn.send_iovs(&iovs[..chunk])
            })?;
            let Some(written) = sent else {
                let mut dropped = iovs.len();
                if mid_packet {
                    let tail = iovs[0];
                    // SAFETY: after `advance` the front iovec describes the
                    // unsent rest of a packet inside the pool's buffer.
                    let tail = unsafe {
                        std::slice::from_raw_parts(tail.iov_base as *const u8, tail.iov_len)
                    };
                    self.pending.extend_from_slice(tail);
                    dropped -= 1;
                }
                warn!(dropped, "stream: peer not draining, dropping packets");
                return Ok(false);
            };
            (iovs, mid_packet) = advance(std::mem::take(&mut iovs), written);
        }
        trace!(packets = n, "stream: wrote batch to peer");
        Ok(true)
    }

    /// Send what is left of a packet cut short earlier. Returns `false` if
    /// the peer is still not draining.
    fn flush_pending(&mut self, conn: &Connection) -> Result<bool> {
        while !self.pending.is_empty() {
            let iov = libc::iovec {
                iov_base: self.pending.as_ptr() as *mut libc::c_void,
                iov_len: self.pending.len(),
            };
            match send_with_retry(conn, Some(PEER_STALL_TIMEOUT), || conn.send_iovs(&[iov]))? {
                Some(written) => {
                    self.pending.drain(..written);
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Drop `written` bytes from the front of a gather list.
///
/// Also returns whether the new front entry was partly consumed.
fn advance(iovs: &mut [libc::iovec], mut written: usize) -> (&mut [libc::iovec], bool) {
    let mut skip = 0;
    for iov in iovs.iter() {
        if written < iov.iov_len {
            break;
        }
        written -= iov.iov_len;
        skip += 1;
    }
    let rest = &mut iovs[skip..];
    if let Some(first) = rest.first_mut() {
        // SAFETY: `written` is less than this iovec's length.
        first.iov_base = unsafe { (first.iov_base as *mut u8).add(written) } as *mut libc::c_void;
        first.iov_len -= written;
    }
    (rest, written > 0)
}

/// Frame up to `limit` packets from the stream.
///
/// Blocks for the first length header. After that each read asks for the
/// rest of the current payload plus the next header, so a busy stream is
/// drained without extra syscalls and an idle one ends the batch.
pub(super) fn read_packets(conn: &Connection, pool: &mut PacketPool, limit: usize) -> Result<usize> {
    let limit = limit.min(pool.capacity());
    let max = pool.max_payload();

    read_first_header(conn, pool)?;

    let mut count = 0;
    loop {
        let len = header_len(pool, count);
        if len == 0 || len > max {
            return Err(Error::ProtocolViolation { len, max });
        }
        pool.set_len(count, len)?;

        let prefetch = count + 1 < limit;
        let want = if prefetch { len + STREAM_HEADER_SIZE } else { len };
        let mut got = 0;

        while got < want {
            let mut iovs = [pool.payload_iov(count, 0, 0); 2];
            let iov_count = if got < len {
                iovs[0] = pool.payload_iov(count, got, len);
                if prefetch {
                    iovs[1] = pool.header_iov(count + 1, 0);
                    2
                } else {
                    1
                }
            } else {
                iovs[0] = pool.header_iov(count + 1, got - len);
                1
            };

            match conn.readv(&iovs[..iov_count]) {
                Ok(0) => {
                    // End of stream: keep what is complete.
                    if got >= len {
                        return Ok(count + 1);
                    }
                    trace!(count, got, len, "stream: peer closed mid-packet");
                    return if count > 0 {
                        Ok(count)
                    } else {
                        Err(Error::PeerClosed)
                    };
                }
                Ok(n) => {
                    got += n;
                    if got == len {
                        // Next header not there yet.
                        return Ok(count + 1);
                    }
                }
                Err(Errno::EINTR) => {}
                Err(Errno::EAGAIN) => conn.wait_readable()?,
                Err(e) => return Err(os_error(e)),
            }
        }

        count += 1;
    }
}

fn read_first_header(conn: &Connection, pool: &mut PacketPool) -> Result<()> {
    let mut got = 0;
    while got < STREAM_HEADER_SIZE {
        let iov = pool.header_iov(0, got);
        match conn.readv(&[iov]) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(n) => got += n,
            Err(Errno::EINTR) => {}
            Err(Errno::EAGAIN) => conn.wait_readable()?,
            Err(e) => return Err(os_error(e)),
        }
    }
    Ok(())
}

fn header_len(pool: &mut PacketPool, i: usize) -> usize {
    let header = pool.header_mut(i);
    u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socketpair::{SocketKind, socket_pair};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;
    use vmnet_core::BufferSizes;

    fn pair() -> (Connection, UnixStream) {
        let (conn, peer) = socket_pair(
            SocketKind::Stream,
            BufferSizes {
                receive: 256 * 1024,
                send: 256 * 1024,
            },
        )
        .unwrap();
        let peer = UnixStream::from(peer);
        peer.set_nonblocking(false).unwrap();
        (conn, peer)
    }

    fn framed(packets: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for p in packets {
            out.extend_from_slice(&(p.len() as u32).to_be_bytes());
            out.extend_from_slice(p);
        }
        out
    }

    fn read_all(conn: &Connection, pool: &mut PacketPool, expected: usize) -> Vec<Vec<u8>> {
        let mut packets = Vec::new();
        while packets.len() < expected {
            pool.reset();
            let capacity = pool.capacity();
            let n = read_packets(conn, pool, capacity).unwrap();
            packets.extend(pool.iter(n).map(|p| p.payload().to_vec()));
        }
        packets
    }

    mod writing {
        use super::*;

        #[test]
        fn emits_length_prefixed_packets() {
            let (conn, mut peer) = pair();
            let mut pool = PacketPool::new(4, 1500, 4).unwrap();
            pool.fill(0, b"ABC").unwrap();
            pool.fill(1, b"XY").unwrap();

            assert!(StreamWriter::default().write_packets(&conn, &mut pool, 2).unwrap());

            let expected = framed(&[b"ABC", b"XY"]);
            let mut buf = vec![0u8; expected.len()];
            peer.read_exact(&mut buf).unwrap();
            assert_eq!(buf, expected);
        }

        #[test]
        fn drains_batches_larger_than_socket_buffer() {
            let (conn, peer) = socket_pair(
                SocketKind::Stream,
                BufferSizes {
                    receive: 4096,
                    send: 4096,
                },
            )
            .unwrap();
            let mut peer = UnixStream::from(peer);
            peer.set_nonblocking(false).unwrap();

            let mut pool = PacketPool::new(64, 1500, 4).unwrap();
            let packets: Vec<Vec<u8>> = (0..64).map(|i| vec![i as u8; 1500]).collect();
            for (i, p) in packets.iter().enumerate() {
                pool.fill(i, p).unwrap();
            }

            let reader = std::thread::spawn(move || {
                let mut buf = vec![0u8; 64 * 1504];
                peer.read_exact(&mut buf).unwrap();
                buf
            });
            assert!(StreamWriter::default().write_packets(&conn, &mut pool, 64).unwrap());

            let refs: Vec<&[u8]> = packets.iter().map(|p| p.as_slice()).collect();
            assert_eq!(reader.join().unwrap(), framed(&refs));
        }

        #[test]
        fn idle_peer_drops_whole_packets_and_keeps_stream_in_sync() {
            use std::time::{Duration, Instant};

            let (conn, peer) = socket_pair(
                SocketKind::Stream,
                BufferSizes {
                    receive: 4096,
                    send: 4096,
                },
            )
            .unwrap();
            let mut peer = UnixStream::from(peer);
            let mut writer = StreamWriter::default();
            let mut pool = PacketPool::new(64, 1500, 4).unwrap();
            for i in 0..64 {
                pool.fill(i, &[i as u8; 1500]).unwrap();
            }

            let started = Instant::now();
            assert!(!writer.write_packets(&conn, &mut pool, 64).unwrap());
            assert!(started.elapsed() < PEER_STALL_TIMEOUT * 2);

            let reader = std::thread::spawn(move || {
                peer.set_nonblocking(false).unwrap();
                peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                let mut frames = Vec::new();
                loop {
                    let mut header = [0u8; 4];
                    peer.read_exact(&mut header).unwrap();
                    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
                    peer.read_exact(&mut payload).unwrap();
                    let last = payload == b"late";
                    frames.push(payload);
                    if last {
                        return frames;
                    }
                }
            });

            pool.reset();
            pool.fill(0, b"late").unwrap();
            assert!(writer.write_packets(&conn, &mut pool, 1).unwrap());
            assert_eq!(writer.pending(), 0);

            let frames = reader.join().unwrap();
            let (late, burst) = frames.split_last().unwrap();
            assert_eq!(late, b"late");
            assert!(!burst.is_empty() && burst.len() < 64);
            for (i, frame) in burst.iter().enumerate() {
                assert_eq!(frame, &vec![i as u8; 1500]);
            }
        }

        #[test]
        fn rejects_oversized_packet() {
            let (conn, _peer) = pair();
            let mut pool = PacketPool::new(1, 1500, 4).unwrap();
            // SAFETY: slot 0 exists.
            unsafe { (*pool.descriptors_mut()).vm_pkt_size = 2000 };
            assert!(matches!(
                StreamWriter::default().write_packets(&conn, &mut pool, 1),
                Err(Error::PacketTooLarge { len: 2000, .. })
            ));
        }

        #[test]
        fn advance_skips_whole_and_partial_iovecs() {
            let a = [0u8; 4];
            let b = [0u8; 6];
            let mut iovs = [
                libc::iovec {
                    iov_base: a.as_ptr() as *mut libc::c_void,
                    iov_len: 4,
                },
                libc::iovec {
                    iov_base: b.as_ptr() as *mut libc::c_void,
                    iov_len: 6,
                },
            ];
            let (rest, partial) = advance(&mut iovs, 5);
            assert!(partial);
            assert_eq!(rest.len(), 1);
            assert_eq!(rest[0].iov_len, 5);
            assert_eq!(rest[0].iov_base as usize, b.as_ptr() as usize + 1);
        }

        #[test]
        fn advance_to_a_boundary_is_not_partial() {
            let a = [0u8; 4];
            let b = [0u8; 6];
            let mut iovs = [
                libc::iovec {
                    iov_base: a.as_ptr() as *mut libc::c_void,
                    iov_len: 4,
                },
                libc::iovec {
                    iov_base: b.as_ptr() as *mut libc::c_void,
                    iov_len: 6,
                },
            ];
            let (rest, partial) = advance(&mut iovs, 4);
            assert!(!partial);
            assert_eq!(rest.len(), 1);
            assert_eq!(rest[0].iov_len, 6);
        }
    }

    mod reading {
        use super::*;

        #[test]
        fn single_packet() {
            let (conn, mut peer) = pair();
            let mut pool = PacketPool::new(4, 1500, 4).unwrap();
            peer.write_all(&[0, 0, 0, 5, b'H', b'E', b'L', b'L', b'O']).unwrap();

            let n = read_packets(&conn, &mut pool, 4).unwrap();
            assert_eq!(n, 1);
            assert_eq!(pool.payload(0), b"HELLO");
        }

        #[test]
        fn pipelined_packets_in_one_batch() {
            let (conn, mut peer) = pair();
            let mut pool = PacketPool::new(4, 1500, 4).unwrap();
            peer.write_all(&framed(&[b"ABC", b"XY"])).unwrap();

            let n = read_packets(&conn, &mut pool, 4).unwrap();
            assert_eq!(n, 2);
            assert_eq!(pool.payload(0), b"ABC");
            assert_eq!(pool.payload(1), b"XY");
        }

        #[test]
        fn partial_length_header() {
            let (conn, mut peer) = pair();
            let mut pool = PacketPool::new(4, 1500, 4).unwrap();

            let writer = std::thread::spawn(move || {
                peer.write_all(&[0, 0]).unwrap();
                std::thread::sleep(std::time::Duration::from_millis(20));
                peer.write_all(&[0, 4, b'W', b'I', b'N', b'S']).unwrap();
                peer
            });

            let n = read_packets(&conn, &mut pool, 4).unwrap();
            let _peer = writer.join().unwrap();
            assert_eq!(n, 1);
            assert_eq!(pool.payload(0), b"WINS");
        }

        #[test]
        fn stops_at_limit() {
            let (conn, mut peer) = pair();
            let mut pool = PacketPool::new(4, 1500, 4).unwrap();
            peer.write_all(&framed(&[b"a", b"b", b"c"])).unwrap();

            assert_eq!(read_packets(&conn, &mut pool, 2).unwrap(), 2);
            assert_eq!(pool.payload(1), b"b");

            pool.reset();
            assert_eq!(read_packets(&conn, &mut pool, 2).unwrap(), 1);
            assert_eq!(pool.payload(0), b"c");
        }

        #[test]
        fn zero_length_is_protocol_violation() {
            let (conn, mut peer) = pair();
            let mut pool = PacketPool::new(4, 1500, 4).unwrap();
            peer.write_all(&0u32.to_be_bytes()).unwrap();

            assert!(matches!(
                read_packets(&conn, &mut pool, 4),
                Err(Error::ProtocolViolation { len: 0, max: 1500 })
            ));
        }

        #[test]
        fn oversized_length_is_protocol_violation() {
            let (conn, mut peer) = pair();
            let mut pool = PacketPool::new(4, 1500, 4).unwrap();
            peer.write_all(&1501u32.to_be_bytes()).unwrap();

            assert!(matches!(
                read_packets(&conn, &mut pool, 4),
                Err(Error::ProtocolViolation { len: 1501, max: 1500 })
            ));
        }

        #[test]
        fn eof_before_header_is_peer_closed() {
            let (conn, peer) = pair();
            let mut pool = PacketPool::new(4, 1500, 4).unwrap();
            drop(peer);
            assert!(matches!(
                read_packets(&conn, &mut pool, 4),
                Err(Error::PeerClosed)
            ));
        }

        #[test]
        fn eof_after_complete_packets_returns_them() {
            let (conn, mut peer) = pair();
            let mut pool = PacketPool::new(4, 1500, 4).unwrap();
            let mut bytes = framed(&[b"one", b"two"]);
            bytes.extend_from_slice(&[0, 0, 0, 9, b'x']);
            peer.write_all(&bytes).unwrap();
            drop(peer);

            assert_eq!(read_packets(&conn, &mut pool, 4).unwrap(), 2);
            assert_eq!(pool.payload(1), b"two");

            pool.reset();
            assert!(matches!(
                read_packets(&conn, &mut pool, 4),
                Err(Error::PeerClosed)
            ));
        }

        #[test]
        fn any_chunking_yields_original_packets() {
            let packets: Vec<Vec<u8>> = (1..=12)
                .map(|i| (0..(i * 97) % 1500 + 1).map(|b| (b * i) as u8).collect())
                .collect();
            let refs: Vec<&[u8]> = packets.iter().map(|p| p.as_slice()).collect();
            let wire = framed(&refs);

            for chunk in [1, 2, 3, 5, 7, 64, 1499, wire.len()] {
                let (conn, mut peer) = pair();
                let mut pool = PacketPool::new(4, 1500, 4).unwrap();
                let bytes = wire.clone();
                let writer = std::thread::spawn(move || {
                    for piece in bytes.chunks(chunk) {
                        peer.write_all(piece).unwrap();
                        peer.flush().unwrap();
                    }
                    peer
                });

                let received = read_all(&conn, &mut pool, packets.len());
                let _peer = writer.join().unwrap();
                assert_eq!(received, packets, "chunk size {chunk}");
            }
        }

        #[test]
        fn returns_peer_closed_after_local_close() {
            let (conn, _peer) = pair();
            let mut pool = PacketPool::new(4, 1500, 4).unwrap();
            conn.close();
            let err = read_packets(&conn, &mut pool, 4).unwrap_err();
            assert!(err.is_peer_closed());
        }
    }
}
