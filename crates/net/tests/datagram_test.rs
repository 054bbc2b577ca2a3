//! Integration tests for datagram forwarding, one syscall per packet and
//! batched.

mod common;

use common::{MockInterface, datagram_peer, packet, start, start_with};
use std::time::Duration;
use vmnet_net::{Error, Framing, InterfaceParams, SocketOptions};

const WAIT: Duration = Duration::from_secs(5);
const FRAMINGS: [Framing; 2] = [Framing::Datagram, Framing::DatagramBatch];
const SIZES: [usize; 8] = [64, 128, 1500, 1500, 200, 64, 64, 1500];

// =============================================================================
// Interface → peer
// =============================================================================

/// Eight packets read in one callback leave as eight datagrams, in order and
/// with their original lengths.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagram_batch_of_eight() {
    for framing in FRAMINGS {
        let mock = MockInterface::new(InterfaceParams::new(1500, 8, 8));
        let (running, fd) = start(mock.clone(), framing).await;
        let peer = datagram_peer(fd);

        let packets: Vec<Vec<u8>> = SIZES
            .iter()
            .enumerate()
            .map(|(i, &len)| packet(i as u8, len))
            .collect();
        mock.inject(&packets);

        let mut buf = [0u8; 2048];
        for expected in &packets {
            let n = peer.recv(&mut buf).unwrap();
            assert_eq!(&buf[..n], expected.as_slice(), "{framing:?}");
        }
        running.shutdown().await;
    }
}

/// A peer that is slow to drain its socket loses nothing; sends are retried
/// until the kernel accepts them.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagram_backpressure_drops_nothing() {
    for framing in FRAMINGS {
        let mock = MockInterface::new(InterfaceParams::new(1500, 8, 8));
        let small = SocketOptions::default()
            .send_buffer_size(1)
            .receive_buffer_size(1);
        let (running, fd) = start_with(mock.clone(), framing, &small).await;
        let peer = datagram_peer(fd);

        let packets: Vec<Vec<u8>> = (0..64).map(|i| packet(i, 1500)).collect();
        let count = packets.len();
        let reader = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            let mut buf = [0u8; 2048];
            let received: Vec<Vec<u8>> = (0..count)
                .map(|_| {
                    let n = peer.recv(&mut buf).unwrap();
                    buf[..n].to_vec()
                })
                .collect();
            received
        });
        mock.inject(&packets);

        assert_eq!(reader.join().unwrap(), packets, "{framing:?}");
        running.shutdown().await;
    }
}

/// A peer that stops reading cannot hold the interface callback: the burst
/// beyond what its socket holds is dropped and forwarding carries on once it
/// reads again. Only Linux pushes back with `EAGAIN`; elsewhere a full
/// datagram peer is retried through `ENOBUFS`.
#[cfg(target_os = "linux")]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagram_idle_peer_does_not_block_callback() {
    use std::time::Instant;
    use vmnet_net::{ForwarderState, PEER_STALL_TIMEOUT};

    for framing in FRAMINGS {
        let mock = MockInterface::new(InterfaceParams::new(1500, 8, 8));
        let small = SocketOptions::default()
            .send_buffer_size(1)
            .receive_buffer_size(1);
        let (running, fd) = start_with(mock.clone(), framing, &small).await;
        let peer = datagram_peer(fd);

        let burst: Vec<Vec<u8>> = (0..64).map(|i| packet(i, 1500)).collect();
        let started = Instant::now();
        mock.inject(&burst);
        assert!(
            started.elapsed() < PEER_STALL_TIMEOUT * 3,
            "{framing:?} callback held for {:?}",
            started.elapsed()
        );
        assert_eq!(running.forwarder.state(), ForwarderState::Started);

        let late = packet(200, 100);
        let expected_late = late.clone();
        let reader = std::thread::spawn(move || {
            let mut buf = [0u8; 2048];
            let mut received = Vec::new();
            loop {
                let n = peer.recv(&mut buf).unwrap();
                received.push(buf[..n].to_vec());
                if buf[..n] == expected_late[..] {
                    return received;
                }
            }
        });
        mock.inject(&[late.clone()]);
        // Drain whatever the stalled callback left on the interface.
        mock.fire(burst.len());

        let received = reader.join().unwrap();
        let (last, earlier) = received.split_last().unwrap();
        assert_eq!(last, &late, "{framing:?}");
        assert!(earlier.len() < burst.len(), "{framing:?}");
        let tags: Vec<u8> = earlier.iter().map(|p| p[0]).collect();
        assert!(tags.windows(2).all(|w| w[0] < w[1]), "{framing:?}");
        for p in earlier {
            assert_eq!(p, &burst[p[0] as usize]);
        }

        let (_, mut errors) = running.shutdown().await;
        assert!(errors.try_recv().is_err());
    }
}

// =============================================================================
// Peer → interface
// =============================================================================

/// Datagrams echoed by the peer reach the interface unchanged and in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagram_echo_round_trip() {
    for framing in FRAMINGS {
        let mock = MockInterface::with_mtu(1500);
        let (running, fd) = start(mock.clone(), framing).await;
        let peer = datagram_peer(fd);

        // More than the socket buffer holds: the peer echoes while the
        // interface is still being drained.
        let packets: Vec<Vec<u8>> = (0..24).map(|i| packet(i, 60 + i as usize * 60)).collect();
        let count = packets.len();
        let echo = std::thread::spawn(move || {
            let mut buf = [0u8; 2048];
            for _ in 0..count {
                let n = peer.recv(&mut buf).unwrap();
                peer.send(&buf[..n]).unwrap();
            }
            peer
        });
        mock.inject(&packets);
        let _peer = echo.join().unwrap();

        let written = mock.wait_for_written(packets.len(), WAIT);
        assert_eq!(written.concat(), packets, "{framing:?}");
        for batch in &written {
            assert!(batch.len() <= 8);
        }
        running.shutdown().await;
    }
}

/// A zero-length datagram ends forwarding quietly.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagram_zero_length_closes() {
    for framing in FRAMINGS {
        let mock = MockInterface::with_mtu(1500);
        let (running, fd) = start(mock.clone(), framing).await;
        let peer = datagram_peer(fd);

        peer.send(b"last").unwrap();
        peer.send(b"").unwrap();

        let (mock, mut errors) = running.finished().await;
        assert_eq!(mock.written().concat(), vec![b"last".to_vec()], "{framing:?}");
        assert_eq!(mock.stop_count(), 1);
        assert!(errors.try_recv().is_err());
    }
}

/// A datagram larger than the interface MTU is reported and ends forwarding.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_datagram_oversized_is_reported() {
    for framing in FRAMINGS {
        let mock = MockInterface::with_mtu(1500);
        let (running, fd) = start(mock.clone(), framing).await;
        let peer = datagram_peer(fd);

        peer.send(&packet(0, 1600)).unwrap();

        let (mock, mut errors) = running.finished().await;
        assert!(
            matches!(
                errors.recv().await,
                Some(Error::PacketTooLarge { max: 1500, .. })
            ),
            "{framing:?}"
        );
        assert_eq!(mock.stop_count(), 1);
        assert!(mock.written().is_empty());
    }
}
