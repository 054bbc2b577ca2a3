//! Scripted in-memory `VirtualInterface` for forwarder tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use vmnet_net::{
    ErrorReceiver, Forwarder, Framing, InterfaceParams, PacketPool, PacketsAvailableCallback,
    Result, SocketOptions, VirtualInterface,
};

type SharedCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// Packets queued for the forwarder to read, packets it wrote, and counters
/// for the lifecycle calls.
pub struct MockInterface {
    params: InterfaceParams,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    written: Mutex<Vec<Vec<Vec<u8>>>>,
    written_changed: Condvar,
    callback: Mutex<Option<SharedCallback>>,
    callbacks_set: AtomicUsize,
    stops: AtomicUsize,
    stop_delay: Mutex<Duration>,
}

impl MockInterface {
    pub fn new(params: InterfaceParams) -> Arc<Self> {
        Arc::new(Self {
            params,
            inbound: Mutex::new(VecDeque::new()),
            written: Mutex::new(Vec::new()),
            written_changed: Condvar::new(),
            callback: Mutex::new(None),
            callbacks_set: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            stop_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn with_mtu(mtu: usize) -> Arc<Self> {
        Self::new(InterfaceParams::new(mtu, 8, 8))
    }

    /// Queue packets and fire the packets-available callback from a thread
    /// the forwarder does not own. Returns once the callback has returned.
    pub fn inject(&self, packets: &[Vec<u8>]) {
        self.inbound
            .lock()
            .unwrap()
            .extend(packets.iter().cloned());
        self.fire(packets.len());
    }

    /// Fire the callback with `estimated` from a foreign thread, if one is set.
    pub fn fire(&self, estimated: usize) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            std::thread::spawn(move || callback(estimated))
                .join()
                .unwrap();
        }
    }

    /// Wait until at least `packets` packets have been written, in batches.
    pub fn wait_for_written(&self, packets: usize, timeout: Duration) -> Vec<Vec<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut written = self.written.lock().unwrap();
        loop {
            let total: usize = written.iter().map(Vec::len).sum();
            let now = Instant::now();
            if total >= packets || now >= deadline {
                return written.clone();
            }
            written = self
                .written_changed
                .wait_timeout(written, deadline - now)
                .unwrap()
                .0;
        }
    }

    pub fn written(&self) -> Vec<Vec<Vec<u8>>> {
        self.written.lock().unwrap().clone()
    }

    /// Make `stop` block for `delay`, like an interface waiting on its host.
    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock().unwrap() = delay;
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn callbacks_set(&self) -> usize {
        self.callbacks_set.load(Ordering::SeqCst)
    }

    pub fn has_callback(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }
}

impl VirtualInterface for MockInterface {
    fn params(&self) -> InterfaceParams {
        self.params
    }

    fn read_packets(&self, pool: &mut PacketPool, max: usize) -> Result<usize> {
        let mut inbound = self.inbound.lock().unwrap();
        let mut count = 0;
        while count < max.min(pool.capacity()) {
            let Some(packet) = inbound.pop_front() else {
                break;
            };
            pool.fill(count, &packet)?;
            count += 1;
        }
        Ok(count)
    }

    fn write_packets(&self, pool: &mut PacketPool, n: usize) -> Result<()> {
        let batch: Vec<Vec<u8>> = pool.iter(n).map(|p| p.payload().to_vec()).collect();
        self.written.lock().unwrap().push(batch);
        self.written_changed.notify_all();
        Ok(())
    }

    fn set_packets_available_callback(&self, callback: PacketsAvailableCallback) {
        self.callbacks_set.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock().unwrap() = Some(Arc::from(callback));
    }

    fn stop(&self) -> Result<()> {
        std::thread::sleep(*self.stop_delay.lock().unwrap());
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.callback.lock().unwrap().take();
        Ok(())
    }
}

/// Blocking stream view of the caller's end, with a read timeout.
pub fn stream_peer(fd: OwnedFd) -> UnixStream {
    let peer = UnixStream::from(fd);
    peer.set_nonblocking(false).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    peer
}

/// Blocking datagram view of the caller's end, with a read timeout.
pub fn datagram_peer(fd: OwnedFd) -> UnixDatagram {
    let peer = UnixDatagram::from(fd);
    peer.set_nonblocking(false).unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    peer
}

/// `BE32(len) || payload`.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Read one length-prefixed packet from a stream peer.
pub fn read_frame(peer: &mut UnixStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    peer.read_exact(&mut header).unwrap();
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    peer.read_exact(&mut payload).unwrap();
    payload
}

pub fn write_all(peer: &mut UnixStream, bytes: &[u8]) {
    peer.write_all(bytes).unwrap();
}

/// Payload of `len` bytes whose content identifies packet `tag`.
pub fn packet(tag: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| tag.wrapping_add(i as u8)).collect()
}

/// A forwarder started on a mock interface.
pub struct Running {
    pub mock: Arc<MockInterface>,
    pub forwarder: Arc<Forwarder<MockInterface>>,
    pub errors: ErrorReceiver,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl Running {
    /// Cancel and wait for `start` to return.
    pub async fn shutdown(self) -> (Arc<MockInterface>, ErrorReceiver) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("forwarder did not stop")
            .unwrap();
        (self.mock, self.errors)
    }

    /// Wait for `start` to return on its own.
    pub async fn finished(self) -> (Arc<MockInterface>, ErrorReceiver) {
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("forwarder did not finish")
            .unwrap();
        (self.mock, self.errors)
    }
}

/// Create and start a forwarder, returning once its callback is installed.
pub async fn start(mock: Arc<MockInterface>, framing: Framing) -> (Running, OwnedFd) {
    start_with(mock, framing, &SocketOptions::default()).await
}

pub async fn start_with(
    mock: Arc<MockInterface>,
    framing: Framing,
    options: &SocketOptions,
) -> (Running, OwnedFd) {
    let cancel = CancellationToken::new();
    let (forwarder, peer, errors) =
        Forwarder::new(mock.clone(), framing, options, cancel.clone()).unwrap();
    let forwarder = Arc::new(forwarder);
    let task = {
        let forwarder = forwarder.clone();
        tokio::spawn(async move { forwarder.start().await })
    };
    eventually(|| mock.has_callback()).await;
    (
        Running {
            mock,
            forwarder,
            errors,
            cancel,
            task,
        },
        peer,
    )
}

/// Poll `cond` until it holds, failing after five seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
