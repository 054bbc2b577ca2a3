//! Packet forwarding between a virtual interface and a socket pair.
//!
//! A [`Forwarder`] owns one end of a socket pair and hands the other to the
//! caller, typically to pass to a VM as its network backend. Once started it
//! runs two paths until either side goes away:
//!
//! - interface → peer, driven by the interface's packets-available callback,
//! - peer → interface, a blocking reader on the connection.
//!
//! A cancellation watcher closes the connection when the token fires, which
//! unblocks the reader and fails the callback's next write.

use crate::framer::{Framing, FromPeer, ToPeer};
use crate::interface::VirtualInterface;
use crate::socketpair::{Connection, socket_pair};
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use vmnet_core::{Error, Result, SocketOptions};

/// Slots in the error channel; reports beyond this are dropped.
pub const ERROR_CHANNEL_CAPACITY: usize = 10;

/// Errors reported by a running forwarder.
pub type ErrorReceiver = mpsc::Receiver<Error>;

/// Lifecycle of a forwarder. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ForwarderState {
    Constructed = 0,
    Started = 1,
    Draining = 2,
    Closed = 3,
}

impl ForwarderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ForwarderState::Constructed,
            1 => ForwarderState::Started,
            2 => ForwarderState::Draining,
            _ => ForwarderState::Closed,
        }
    }
}

#[derive(Debug, Default)]
struct StateCell(AtomicU8);

impl StateCell {
    fn get(&self) -> ForwarderState {
        ForwarderState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn advance(&self, to: ForwarderState) {
        let prev = ForwarderState::from_u8(self.0.fetch_max(to as u8, Ordering::AcqRel));
        if prev < to {
            debug!(from = ?prev, to = ?to, "forwarder: state changed");
        }
    }
}

/// Bounded, lossy error reporting.
#[derive(Debug, Clone)]
struct ErrorSink(mpsc::Sender<Error>);

impl ErrorSink {
    fn report(&self, err: Error) {
        if err.is_peer_closed() {
            debug!(error = %err, "forwarder: connection closed");
            return;
        }
        warn!(error = %err, "forwarder: error");
        if self.0.try_send(err).is_err() {
            trace!("forwarder: error channel full, report dropped");
        }
    }
}

/// Shared by both data paths and the watcher.
struct Shared {
    conn: Connection,
    state: StateCell,
    errors: ErrorSink,
}

impl Shared {
    /// Begin shutdown after a terminal condition on either path.
    fn fail(&self, err: Error) {
        self.conn.close();
        self.state.advance(ForwarderState::Draining);
        self.errors.report(err);
    }
}

/// Forwards packets between a virtual interface and a socket pair.
pub struct Forwarder<I: VirtualInterface> {
    iface: Arc<I>,
    framing: Framing,
    shared: Arc<Shared>,
    halves: Mutex<Option<(ToPeer, FromPeer)>>,
    started: AtomicBool,
    stopped: AtomicBool,
    cancel: CancellationToken,
}

impl<I: VirtualInterface> Forwarder<I> {
    /// Prepare a forwarder for a started interface.
    ///
    /// Returns the forwarder, the caller's end of the socket pair and the
    /// receiving side of the error channel. Nothing runs until
    /// [`start`](Self::start). If the socket pair or the buffers cannot be
    /// set up, the interface is stopped before the error is returned.
    pub fn new(
        iface: Arc<I>,
        framing: Framing,
        user: &SocketOptions,
        cancel: CancellationToken,
    ) -> Result<(Self, OwnedFd, ErrorReceiver)> {
        let params = iface.params();
        let prepared = framing.allocate(&params).and_then(|halves| {
            let sizes = framing.tune_socket_options(&params, user);
            let (conn, peer) = socket_pair(framing.socket_kind(), sizes)?;
            Ok((halves, conn, peer))
        });
        let (halves, conn, peer) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                if let Err(stop_err) = iface.stop() {
                    warn!(error = %stop_err, "forwarder: failed to stop interface after setup error");
                }
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        debug!(
            ?framing,
            mtu = params.mtu,
            max_read = params.max_read_packets,
            max_write = params.max_write_packets,
            "forwarder: created"
        );

        let forwarder = Self {
            iface,
            framing,
            shared: Arc::new(Shared {
                conn,
                state: StateCell::default(),
                errors: ErrorSink(tx),
            }),
            halves: Mutex::new(Some(halves)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            cancel,
        };
        Ok((forwarder, peer, rx))
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn state(&self) -> ForwarderState {
        self.shared.state.get()
    }

    /// Run the data plane until cancellation, peer closure or a fatal error.
    ///
    /// Only the first call does anything; it returns once both paths have
    /// finished and the interface has been stopped. Later or concurrent
    /// calls return immediately.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some((to_peer, from_peer)) = self
            .halves
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        self.shared.state.advance(ForwarderState::Started);
        debug!(framing = ?self.framing, "forwarder: started");

        self.iface
            .set_packets_available_callback(interface_to_peer(
                Arc::downgrade(&self.iface),
                self.shared.clone(),
                to_peer,
            ));

        let reader = {
            let iface = self.iface.clone();
            let shared = self.shared.clone();
            tokio::task::spawn_blocking(move || peer_to_interface(&*iface, &shared, from_peer))
        };

        let done = CancellationToken::new();
        let watcher = {
            let shared = self.shared.clone();
            let cancel = self.cancel.clone();
            let done = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("forwarder: cancelled");
                        shared.state.advance(ForwarderState::Draining);
                        shared.conn.close();
                    }
                    _ = done.cancelled() => {}
                }
            })
        };

        if let Err(e) = reader.await {
            self.shared.fail(Error::Io(std::io::Error::other(e)));
        }

        self.shared.state.advance(ForwarderState::Draining);
        self.shared.conn.close();
        self.stop_interface_blocking().await;
        done.cancel();
        if let Err(e) = watcher.await {
            warn!(error = %e, "forwarder: cancellation watcher failed");
        }
        self.shared.state.advance(ForwarderState::Closed);
        debug!("forwarder: stopped");
    }

    /// [`stop_interface`](Self::stop_interface) on the blocking pool, since
    /// an interface may wait for its host framework to confirm the stop.
    async fn stop_interface_blocking(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let iface = self.iface.clone();
        let result = tokio::task::spawn_blocking(move || iface.stop())
            .await
            .unwrap_or_else(|e| Err(Error::Io(std::io::Error::other(e))));
        if let Err(e) = result {
            self.shared.errors.report(e);
        }
    }

    /// Stop the interface at most once, reporting failure.
    fn stop_interface(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.iface.stop() {
            self.shared.errors.report(e);
        }
    }
}

impl<I: VirtualInterface> Drop for Forwarder<I> {
    fn drop(&mut self) {
        self.shared.conn.close();
        self.stop_interface();
    }
}

impl<I: VirtualInterface> std::fmt::Debug for Forwarder<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("framing", &self.framing)
            .field("state", &self.state())
            .finish()
    }
}

/// Build the packets-available callback: drain the interface into the peer.
fn interface_to_peer<I: VirtualInterface>(
    iface: Weak<I>,
    shared: Arc<Shared>,
    to_peer: ToPeer,
) -> crate::interface::PacketsAvailableCallback {
    let to_peer = Mutex::new(to_peer);
    Box::new(move |estimated| {
        let Some(iface) = iface.upgrade() else {
            return;
        };
        if shared.conn.is_closed() {
            return;
        }
        let mut half = to_peer.lock().unwrap_or_else(PoisonError::into_inner);
        let limit = half.read_limit();
        let mut remaining = estimated;
        while remaining > 0 {
            half.pool_mut().reset();
            let n = match iface.read_packets(half.pool_mut(), remaining.min(limit)) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return shared.fail(e),
            };
            match half.write_packets_to_peer(&shared.conn, n) {
                Ok(true) => {}
                // Peer is not reading; leave the rest queued on the interface.
                Ok(false) => return,
                Err(e) => return shared.fail(e),
            }
            trace!(packets = n, "forwarder: interface → peer");
            remaining = remaining.saturating_sub(n);
        }
    })
}

/// Blocking loop: frame packets from the peer and hand them to the interface.
fn peer_to_interface<I: VirtualInterface>(iface: &I, shared: &Shared, mut from_peer: FromPeer) {
    loop {
        let n = match from_peer.read_packets_from_peer(&shared.conn) {
            Ok(n) => n,
            Err(e) if e.is_peer_closed() => {
                debug!("forwarder: peer closed");
                shared.conn.close();
                shared.state.advance(ForwarderState::Draining);
                return;
            }
            Err(e) => return shared.fail(e),
        };
        if let Err(e) = iface.write_packets(from_peer.pool_mut(), n) {
            return shared.fail(e);
        }
        trace!(packets = n, "forwarder: peer → interface");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod state {
        use super::*;

        #[test]
        fn starts_constructed() {
            assert_eq!(StateCell::default().get(), ForwarderState::Constructed);
        }

        #[test]
        fn never_moves_backwards() {
            let cell = StateCell::default();
            cell.advance(ForwarderState::Draining);
            cell.advance(ForwarderState::Started);
            assert_eq!(cell.get(), ForwarderState::Draining);
            cell.advance(ForwarderState::Closed);
            cell.advance(ForwarderState::Constructed);
            assert_eq!(cell.get(), ForwarderState::Closed);
        }

        #[test]
        fn states_are_ordered() {
            assert!(ForwarderState::Constructed < ForwarderState::Started);
            assert!(ForwarderState::Started < ForwarderState::Draining);
            assert!(ForwarderState::Draining < ForwarderState::Closed);
        }
    }

    mod error_sink {
        use super::*;

        #[test]
        fn closure_is_not_reported() {
            let (tx, mut rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
            let sink = ErrorSink(tx);
            sink.report(Error::PeerClosed);
            sink.report(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
            assert!(rx.try_recv().is_err());
        }

        #[test]
        fn full_channel_drops_newer_errors() {
            let (tx, mut rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
            let sink = ErrorSink(tx);
            for len in 0..ERROR_CHANNEL_CAPACITY + 5 {
                sink.report(Error::ProtocolViolation { len, max: 1500 });
            }

            let mut lens = Vec::new();
            while let Ok(err) = rx.try_recv() {
                match err {
                    Error::ProtocolViolation { len, .. } => lens.push(len),
                    other => panic!("unexpected error: {other}"),
                }
            }
            assert_eq!(lens, (0..ERROR_CHANNEL_CAPACITY).collect::<Vec<_>>());
        }

        #[test]
        fn closed_receiver_is_ignored() {
            let (tx, rx) = mpsc::channel(1);
            drop(rx);
            ErrorSink(tx).report(Error::TransientBufferExhausted);
        }
    }
}
