//! Contract between the forwarder and a host virtual network interface.

use crate::pool::PacketPool;
use vmnet_core::{InterfaceParams, Result};

/// Invoked with an estimate of how many packets the interface has ready.
///
/// Called on a thread owned by the interface, never concurrently with
/// itself for the same registration.
pub type PacketsAvailableCallback = Box<dyn Fn(usize) + Send + Sync + 'static>;

/// A started host interface that carries packets to and from the VM network.
pub trait VirtualInterface: Send + Sync + 'static {
    /// MTU and batch limits negotiated at start.
    fn params(&self) -> InterfaceParams;

    /// Read up to `max` packets into the first slots of `pool`.
    ///
    /// Returns how many slots were filled; their lengths are set in the pool.
    /// Zero means nothing was pending.
    fn read_packets(&self, pool: &mut PacketPool, max: usize) -> Result<usize>;

    /// Hand the first `n` packets of `pool` to the interface, in index order.
    fn write_packets(&self, pool: &mut PacketPool, n: usize) -> Result<()>;

    /// Install the callback fired when packets become available, replacing
    /// any previous one.
    fn set_packets_available_callback(&self, callback: PacketsAvailableCallback);

    /// Stop the interface and release the registered callback.
    fn stop(&self) -> Result<()>;
}
