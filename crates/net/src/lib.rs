//! Packet forwarding between a host virtual network interface and a
//! socket pair handed to a VM monitor.
//!
//! ```no_run
//! # #[cfg(target_os = "macos")]
//! # async fn run() -> vmnet_net::Result<()> {
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use vmnet_net::{Forwarder, Framing, InterfaceOptions, NetworkConfig, SocketOptions, VmnetInterface};
//!
//! let iface = Arc::new(VmnetInterface::start(
//!     &InterfaceOptions::default(),
//!     &NetworkConfig::shared().subnet("192.168.105.0/24")?,
//! )?);
//! let cancel = CancellationToken::new();
//! let (forwarder, vm_fd, mut errors) =
//!     Forwarder::new(iface, Framing::DatagramBatch, &SocketOptions::default(), cancel.clone())?;
//! // hand `vm_fd` to the VM, then:
//! tokio::spawn(async move {
//!     while let Some(err) = errors.recv().await {
//!         eprintln!("forwarder: {err}");
//!     }
//! });
//! forwarder.start().await;
//! # drop(vm_fd);
//! # Ok(())
//! # }
//! ```

pub mod callback;
mod forwarder;
mod framer;
mod interface;
mod pool;
mod socketpair;

#[cfg(target_os = "macos")]
mod vmnet;

pub use callback::{CallbackHandle, vmnet_packets_available};
pub use forwarder::{ERROR_CHANNEL_CAPACITY, ErrorReceiver, Forwarder, ForwarderState};
pub use framer::{ENOBUFS_BACKOFF, Framing, FromPeer, PEER_STALL_TIMEOUT, ToPeer};
pub use interface::{PacketsAvailableCallback, VirtualInterface};
pub use pool::{Packet, PacketDesc, PacketPool, STREAM_HEADER_SIZE};
pub use socketpair::{Connection, SEND_LOW_WATER, SocketKind, socket_pair};

#[cfg(target_os = "macos")]
pub use vmnet::{NetworkSerialization, VmnetInterface, VmnetNetwork};

pub use vmnet_core::{
    AddressFamily, BufferSizes, DhcpReservation, Error, InterfaceOptions, InterfaceParams,
    Ipv4Subnet, Ipv6Prefix, MacAddr, Mode, NetworkConfig, PortForwardRule, Protocol, Result,
    SocketOptions, Status,
};
