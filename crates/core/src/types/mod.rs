mod interface;
mod network;
mod socket;

pub use interface::{InterfaceOptions, InterfaceParams, VIRTIO_NET_HDR_SIZE};
pub use network::{
    AddressFamily, DhcpReservation, Ipv4Subnet, Ipv6Prefix, MIN_MTU, MacAddr, Mode, NetworkConfig,
    PortForwardRule, Protocol,
};
pub use socket::{BufferSizes, DEFAULT_RECEIVE_MULTIPLIER, DEFAULT_SEND_MULTIPLIER, SocketOptions};
