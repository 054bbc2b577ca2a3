pub mod error;
pub mod status;
pub mod types;

pub use error::{Error, Result};
pub use status::Status;
pub use types::{
    AddressFamily, BufferSizes, DEFAULT_RECEIVE_MULTIPLIER, DEFAULT_SEND_MULTIPLIER,
    DhcpReservation, InterfaceOptions, InterfaceParams, Ipv4Subnet, Ipv6Prefix, MIN_MTU, MacAddr,
    Mode, NetworkConfig, PortForwardRule, Protocol, SocketOptions, VIRTIO_NET_HDR_SIZE,
};
