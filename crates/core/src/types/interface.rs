use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Size of the virtio-net header (`virtio_net_hdr_v1`) prepended to each
/// packet when the interface is started with virtio headers enabled.
pub const VIRTIO_NET_HDR_SIZE: usize = 12;

/// Parameters reported by a started virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceParams {
    /// Largest packet the interface reads or writes, excluding any virtio header.
    pub mtu: usize,
    /// Maximum number of packets a single read may return.
    pub max_read_packets: usize,
    /// Maximum number of packets a single write may accept.
    pub max_write_packets: usize,
    /// Whether every packet carries a virtio-net header.
    #[serde(default)]
    pub virtio_header: bool,
}

impl InterfaceParams {
    pub fn new(mtu: usize, max_read_packets: usize, max_write_packets: usize) -> Self {
        Self {
            mtu,
            max_read_packets,
            max_write_packets,
            virtio_header: false,
        }
    }

    pub fn with_virtio_header(mut self, enabled: bool) -> Self {
        self.virtio_header = enabled;
        self
    }

    /// Largest payload a packet descriptor must hold.
    pub fn max_payload(&self) -> usize {
        if self.virtio_header {
            self.mtu + VIRTIO_NET_HDR_SIZE
        } else {
            self.mtu
        }
    }

    /// The wider of the read and write batch limits.
    pub fn max_batch(&self) -> usize {
        self.max_read_packets.max(self.max_write_packets)
    }

    pub fn validate(&self) -> Result<()> {
        if self.mtu == 0 {
            return Err(Error::ConfigurationInvalid(
                "interface MTU must be non-zero".to_string(),
            ));
        }
        if self.mtu > u32::MAX as usize - VIRTIO_NET_HDR_SIZE {
            return Err(Error::ConfigurationInvalid(format!(
                "interface MTU {} does not fit a 32-bit length header",
                self.mtu
            )));
        }
        if self.max_read_packets == 0 || self.max_write_packets == 0 {
            return Err(Error::ConfigurationInvalid(
                "interface batch limits must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Flags describing how the host interface should be started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceOptions {
    /// Let the host allocate a MAC address for the guest.
    #[serde(default = "default_true")]
    pub allocate_mac_address: bool,
    #[serde(default)]
    pub checksum_offload: bool,
    #[serde(default)]
    pub isolation: bool,
    /// TCP segmentation offload.
    #[serde(default)]
    pub tso: bool,
    #[serde(default)]
    pub virtio_header: bool,
}

fn default_true() -> bool {
    true
}

impl Default for InterfaceOptions {
    fn default() -> Self {
        Self {
            allocate_mac_address: true,
            checksum_offload: false,
            isolation: false,
            tso: false,
            virtio_header: false,
        }
    }
}
