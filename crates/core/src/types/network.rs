use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Smallest MTU accepted for a network (the IPv6 minimum link MTU).
pub const MIN_MTU: u32 = 1280;

/// Range every configured IPv4 subnet must fall into.
const PRIVATE_RANGE: Ipv4Subnet = Ipv4Subnet {
    addr: Ipv4Addr::new(192, 168, 0, 0),
    prefix: 16,
};

/// Operating mode of the host network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Guests can reach each other and the host only.
    Host,
    /// Guests are NATed through the host's external interface.
    #[default]
    Shared,
}

impl Mode {
    /// Raw `operating_modes_t` value.
    pub fn raw(self) -> u64 {
        match self {
            Mode::Host => 1000,
            Mode::Shared => 1001,
        }
    }
}

/// An IPv4 network in CIDR notation, e.g. `192.168.105.0/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Subnet {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Subnet {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::ConfigurationInvalid(format!(
                "IPv4 prefix length {prefix} is out of range"
            )));
        }
        Ok(Self { addr, prefix })
    }

    /// Build a subnet from an address and a dotted netmask, as the host
    /// framework reports them. The mask must be contiguous.
    pub fn from_netmask(addr: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self> {
        let bits = u32::from(netmask);
        let prefix = bits.leading_ones();
        if bits.checked_shl(prefix).unwrap_or(0) != 0 {
            return Err(Error::ConfigurationInvalid(format!(
                "netmask {netmask} is not contiguous"
            )));
        }
        Self::new(addr, prefix as u8)
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(mask_bits(self.prefix))
    }

    /// The network address with host bits cleared.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & mask_bits(self.prefix))
    }

    /// First host address of the network, reserved for the host side.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()).wrapping_add(1))
    }

    pub fn first_assignable(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()).wrapping_add(2))
    }

    pub fn last_assignable(&self) -> Ipv4Addr {
        let broadcast = u32::from(self.network()) | !mask_bits(self.prefix);
        Ipv4Addr::from(broadcast.wrapping_sub(1))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & mask_bits(self.prefix) == u32::from(self.network())
    }

    pub fn overlaps(&self, other: &Ipv4Subnet) -> bool {
        let mask = mask_bits(self.prefix.min(other.prefix));
        u32::from(self.addr) & mask == u32::from(other.addr) & mask
    }

    fn validate(&self) -> Result<()> {
        if !self.overlaps(&PRIVATE_RANGE) {
            return Err(Error::ConfigurationInvalid(format!(
                "subnet {self} is out of range (must be within {PRIVATE_RANGE})"
            )));
        }
        if self.prefix > 30 {
            return Err(Error::ConfigurationInvalid(format!(
                "subnet {self} has no assignable addresses"
            )));
        }
        Ok(())
    }
}

fn mask_bits(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    }
}

impl FromStr for Ipv4Subnet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = split_cidr(s)?;
        let addr = addr.parse::<Ipv4Addr>().map_err(|_| {
            Error::ConfigurationInvalid(format!("subnet {s} is not an IPv4 network"))
        })?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Subnet {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Ipv4Subnet> for String {
    fn from(subnet: Ipv4Subnet) -> Self {
        subnet.to_string()
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// An IPv6 prefix, e.g. `fd00:1234::/64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv6Prefix {
    addr: Ipv6Addr,
    len: u8,
}

impl Ipv6Prefix {
    pub fn new(addr: Ipv6Addr, len: u8) -> Result<Self> {
        if len > 128 {
            return Err(Error::ConfigurationInvalid(format!(
                "IPv6 prefix length {len} is out of range"
            )));
        }
        Ok(Self { addr, len })
    }

    pub fn addr(&self) -> Ipv6Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.len
    }
}

impl FromStr for Ipv6Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, len) = split_cidr(s)?;
        let addr = addr.parse::<Ipv6Addr>().map_err(|_| {
            Error::ConfigurationInvalid(format!("prefix {s} is not an IPv6 network"))
        })?;
        Self::new(addr, len)
    }
}

impl TryFrom<String> for Ipv6Prefix {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Ipv6Prefix> for String {
    fn from(prefix: Ipv6Prefix) -> Self {
        prefix.to_string()
    }
}

impl fmt::Display for Ipv6Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

fn split_cidr(s: &str) -> Result<(&str, u8)> {
    let (addr, prefix) = s.split_once('/').ok_or_else(|| {
        Error::ConfigurationInvalid(format!("{s} is not in address/prefix notation"))
    })?;
    let prefix = prefix
        .parse::<u8>()
        .map_err(|_| Error::ConfigurationInvalid(format!("{s} has an invalid prefix length")))?;
    Ok((addr, prefix))
}

/// An Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::ConfigurationInvalid(format!("invalid MAC address: {s}"));
        let mut octets = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(MacAddr(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Fixed DHCP lease for a guest MAC address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpReservation {
    pub mac: MacAddr,
    pub address: Ipv4Addr,
}

/// Transport protocol of a port-forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// `IPPROTO_*` number.
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

/// Address family of a port-forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Inet,
    Inet6,
}

/// Port forwarding rule: external_port on the host → internal_address:internal_port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardRule {
    pub protocol: Protocol,
    pub family: AddressFamily,
    pub internal_port: u16,
    pub external_port: u16,
    pub internal_address: IpAddr,
}

impl PortForwardRule {
    pub fn tcp(external_port: u16, internal_address: IpAddr, internal_port: u16) -> Self {
        Self::new(Protocol::Tcp, external_port, internal_address, internal_port)
    }

    pub fn udp(external_port: u16, internal_address: IpAddr, internal_port: u16) -> Self {
        Self::new(Protocol::Udp, external_port, internal_address, internal_port)
    }

    fn new(
        protocol: Protocol,
        external_port: u16,
        internal_address: IpAddr,
        internal_port: u16,
    ) -> Self {
        let family = match internal_address {
            IpAddr::V4(_) => AddressFamily::Inet,
            IpAddr::V6(_) => AddressFamily::Inet6,
        };
        Self {
            protocol,
            family,
            internal_port,
            external_port,
            internal_address,
        }
    }

    fn validate(&self) -> Result<()> {
        match (self.family, self.internal_address) {
            (AddressFamily::Inet, IpAddr::V4(_)) | (AddressFamily::Inet6, IpAddr::V6(_)) => {}
            (AddressFamily::Inet, _) => {
                return Err(Error::ConfigurationInvalid(format!(
                    "internal address {} is not IPv4",
                    self.internal_address
                )));
            }
            (AddressFamily::Inet6, _) => {
                return Err(Error::ConfigurationInvalid(format!(
                    "internal address {} is not IPv6",
                    self.internal_address
                )));
            }
        }
        if self.internal_port == 0 || self.external_port == 0 {
            return Err(Error::ConfigurationInvalid(
                "port forwarding ports must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Declarative configuration of the host network an interface attaches to.
///
/// Nothing here affects the forwarder at runtime; it is applied once when the
/// host interface starts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub ipv4_subnet: Option<Ipv4Subnet>,
    #[serde(default)]
    pub ipv6_prefix: Option<Ipv6Prefix>,
    #[serde(default)]
    pub dhcp_reservations: Vec<DhcpReservation>,
    #[serde(default)]
    pub port_forwards: Vec<PortForwardRule>,
    #[serde(default)]
    pub disable_dhcp: bool,
    #[serde(default)]
    pub disable_dns_proxy: bool,
    #[serde(default)]
    pub disable_nat44: bool,
    #[serde(default)]
    pub disable_nat66: bool,
    #[serde(default)]
    pub disable_router_advertisement: bool,
    /// Host interface used for NAT in shared mode.
    #[serde(default)]
    pub external_interface: Option<String>,
    #[serde(default)]
    pub mtu: Option<u32>,
}

impl NetworkConfig {
    pub fn shared() -> Self {
        Self::default()
    }

    pub fn host() -> Self {
        Self {
            mode: Mode::Host,
            ..Self::default()
        }
    }

    /// Set the IPv4 subnet (e.g., "192.168.105.0/24").
    pub fn subnet(mut self, subnet: &str) -> Result<Self> {
        self.ipv4_subnet = Some(subnet.parse()?);
        Ok(self)
    }

    /// Reserve a DHCP address for a MAC address.
    pub fn reserve(mut self, mac: MacAddr, address: Ipv4Addr) -> Self {
        self.dhcp_reservations.push(DhcpReservation { mac, address });
        self
    }

    pub fn forward(mut self, rule: PortForwardRule) -> Self {
        self.port_forwards.push(rule);
        self
    }

    /// The first setting that only the network-configuration start can
    /// apply, or `None` if the dictionary start covers everything.
    pub fn needs_network_api(&self) -> Option<&'static str> {
        let settings = [
            (!self.dhcp_reservations.is_empty(), "DHCP reservations"),
            (self.disable_dhcp, "disabling DHCP"),
            (self.disable_dns_proxy, "disabling the DNS proxy"),
            (self.disable_nat44, "disabling NAT44"),
            (self.disable_nat66, "disabling NAT66"),
            (self.disable_router_advertisement, "disabling router advertisement"),
            (self.external_interface.is_some(), "choosing the external interface"),
            (
                self.port_forwards
                    .iter()
                    .any(|rule| rule.family == AddressFamily::Inet6),
                "IPv6 port forwarding",
            ),
        ];
        settings
            .into_iter()
            .find_map(|(set, what)| set.then_some(what))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(subnet) = &self.ipv4_subnet {
            subnet.validate()?;
        }
        for reservation in &self.dhcp_reservations {
            if let Some(subnet) = &self.ipv4_subnet
                && !subnet.contains(reservation.address)
            {
                return Err(Error::ConfigurationInvalid(format!(
                    "reservation {} for {} is outside subnet {subnet}",
                    reservation.address, reservation.mac
                )));
            }
        }
        for rule in &self.port_forwards {
            rule.validate()?;
        }
        if self.external_interface.is_some() && self.mode != Mode::Shared {
            return Err(Error::ConfigurationInvalid(
                "external interface is only available in shared mode".to_string(),
            ));
        }
        if let Some(mtu) = self.mtu
            && mtu < MIN_MTU
        {
            return Err(Error::ConfigurationInvalid(format!(
                "MTU {mtu} is below the minimum of {MIN_MTU}"
            )));
        }
        Ok(())
    }
}
