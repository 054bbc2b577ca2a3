//! Shared vmnet networks built through the network configuration API.
//!
//! A [`VmnetNetwork`] carries settings the dictionary start has no key for
//! and can be serialized to hand the same network to another process.

use super::ffi::{self, CFRelease, NetworkApi, NetworkConfigurationRef, NetworkRef, XpcObject};
use std::ffi::c_void;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;
use vmnet_core::{
    DhcpReservation, Error, Ipv4Subnet, Ipv6Prefix, NetworkConfig, PortForwardRule, Result,
    Status,
};

fn api() -> Result<&'static NetworkApi> {
    ffi::network_api().ok_or_else(|| {
        Error::InterfaceStartFailed(
            "the vmnet network configuration API is not available on this host".to_string(),
        )
    })
}

fn in_addr(addr: Ipv4Addr) -> libc::in_addr {
    libc::in_addr {
        s_addr: u32::from(addr).to_be(),
    }
}

fn in6_addr(addr: Ipv6Addr) -> libc::in6_addr {
    libc::in6_addr {
        s6_addr: addr.octets(),
    }
}

/// Owned `vmnet_network_configuration_ref`.
struct Configuration {
    api: &'static NetworkApi,
    raw: NetworkConfigurationRef,
}

impl Configuration {
    fn new(api: &'static NetworkApi, config: &NetworkConfig) -> Result<Self> {
        let mut status: u32 = 0;
        // SAFETY: status is a valid out pointer.
        let raw = unsafe { (api.configuration_create)(config.mode.raw() as u32, &mut status) };
        Status::from(status).into_result("create network configuration")?;
        if raw.is_null() {
            return Err(Error::InterfaceStartFailed(
                "vmnet_network_configuration_create returned NULL".to_string(),
            ));
        }
        let mut this = Self { api, raw };
        this.apply(config)?;
        Ok(this)
    }

    fn apply(&mut self, config: &NetworkConfig) -> Result<()> {
        if let Some(subnet) = &config.ipv4_subnet {
            self.set_ipv4_subnet(subnet)?;
        }
        if let Some(prefix) = &config.ipv6_prefix {
            self.set_ipv6_prefix(prefix)?;
        }
        if let Some(mtu) = config.mtu {
            // SAFETY: self.raw is live for the lifetime of self.
            let status = unsafe { (self.api.set_mtu)(self.raw, mtu) };
            Status::from(status).into_result("set mtu")?;
        }
        if let Some(ifname) = &config.external_interface {
            let ifname = ffi::c_string(ifname)?;
            // SAFETY: the framework copies the name.
            let status = unsafe { (self.api.set_external_interface)(self.raw, ifname.as_ptr()) };
            Status::from(status).into_result("set external interface")?;
        }
        let toggles = [
            (config.disable_dhcp, self.api.disable_dhcp),
            (config.disable_dns_proxy, self.api.disable_dns_proxy),
            (config.disable_nat44, self.api.disable_nat44),
            (config.disable_nat66, self.api.disable_nat66),
            (
                config.disable_router_advertisement,
                self.api.disable_router_advertisement,
            ),
        ];
        for (set, disable) in toggles {
            if set {
                // SAFETY: self.raw is live.
                unsafe { disable(self.raw) };
            }
        }
        for reservation in &config.dhcp_reservations {
            self.add_dhcp_reservation(reservation)?;
        }
        for rule in &config.port_forwards {
            self.add_port_forward(rule)?;
        }
        Ok(())
    }

    fn set_ipv4_subnet(&mut self, subnet: &Ipv4Subnet) -> Result<()> {
        let gateway = in_addr(subnet.gateway());
        let mask = in_addr(subnet.netmask());
        // SAFETY: both addresses outlive the call.
        let status = unsafe { (self.api.set_ipv4_subnet)(self.raw, &gateway, &mask) };
        Status::from(status).into_result("set ipv4 subnet")
    }

    fn set_ipv6_prefix(&mut self, prefix: &Ipv6Prefix) -> Result<()> {
        let addr = in6_addr(prefix.addr());
        // SAFETY: addr outlives the call.
        let status = unsafe { (self.api.set_ipv6_prefix)(self.raw, &addr, prefix.prefix_len()) };
        Status::from(status).into_result("set ipv6 prefix")
    }

    fn add_dhcp_reservation(&mut self, reservation: &DhcpReservation) -> Result<()> {
        let mac = reservation.mac.0;
        let addr = in_addr(reservation.address);
        // SAFETY: both pointers outlive the call.
        let status = unsafe { (self.api.add_dhcp_reservation)(self.raw, &mac, &addr) };
        Status::from(status).into_result("add dhcp reservation")
    }

    fn add_port_forward(&mut self, rule: &PortForwardRule) -> Result<()> {
        let (v4, v6);
        let (family, address) = match rule.internal_address {
            IpAddr::V4(addr) => {
                v4 = in_addr(addr);
                (libc::AF_INET, &v4 as *const libc::in_addr as *const c_void)
            }
            IpAddr::V6(addr) => {
                v6 = in6_addr(addr);
                (libc::AF_INET6, &v6 as *const libc::in6_addr as *const c_void)
            }
        };
        // SAFETY: address points at the in_addr or in6_addr matching family.
        let status = unsafe {
            (self.api.add_port_forwarding_rule)(
                self.raw,
                rule.protocol.number(),
                family as libc::sa_family_t,
                rule.internal_port,
                rule.external_port,
                address,
            )
        };
        Status::from(status).into_result("add port forwarding rule")
    }
}

impl Drop for Configuration {
    fn drop(&mut self) {
        // SAFETY: the configuration was created by this process and released once.
        unsafe { CFRelease(self.raw) }
    }
}

/// A vmnet network that interfaces can be started on.
pub struct VmnetNetwork {
    api: &'static NetworkApi,
    raw: NetworkRef,
}

// SAFETY: vmnet network objects are immutable once created and safe to
// share between threads.
unsafe impl Send for VmnetNetwork {}
// SAFETY: as above.
unsafe impl Sync for VmnetNetwork {}

impl VmnetNetwork {
    /// Whether the host's vmnet framework has the network configuration API.
    pub fn is_available() -> bool {
        ffi::network_api().is_some()
    }

    /// Create a network from `config`.
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        config.validate()?;
        let api = api()?;
        let configuration = Configuration::new(api, config)?;
        let mut status: u32 = 0;
        // SAFETY: the configuration is live; status is a valid out pointer.
        let raw = unsafe { (api.network_create)(configuration.raw, &mut status) };
        Self::wrap(api, raw, status, "create network")
    }

    /// Recreate a network serialized by [`VmnetNetwork::copy_serialization`],
    /// usually in another process.
    pub fn from_serialization(serialization: &NetworkSerialization) -> Result<Self> {
        let api = api()?;
        let mut status: u32 = 0;
        // SAFETY: serialization holds a live XPC object.
        let raw = unsafe { (api.network_create_with_serialization)(serialization.0, &mut status) };
        Self::wrap(api, raw, status, "create network from serialization")
    }

    fn wrap(api: &'static NetworkApi, raw: NetworkRef, status: u32, op: &'static str) -> Result<Self> {
        Status::from(status).into_result(op)?;
        if raw.is_null() {
            return Err(Error::InterfaceStartFailed(format!("{op}: NULL network")));
        }
        let network = Self { api, raw };
        debug!(subnet = ?network.ipv4_subnet().ok(), "vmnet: network created");
        Ok(network)
    }

    /// Serialize the network so another process can join it.
    pub fn copy_serialization(&self) -> Result<NetworkSerialization> {
        let mut status: u32 = 0;
        // SAFETY: self.raw is live; status is a valid out pointer.
        let raw = unsafe { (self.api.network_copy_serialization)(self.raw, &mut status) };
        Status::from(status).into_result("copy serialization")?;
        // SAFETY: the copy is owned by the caller.
        unsafe { NetworkSerialization::from_raw(raw) }
            .ok_or_else(|| Error::InterfaceStartFailed("copy serialization: NULL object".to_string()))
    }

    /// The IPv4 subnet the host assigned, identified by its gateway address.
    pub fn ipv4_subnet(&self) -> Result<Ipv4Subnet> {
        let mut subnet = in_addr(Ipv4Addr::UNSPECIFIED);
        let mut mask = in_addr(Ipv4Addr::UNSPECIFIED);
        // SAFETY: both out pointers are valid.
        unsafe { (self.api.network_get_ipv4_subnet)(self.raw, &mut subnet, &mut mask) };
        Ipv4Subnet::from_netmask(
            Ipv4Addr::from(u32::from_be(subnet.s_addr)),
            Ipv4Addr::from(u32::from_be(mask.s_addr)),
        )
    }

    pub fn ipv6_prefix(&self) -> Result<Ipv6Prefix> {
        let mut prefix = in6_addr(Ipv6Addr::UNSPECIFIED);
        let mut len = 0u8;
        // SAFETY: both out pointers are valid.
        unsafe { (self.api.network_get_ipv6_prefix)(self.raw, &mut prefix, &mut len) };
        Ipv6Prefix::new(Ipv6Addr::from(prefix.s6_addr), len)
    }

    pub(super) fn api(&self) -> &'static NetworkApi {
        self.api
    }

    pub(super) fn as_raw(&self) -> NetworkRef {
        self.raw
    }
}

impl Drop for VmnetNetwork {
    fn drop(&mut self) {
        // SAFETY: the network is owned by self and released once.
        unsafe { CFRelease(self.raw) }
    }
}

impl std::fmt::Debug for VmnetNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmnetNetwork")
            .field("ipv4_subnet", &self.ipv4_subnet().ok())
            .field("ipv6_prefix", &self.ipv6_prefix().ok())
            .finish()
    }
}

/// Owned XPC object describing a [`VmnetNetwork`].
///
/// Send it to another process over XPC with [`NetworkSerialization::as_raw`]
/// and rebuild it there with [`NetworkSerialization::from_raw`].
#[derive(Debug)]
pub struct NetworkSerialization(XpcObject);

// SAFETY: XPC objects are reference counted and thread-safe.
unsafe impl Send for NetworkSerialization {}

impl NetworkSerialization {
    /// Take ownership of an XPC object, or `None` if it is null.
    ///
    /// # Safety
    ///
    /// `raw` must be a network serialization the caller owns one reference to.
    pub unsafe fn from_raw(raw: *mut c_void) -> Option<Self> {
        (!raw.is_null()).then_some(Self(raw))
    }

    pub fn as_raw(&self) -> *mut c_void {
        self.0
    }

    /// Give up ownership; the caller must release the object.
    pub fn into_raw(self) -> *mut c_void {
        let raw = self.0;
        std::mem::forget(self);
        raw
    }
}

impl Drop for NetworkSerialization {
    fn drop(&mut self) {
        // SAFETY: self owns one reference.
        unsafe { ffi::xpc_release(self.0) }
    }
}
