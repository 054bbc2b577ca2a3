//! Raw `vmnet.framework`, XPC and dispatch declarations.
//!
//! The dictionary-based start API is linked directly. The network
//! configuration API only exists on newer hosts, so it is resolved at run
//! time and is `None` where the framework lacks it.

use block2::Block;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::sync::OnceLock;
use vmnet_core::{Error, Result};

use crate::pool::PacketDesc;

pub(super) type XpcObject = *mut c_void;
pub(super) type InterfaceRef = *mut c_void;
pub(super) type NetworkConfigurationRef = *mut c_void;
pub(super) type NetworkRef = *mut c_void;
pub(super) type Queue = dispatch::ffi::dispatch_queue_t;

pub(super) type StartHandler = Block<dyn Fn(u32, XpcObject)>;
pub(super) type StatusHandler = Block<dyn Fn(u32)>;

pub(super) const PACKETS_AVAILABLE: u32 = 1 << 0;

#[link(name = "vmnet", kind = "framework")]
unsafe extern "C" {
    pub(super) static vmnet_operation_mode_key: *const c_char;
    pub(super) static vmnet_start_address_key: *const c_char;
    pub(super) static vmnet_end_address_key: *const c_char;
    pub(super) static vmnet_subnet_mask_key: *const c_char;
    pub(super) static vmnet_nat66_prefix_key: *const c_char;
    pub(super) static vmnet_mtu_key: *const c_char;
    pub(super) static vmnet_max_packet_size_key: *const c_char;
    pub(super) static vmnet_read_max_packets_key: *const c_char;
    pub(super) static vmnet_write_max_packets_key: *const c_char;
    pub(super) static vmnet_allocate_mac_address_key: *const c_char;
    pub(super) static vmnet_enable_checksum_offload_key: *const c_char;
    pub(super) static vmnet_enable_isolation_key: *const c_char;
    pub(super) static vmnet_enable_tso_key: *const c_char;
    pub(super) static vmnet_estimated_packets_available_key: *const c_char;

    pub(super) fn vmnet_start_interface(
        desc: XpcObject,
        queue: Queue,
        handler: &StartHandler,
    ) -> InterfaceRef;
    pub(super) fn vmnet_interface_set_event_callback(
        iface: InterfaceRef,
        mask: u32,
        queue: Queue,
        callback: Option<&StartHandler>,
    ) -> u32;
    pub(super) fn vmnet_read(iface: InterfaceRef, packets: *mut PacketDesc, count: *mut c_int)
    -> u32;
    pub(super) fn vmnet_write(
        iface: InterfaceRef,
        packets: *mut PacketDesc,
        count: *mut c_int,
    ) -> u32;
    pub(super) fn vmnet_stop_interface(
        iface: InterfaceRef,
        queue: Queue,
        handler: &StatusHandler,
    ) -> u32;
    pub(super) fn vmnet_interface_add_port_forwarding_rule(
        iface: InterfaceRef,
        protocol: u8,
        external_port: u16,
        internal_address: libc::in_addr,
        internal_port: u16,
        handler: &StatusHandler,
    ) -> u32;
}

unsafe extern "C" {
    fn xpc_dictionary_create(
        keys: *const *const c_char,
        values: *const XpcObject,
        count: usize,
    ) -> XpcObject;
    fn xpc_dictionary_set_uint64(dict: XpcObject, key: *const c_char, value: u64);
    fn xpc_dictionary_set_bool(dict: XpcObject, key: *const c_char, value: bool);
    fn xpc_dictionary_set_string(dict: XpcObject, key: *const c_char, value: *const c_char);
    pub(super) fn xpc_dictionary_get_uint64(dict: XpcObject, key: *const c_char) -> u64;
    pub(super) fn xpc_release(object: XpcObject);
}

#[link(name = "CoreFoundation", kind = "framework")]
unsafe extern "C" {
    pub(super) fn CFRelease(object: *const c_void);
}

/// Entry points of the network configuration API.
pub(super) struct NetworkApi {
    pub configuration_create: unsafe extern "C" fn(u32, *mut u32) -> NetworkConfigurationRef,
    pub add_dhcp_reservation:
        unsafe extern "C" fn(NetworkConfigurationRef, *const [u8; 6], *const libc::in_addr) -> u32,
    pub add_port_forwarding_rule: unsafe extern "C" fn(
        NetworkConfigurationRef,
        u8,
        libc::sa_family_t,
        u16,
        u16,
        *const c_void,
    ) -> u32,
    pub disable_dhcp: unsafe extern "C" fn(NetworkConfigurationRef),
    pub disable_dns_proxy: unsafe extern "C" fn(NetworkConfigurationRef),
    pub disable_nat44: unsafe extern "C" fn(NetworkConfigurationRef),
    pub disable_nat66: unsafe extern "C" fn(NetworkConfigurationRef),
    pub disable_router_advertisement: unsafe extern "C" fn(NetworkConfigurationRef),
    pub set_external_interface: unsafe extern "C" fn(NetworkConfigurationRef, *const c_char) -> u32,
    pub set_ipv4_subnet: unsafe extern "C" fn(
        NetworkConfigurationRef,
        *const libc::in_addr,
        *const libc::in_addr,
    ) -> u32,
    pub set_ipv6_prefix:
        unsafe extern "C" fn(NetworkConfigurationRef, *const libc::in6_addr, u8) -> u32,
    pub set_mtu: unsafe extern "C" fn(NetworkConfigurationRef, u32) -> u32,
    pub network_create: unsafe extern "C" fn(NetworkConfigurationRef, *mut u32) -> NetworkRef,
    pub network_create_with_serialization: unsafe extern "C" fn(XpcObject, *mut u32) -> NetworkRef,
    pub network_copy_serialization: unsafe extern "C" fn(NetworkRef, *mut u32) -> XpcObject,
    pub network_get_ipv4_subnet:
        unsafe extern "C" fn(NetworkRef, *mut libc::in_addr, *mut libc::in_addr),
    pub network_get_ipv6_prefix: unsafe extern "C" fn(NetworkRef, *mut libc::in6_addr, *mut u8),
    pub interface_start_with_network:
        unsafe extern "C" fn(NetworkRef, XpcObject, Queue, *const StartHandler) -> InterfaceRef,
}

impl NetworkApi {
    /// # Safety
    ///
    /// Every symbol found must have the signature declared for its field.
    unsafe fn load() -> Option<Self> {
        // SAFETY: the field types match the framework's declarations.
        unsafe {
            Some(Self {
                configuration_create: symbol(c"vmnet_network_configuration_create")?,
                add_dhcp_reservation: symbol(c"vmnet_network_configuration_add_dhcp_reservation")?,
                add_port_forwarding_rule: symbol(
                    c"vmnet_network_configuration_add_port_forwarding_rule",
                )?,
                disable_dhcp: symbol(c"vmnet_network_configuration_disable_dhcp")?,
                disable_dns_proxy: symbol(c"vmnet_network_configuration_disable_dns_proxy")?,
                disable_nat44: symbol(c"vmnet_network_configuration_disable_nat44")?,
                disable_nat66: symbol(c"vmnet_network_configuration_disable_nat66")?,
                disable_router_advertisement: symbol(
                    c"vmnet_network_configuration_disable_router_advertisement",
                )?,
                set_external_interface: symbol(
                    c"vmnet_network_configuration_set_external_interface",
                )?,
                set_ipv4_subnet: symbol(c"vmnet_network_configuration_set_ipv4_subnet")?,
                set_ipv6_prefix: symbol(c"vmnet_network_configuration_set_ipv6_prefix")?,
                set_mtu: symbol(c"vmnet_network_configuration_set_mtu")?,
                network_create: symbol(c"vmnet_network_create")?,
                network_create_with_serialization: symbol(
                    c"vmnet_network_create_with_serialization",
                )?,
                network_copy_serialization: symbol(c"vmnet_network_copy_serialization")?,
                network_get_ipv4_subnet: symbol(c"vmnet_network_get_ipv4_subnet")?,
                network_get_ipv6_prefix: symbol(c"vmnet_network_get_ipv6_prefix")?,
                interface_start_with_network: symbol(c"vmnet_interface_start_with_network")?,
            })
        }
    }
}

/// The network configuration API, if this host's framework has it.
pub(super) fn network_api() -> Option<&'static NetworkApi> {
    static API: OnceLock<Option<NetworkApi>> = OnceLock::new();
    // SAFETY: `load` declares the framework's signatures.
    API.get_or_init(|| unsafe { NetworkApi::load() }).as_ref()
}

/// `vmnet_enable_virtio_header_key`, absent on older hosts.
pub(super) fn virtio_header_key() -> Option<*const c_char> {
    // SAFETY: the symbol is a `const char *const` variable.
    let slot: *const *const c_char = unsafe { symbol(c"vmnet_enable_virtio_header_key")? };
    // SAFETY: the variable is initialised by the framework loader.
    let key = unsafe { *slot };
    (!key.is_null()).then_some(key)
}

/// # Safety
///
/// `T` must be a pointer-sized type matching what `name` refers to.
unsafe fn symbol<T: Copy>(name: &CStr) -> Option<T> {
    // SAFETY: dlsym only reads the NUL-terminated name.
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if ptr.is_null() {
        return None;
    }
    // SAFETY: per the caller, `T` is a pointer of the same size.
    Some(unsafe { std::mem::transmute_copy::<*mut c_void, T>(&ptr) })
}

/// Owned XPC dictionary.
pub(super) struct XpcDictionary(pub(super) XpcObject);

impl XpcDictionary {
    pub(super) fn new() -> Result<Self> {
        // SAFETY: an empty dictionary needs no keys or values.
        let dict = unsafe { xpc_dictionary_create(std::ptr::null(), std::ptr::null(), 0) };
        if dict.is_null() {
            return Err(Error::InterfaceStartFailed(
                "xpc_dictionary_create returned NULL".to_string(),
            ));
        }
        Ok(Self(dict))
    }

    pub(super) fn set_u64(&mut self, key: *const c_char, value: u64) {
        // SAFETY: self.0 is a live dictionary and key a framework constant.
        unsafe { xpc_dictionary_set_uint64(self.0, key, value) }
    }

    pub(super) fn set_bool(&mut self, key: *const c_char, value: bool) {
        // SAFETY: as for `set_u64`.
        unsafe { xpc_dictionary_set_bool(self.0, key, value) }
    }

    pub(super) fn set_str(&mut self, key: *const c_char, value: &str) -> Result<()> {
        let value = c_string(value)?;
        // SAFETY: the dictionary copies the string.
        unsafe { xpc_dictionary_set_string(self.0, key, value.as_ptr()) };
        Ok(())
    }
}

impl Drop for XpcDictionary {
    fn drop(&mut self) {
        // SAFETY: created by xpc_dictionary_create and released once.
        unsafe { xpc_release(self.0) }
    }
}

pub(super) fn c_string(value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| Error::ConfigurationInvalid(format!("{value:?} contains NUL")))
}

/// Serial dispatch queue the framework delivers events on.
pub(super) struct SerialQueue(pub(super) Queue);

impl SerialQueue {
    pub(super) fn new(label: &CStr) -> Result<Self> {
        // SAFETY: label is NUL-terminated; the serial attribute is a null constant.
        let queue = unsafe {
            dispatch::ffi::dispatch_queue_create(label.as_ptr(), dispatch::ffi::DISPATCH_QUEUE_SERIAL)
        };
        if queue.is_null() {
            return Err(Error::InterfaceStartFailed(
                "dispatch_queue_create returned NULL".to_string(),
            ));
        }
        Ok(Self(queue))
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        // SAFETY: created by dispatch_queue_create and released once.
        unsafe { dispatch::ffi::dispatch_release(self.0) }
    }
}
