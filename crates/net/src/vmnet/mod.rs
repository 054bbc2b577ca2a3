//! `vmnet.framework` binding.
//!
//! Starts a host interface on a private serial dispatch queue and exposes it
//! as a [`VirtualInterface`]. Hosts with the network configuration API start
//! on a [`VmnetNetwork`]; older hosts fall back to the dictionary start,
//! which cannot express every [`NetworkConfig`] setting. Completion handlers
//! are `block2` blocks; their results come back over a sync channel because
//! every call here is made from a thread that may block.

mod ffi;
mod network;

pub use network::{NetworkSerialization, VmnetNetwork};

use self::ffi::*;
use crate::callback::{self, CallbackHandle, vmnet_packets_available};
use crate::interface::{PacketsAvailableCallback, VirtualInterface};
use crate::pool::PacketPool;
use block2::RcBlock;
use std::ffi::{c_char, c_int};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, mpsc};
use std::time::Duration;
use tracing::{debug, info, warn};
use vmnet_core::{
    Error, InterfaceOptions, InterfaceParams, NetworkConfig, PortForwardRule, Result, Status,
};

const COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);
/// Batch limit assumed when the host does not report one.
const DEFAULT_MAX_PACKETS: usize = 256;

/// A started `vmnet` interface.
pub struct VmnetInterface {
    iface: InterfaceRef,
    queue: SerialQueue,
    params: InterfaceParams,
    callback: Mutex<Option<CallbackHandle>>,
    stopped: AtomicBool,
    /// Network created by [`VmnetInterface::start`], kept for the
    /// interface's lifetime.
    network: Option<VmnetNetwork>,
}

// SAFETY: the interface reference and queue are thread-safe framework
// objects; every call into vmnet takes them by value.
unsafe impl Send for VmnetInterface {}
// SAFETY: as above.
unsafe impl Sync for VmnetInterface {}

impl VmnetInterface {
    /// Start a host interface and wait for it to come up.
    ///
    /// Uses the network configuration API when the host has it. Otherwise
    /// the dictionary start is used, IPv4 port-forwarding rules are
    /// installed once the interface is running, and settings only the
    /// network configuration API can apply are rejected.
    pub fn start(options: &InterfaceOptions, config: &NetworkConfig) -> Result<Self> {
        config.validate()?;
        if VmnetNetwork::is_available() {
            let network = VmnetNetwork::new(config)?;
            let mut interface = Self::start_with_network(&network, options)?;
            interface.network = Some(network);
            return Ok(interface);
        }
        if let Some(what) = config.needs_network_api() {
            return Err(Error::ConfigurationInvalid(format!(
                "{what} needs the vmnet network configuration API, which this host lacks"
            )));
        }

        let mut desc = describe(options)?;
        configure_legacy(&mut desc, config)?;
        let interface = Self::launch(options, desc, |desc, queue, handler| {
            // SAFETY: desc and queue are live; the framework copies the handler.
            unsafe { vmnet_start_interface(desc, queue, handler) }
        })?;
        info!(mode = ?config.mode, "vmnet: interface started");
        for rule in &config.port_forwards {
            if let Err(e) = interface.add_port_forward(rule) {
                if let Err(stop) = interface.stop() {
                    warn!(error = %stop, "vmnet: failed to stop interface after port forward error");
                }
                return Err(e);
            }
        }
        Ok(interface)
    }

    /// Start an interface attached to an existing network, such as one
    /// rebuilt from another process's serialization.
    pub fn start_with_network(network: &VmnetNetwork, options: &InterfaceOptions) -> Result<Self> {
        let desc = describe(options)?;
        let start = network.api().interface_start_with_network;
        let interface = Self::launch(options, desc, |desc, queue, handler| {
            // SAFETY: the network, desc and queue are live; the framework
            // copies the handler.
            unsafe { start(network.as_raw(), desc, queue, handler) }
        })?;
        info!(subnet = ?network.ipv4_subnet().ok(), "vmnet: interface started on network");
        Ok(interface)
    }

    fn launch(
        options: &InterfaceOptions,
        desc: XpcDictionary,
        start: impl FnOnce(XpcObject, Queue, &StartHandler) -> InterfaceRef,
    ) -> Result<Self> {
        let queue = SerialQueue::new(c"vmnet-forwarder")?;

        let (tx, rx) = mpsc::sync_channel(1);
        let handler = RcBlock::new(move |status: u32, params: XpcObject| {
            let result = Status::from(status)
                .into_result("start")
                // SAFETY: on success the framework passes a valid parameter
                // dictionary that lives for the duration of the handler.
                .map(|()| unsafe { read_params(params) });
            let _ = tx.send(result);
        });

        let iface = start(desc.0, queue.0, &handler);
        if iface.is_null() {
            return Err(Error::InterfaceStartFailed(
                "vmnet start returned NULL".to_string(),
            ));
        }
        let params = match rx.recv_timeout(COMPLETION_TIMEOUT) {
            Ok(Ok(params)) => params.with_virtio_header(options.virtio_header),
            Ok(Err(e)) => return Err(Error::InterfaceStartFailed(e.to_string())),
            Err(e) => {
                return Err(Error::InterfaceStartFailed(format!(
                    "no start completion: {e}"
                )));
            }
        };
        debug!(
            mtu = params.mtu,
            max_read = params.max_read_packets,
            max_write = params.max_write_packets,
            virtio = params.virtio_header,
            "vmnet: interface parameters"
        );
        Ok(Self {
            iface,
            queue,
            params,
            callback: Mutex::new(None),
            stopped: AtomicBool::new(false),
            network: None,
        })
    }

    fn add_port_forward(&self, rule: &PortForwardRule) -> Result<()> {
        let IpAddr::V4(addr) = rule.internal_address else {
            return Err(Error::ConfigurationInvalid(
                "IPv6 port forwarding needs the vmnet network configuration API".to_string(),
            ));
        };
        let internal = libc::in_addr {
            s_addr: u32::from(addr).to_be(),
        };
        let (tx, rx) = mpsc::sync_channel(1);
        let handler = RcBlock::new(move |status: u32| {
            let _ = tx.send(status);
        });
        // SAFETY: self.iface is a started interface; the handler is copied.
        let status = unsafe {
            vmnet_interface_add_port_forwarding_rule(
                self.iface,
                rule.protocol.number(),
                rule.external_port,
                internal,
                rule.internal_port,
                &handler,
            )
        };
        Status::from(status).into_result("add port forwarding rule")?;
        wait_status(&rx, "add port forwarding rule")?;
        debug!(
            protocol = ?rule.protocol,
            external = rule.external_port,
            internal = %rule.internal_address,
            port = rule.internal_port,
            "vmnet: port forward installed"
        );
        Ok(())
    }
}

impl VirtualInterface for VmnetInterface {
    fn params(&self) -> InterfaceParams {
        self.params
    }

    fn read_packets(&self, pool: &mut PacketPool, max: usize) -> Result<usize> {
        let max = max.min(pool.capacity()).min(self.params.max_read_packets);
        let mut count = c_int::try_from(max).unwrap_or(c_int::MAX);
        let descs = pool.descriptors_for_read();
        // SAFETY: descs holds at least `count` descriptors whose iovecs point
        // at `max_payload` writable bytes each.
        let status = unsafe { vmnet_read(self.iface, descs, &mut count) };
        Status::from(status).into_result("read")?;
        let n = usize::try_from(count).unwrap_or(0).min(max);
        pool.sync_from_descriptors(n)?;
        Ok(n)
    }

    fn write_packets(&self, pool: &mut PacketPool, n: usize) -> Result<()> {
        let mut written = 0;
        while written < n {
            let batch = (n - written).min(self.params.max_write_packets);
            let mut count = c_int::try_from(batch).unwrap_or(c_int::MAX);
            // SAFETY: written + batch <= n <= capacity, and every descriptor's
            // size matches its iovec.
            let status = unsafe {
                vmnet_write(self.iface, pool.descriptors_mut().add(written), &mut count)
            };
            Status::from(status).into_result("write")?;
            let accepted = usize::try_from(count).unwrap_or(0);
            if accepted == 0 {
                return Err(Error::Interface {
                    op: "write",
                    status: Status::BufferExhausted,
                });
            }
            written += accepted;
        }
        Ok(())
    }

    fn set_packets_available_callback(&self, callback: PacketsAvailableCallback) {
        let handle = callback::register(callback);
        let id = handle.id();
        let block = RcBlock::new(move |_event: u32, event: XpcObject| {
            // SAFETY: the framework passes a valid event dictionary.
            let estimated =
                unsafe { xpc_dictionary_get_uint64(event, vmnet_estimated_packets_available_key) };
            vmnet_packets_available(id, estimated);
        });
        // SAFETY: the interface and queue are live; the block is copied.
        let status = unsafe {
            vmnet_interface_set_event_callback(self.iface, PACKETS_AVAILABLE, self.queue.0, Some(&block))
        };
        if let Err(e) = Status::from(status).into_result("set event callback") {
            warn!(error = %e, "vmnet: failed to install packets-available callback");
            return;
        }
        *self.callback.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // SAFETY: a null callback removes the event handler.
        unsafe {
            vmnet_interface_set_event_callback(
                self.iface,
                PACKETS_AVAILABLE,
                std::ptr::null_mut(),
                None,
            )
        };
        self.callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let (tx, rx) = mpsc::sync_channel(1);
        let handler = RcBlock::new(move |status: u32| {
            let _ = tx.send(status);
        });
        // SAFETY: the interface is started and stopped only once.
        let status = unsafe { vmnet_stop_interface(self.iface, self.queue.0, &handler) };
        Status::from(status).into_result("stop")?;
        wait_status(&rx, "stop")?;
        debug!("vmnet: interface stopped");
        Ok(())
    }
}

impl Drop for VmnetInterface {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "vmnet: failed to stop interface on drop");
        }
    }
}

impl std::fmt::Debug for VmnetInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmnetInterface")
            .field("params", &self.params)
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

fn wait_status(rx: &mpsc::Receiver<u32>, op: &'static str) -> Result<()> {
    match rx.recv_timeout(COMPLETION_TIMEOUT) {
        Ok(status) => Status::from(status).into_result(op),
        Err(e) => Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{op}: no completion: {e}"),
        ))),
    }
}

/// Interface description shared by both start paths.
fn describe(options: &InterfaceOptions) -> Result<XpcDictionary> {
    let mut desc = XpcDictionary::new()?;
    // SAFETY: the key statics are initialised by the framework loader.
    unsafe {
        desc.set_bool(vmnet_allocate_mac_address_key, options.allocate_mac_address);
        desc.set_bool(vmnet_enable_checksum_offload_key, options.checksum_offload);
        desc.set_bool(vmnet_enable_isolation_key, options.isolation);
        desc.set_bool(vmnet_enable_tso_key, options.tso);
    }
    if options.virtio_header {
        let key = virtio_header_key().ok_or_else(|| {
            Error::ConfigurationInvalid(
                "virtio headers are not supported by this host's vmnet".to_string(),
            )
        })?;
        desc.set_bool(key, true);
    }
    Ok(desc)
}

/// Network settings the dictionary start carries itself.
fn configure_legacy(desc: &mut XpcDictionary, config: &NetworkConfig) -> Result<()> {
    // SAFETY: the key statics are initialised by the framework loader.
    unsafe {
        desc.set_u64(vmnet_operation_mode_key, config.mode.raw());
        if let Some(mtu) = config.mtu {
            desc.set_u64(vmnet_mtu_key, u64::from(mtu));
        }
        if let Some(subnet) = &config.ipv4_subnet {
            desc.set_str(vmnet_start_address_key, &subnet.gateway().to_string())?;
            desc.set_str(vmnet_end_address_key, &subnet.last_assignable().to_string())?;
            desc.set_str(vmnet_subnet_mask_key, &subnet.netmask().to_string())?;
        }
        if let Some(prefix) = &config.ipv6_prefix {
            desc.set_str(vmnet_nat66_prefix_key, &prefix.addr().to_string())?;
        }
    }
    Ok(())
}

/// # Safety
///
/// `params` must be a valid XPC dictionary.
unsafe fn read_params(params: XpcObject) -> InterfaceParams {
    // SAFETY: per the caller; missing keys read as zero.
    let get = |key: *const c_char| unsafe { xpc_dictionary_get_uint64(params, key) as usize };
    // SAFETY: the key statics are initialised by the framework loader.
    let (mtu, max_packet, read, write) = unsafe {
        (
            get(vmnet_mtu_key),
            get(vmnet_max_packet_size_key),
            get(vmnet_read_max_packets_key),
            get(vmnet_write_max_packets_key),
        )
    };
    let or_default = |n: usize| if n == 0 { DEFAULT_MAX_PACKETS } else { n };
    InterfaceParams::new(mtu.max(max_packet), or_default(read), or_default(write))
}
