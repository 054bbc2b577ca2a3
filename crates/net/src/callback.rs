//! Process-wide registry routing host callbacks to Rust closures.
//!
//! Foreign code only ever holds an integer handle. The C entry point
//! [`vmnet_packets_available`] looks the handle up and runs the closure, so
//! nothing on the foreign side points at Rust memory.

use crate::interface::PacketsAvailableCallback;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tracing::trace;

type Entry = Arc<dyn Fn(usize) + Send + Sync>;

static CALLBACKS: OnceLock<Mutex<HashMap<u64, Entry>>> = OnceLock::new();
static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn callbacks() -> &'static Mutex<HashMap<u64, Entry>> {
    CALLBACKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registration of one callback. Dropping it unregisters the callback;
/// a dispatch already in flight finishes first.
#[derive(Debug)]
pub struct CallbackHandle {
    id: u64,
}

impl CallbackHandle {
    /// Opaque value to pass through foreign code.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        let removed = callbacks()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        if removed.is_some() {
            trace!(handle = self.id, "callback: unregistered");
        }
    }
}

/// Register `callback` and return its handle.
pub fn register(callback: PacketsAvailableCallback) -> CallbackHandle {
    let id = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    callbacks()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(id, Arc::from(callback));
    trace!(handle = id, "callback: registered");
    CallbackHandle { id }
}

/// Run the callback registered under `handle`, if any.
///
/// Returns whether a callback was found. The registry lock is not held
/// while the callback runs.
pub fn dispatch(handle: u64, estimated: usize) -> bool {
    let entry = callbacks()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&handle)
        .cloned();
    match entry {
        Some(callback) => {
            callback(estimated);
            true
        }
        None => false,
    }
}

/// C entry point for host event callbacks.
///
/// Unknown handles are ignored; a panic in the callback is contained here
/// instead of unwinding into foreign frames.
#[unsafe(no_mangle)]
pub extern "C" fn vmnet_packets_available(handle: u64, estimated: u64) {
    let estimated = usize::try_from(estimated).unwrap_or(usize::MAX);
    let _ = std::panic::catch_unwind(|| dispatch(handle, estimated));
}
