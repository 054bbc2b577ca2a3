//! Packet descriptor pool.
//!
//! A fixed set of MTU-sized buffers carved out of one allocation, each
//! preceded by `header_size` bytes reserved for a stream length prefix.
//! Every buffer is described three ways, all pointing into the same memory:
//!
//! - a `vmpktdesc` for the host interface,
//! - a read iovec starting at the payload (scatter reads, interface reads),
//! - a write iovec covering header plus payload (gather writes).
//!
//! None of the allocations ever move or grow, so the raw pointers handed to
//! the kernel and to batch message headers stay valid for the pool's life.

use std::ptr::NonNull;
use vmnet_core::{Error, Result};

/// Length prefix used by stream framing.
pub const STREAM_HEADER_SIZE: usize = 4;

/// `struct vmpktdesc` from `<vmnet/vmnet.h>`.
#[repr(C)]
#[derive(Debug)]
pub struct PacketDesc {
    pub vm_pkt_size: libc::size_t,
    pub vm_pkt_iov: *mut libc::iovec,
    pub vm_pkt_iovcnt: u32,
    pub vm_flags: u32,
}

/// Heap slice that is never reallocated and is freed on drop.
struct FixedSlice<T> {
    ptr: NonNull<T>,
    len: usize,
}

impl<T> FixedSlice<T> {
    fn new(items: Vec<T>) -> Self {
        let boxed = items.into_boxed_slice();
        let len = boxed.len();
        let ptr = NonNull::from(Box::leak(boxed)).cast::<T>();
        Self { ptr, len }
    }

    fn as_ptr(&self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// Pointer to element `i`; `i` must be in bounds.
    fn at(&self, i: usize) -> *mut T {
        debug_assert!(i < self.len);
        // SAFETY: callers stay within the allocation.
        unsafe { self.ptr.as_ptr().add(i) }
    }
}

impl<T> Drop for FixedSlice<T> {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from Box::leak in `new` and are freed exactly once.
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

/// Fixed-capacity pool of pinned packet buffers.
pub struct PacketPool {
    buffer: FixedSlice<u8>,
    read_iovs: FixedSlice<libc::iovec>,
    write_iovs: FixedSlice<libc::iovec>,
    descs: FixedSlice<PacketDesc>,
    capacity: usize,
    max_payload: usize,
    header_size: usize,
}

// SAFETY: all raw pointers point into allocations owned by the pool, which
// is only ever accessed through `&mut self` or `&self` from one thread at a
// time.
unsafe impl Send for PacketPool {}

impl PacketPool {
    /// Allocate `capacity` buffers of `header_size + max_payload` bytes.
    pub fn new(capacity: usize, max_payload: usize, header_size: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ConfigurationInvalid(
                "packet pool capacity must be non-zero".to_string(),
            ));
        }
        if max_payload == 0 {
            return Err(Error::ConfigurationInvalid(
                "packet pool payload size must be non-zero".to_string(),
            ));
        }
        let stride = header_size + max_payload;
        let total = stride.checked_mul(capacity).ok_or_else(|| {
            Error::ConfigurationInvalid(format!(
                "packet pool of {capacity} x {stride} bytes is too large"
            ))
        })?;

        let buffer = FixedSlice::new(vec![0u8; total]);
        let empty = libc::iovec {
            iov_base: std::ptr::null_mut(),
            iov_len: 0,
        };
        let read_iovs = FixedSlice::new(vec![empty; capacity]);
        let write_iovs = FixedSlice::new(vec![empty; capacity]);
        let descs = FixedSlice::new(
            (0..capacity)
                .map(|_| PacketDesc {
                    vm_pkt_size: 0,
                    vm_pkt_iov: std::ptr::null_mut(),
                    vm_pkt_iovcnt: 1,
                    vm_flags: 0,
                })
                .collect(),
        );

        for i in 0..capacity {
            // SAFETY: i < capacity, so every offset stays inside `buffer`.
            let start = unsafe { buffer.as_ptr().add(i * stride) };
            // SAFETY: the header fits inside the stride.
            let payload = unsafe { start.add(header_size) };
            // SAFETY: i < capacity for all three arrays.
            unsafe {
                *read_iovs.at(i) = libc::iovec {
                    iov_base: payload as *mut libc::c_void,
                    iov_len: max_payload,
                };
                *write_iovs.at(i) = libc::iovec {
                    iov_base: start as *mut libc::c_void,
                    iov_len: 0,
                };
                (*descs.at(i)).vm_pkt_iov = read_iovs.at(i);
            }
        }

        Ok(Self {
            buffer,
            read_iovs,
            write_iovs,
            descs,
            capacity,
            max_payload,
            header_size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    fn stride(&self) -> usize {
        self.header_size + self.max_payload
    }

    fn check(&self, i: usize) {
        assert!(
            i < self.capacity,
            "packet index {i} out of range for pool of {}",
            self.capacity
        );
    }

    /// Restore every slot to an empty packet with a full-size read iovec.
    pub fn reset(&mut self) {
        for i in 0..self.capacity {
            // SAFETY: i < capacity.
            unsafe {
                (*self.read_iovs.at(i)).iov_len = self.max_payload;
                let desc = &mut *self.descs.at(i);
                desc.vm_pkt_size = 0;
                desc.vm_flags = 0;
            }
        }
    }

    /// Descriptor view for slot `i`, or `None` past the capacity.
    pub fn at(&self, i: usize) -> Option<Packet<'_>> {
        (i < self.capacity).then(|| Packet {
            index: i,
            payload: self.payload(i),
        })
    }

    /// Slots `0..n` in index order.
    pub fn iter(&self, n: usize) -> impl Iterator<Item = Packet<'_>> + '_ {
        (0..n.min(self.capacity)).filter_map(move |i| self.at(i))
    }

    /// Current length of packet `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is not below [`capacity`](Self::capacity).
    pub fn packet_len(&self, i: usize) -> usize {
        self.check(i);
        // SAFETY: bounds checked above.
        unsafe { (*self.descs.at(i)).vm_pkt_size }
    }

    /// Payload of packet `i`, `packet_len(i)` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `i` is not below [`capacity`](Self::capacity).
    pub fn payload(&self, i: usize) -> &[u8] {
        let len = self.packet_len(i).min(self.max_payload);
        // SAFETY: the read iovec base points at `max_payload` bytes owned by
        // the pool and `len` never exceeds that.
        unsafe { std::slice::from_raw_parts(self.payload_ptr(i), len) }
    }

    /// Whole payload area of slot `i`, for producers that fill it directly.
    ///
    /// # Panics
    ///
    /// Panics if `i` is not below [`capacity`](Self::capacity).
    pub fn buffer_mut(&mut self, i: usize) -> &mut [u8] {
        self.check(i);
        // SAFETY: exclusive borrow of the pool; the area is `max_payload` bytes.
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(i), self.max_payload) }
    }

    /// Record the length of packet `i` after its bytes were produced.
    ///
    /// # Panics
    ///
    /// Panics if `i` is not below [`capacity`](Self::capacity).
    pub fn set_len(&mut self, i: usize, len: usize) -> Result<()> {
        self.check(i);
        if len > self.max_payload {
            return Err(Error::PacketTooLarge {
                len,
                max: self.max_payload,
            });
        }
        // SAFETY: bounds checked above.
        unsafe {
            (*self.descs.at(i)).vm_pkt_size = len;
            (*self.read_iovs.at(i)).iov_len = len;
        }
        Ok(())
    }

    /// Fill a slot from a byte slice.
    ///
    /// # Panics
    ///
    /// Panics if `i` is not below [`capacity`](Self::capacity).
    pub fn fill(&mut self, i: usize, data: &[u8]) -> Result<()> {
        if data.len() > self.max_payload {
            return Err(Error::PacketTooLarge {
                len: data.len(),
                max: self.max_payload,
            });
        }
        self.buffer_mut(i)[..data.len()].copy_from_slice(data);
        self.set_len(i, data.len())
    }

    /// Base address of slot `i`'s read iovec. Never changes.
    ///
    /// # Panics
    ///
    /// Panics if `i` is not below [`capacity`](Self::capacity).
    pub fn iov_base(&self, i: usize) -> *const u8 {
        self.payload_ptr(i)
    }

    fn payload_ptr(&self, i: usize) -> *mut u8 {
        self.check(i);
        // SAFETY: bounds checked above.
        unsafe { (*self.read_iovs.at(i)).iov_base as *mut u8 }
    }

    fn slot_ptr(&self, i: usize) -> *mut u8 {
        self.check(i);
        // SAFETY: i < capacity keeps the offset inside the buffer.
        unsafe { self.buffer.as_ptr().add(i * self.stride()) }
    }

    /// Build the gather list for the first `n` packets.
    ///
    /// With a stream header each entry is `BE32(len) || payload`; without one
    /// it is the bare payload. Fails if any length exceeds `max_payload`.
    pub fn prepare_write_view(&mut self, n: usize) -> Result<&mut [libc::iovec]> {
        let n = n.min(self.capacity);
        for i in 0..n {
            let len = self.packet_len(i);
            if len > self.max_payload {
                return Err(Error::PacketTooLarge {
                    len,
                    max: self.max_payload,
                });
            }
            let slot = self.slot_ptr(i);
            if self.header_size >= STREAM_HEADER_SIZE {
                let header = (len as u32).to_be_bytes();
                // SAFETY: the header area is `header_size` bytes at the slot start.
                unsafe {
                    std::ptr::copy_nonoverlapping(header.as_ptr(), slot, STREAM_HEADER_SIZE)
                };
            }
            let (base, iov_len) = if self.header_size >= STREAM_HEADER_SIZE {
                (slot, STREAM_HEADER_SIZE + len)
            } else {
                // SAFETY: header_size < stride.
                (unsafe { slot.add(self.header_size) }, len)
            };
            // SAFETY: i < capacity.
            unsafe {
                *self.write_iovs.at(i) = libc::iovec {
                    iov_base: base as *mut libc::c_void,
                    iov_len,
                };
            }
        }
        // SAFETY: `n` initialised iovecs; the borrow ties them to `self`.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.write_iovs.as_ptr(), n) })
    }

    /// Header bytes reserved in front of slot `i`.
    pub(crate) fn header_mut(&mut self, i: usize) -> &mut [u8] {
        let slot = self.slot_ptr(i);
        // SAFETY: exclusive borrow; the header area is `header_size` bytes.
        unsafe { std::slice::from_raw_parts_mut(slot, self.header_size) }
    }

    /// Raw iovec covering `[offset..len)` of packet `i`'s payload.
    pub(crate) fn payload_iov(&self, i: usize, offset: usize, len: usize) -> libc::iovec {
        debug_assert!(offset <= len && len <= self.max_payload);
        libc::iovec {
            // SAFETY: offset <= max_payload keeps the pointer in the slot.
            iov_base: unsafe { self.payload_ptr(i).add(offset) } as *mut libc::c_void,
            iov_len: len - offset,
        }
    }

    /// Raw iovec covering `[offset..header_size)` of slot `i`'s header.
    pub(crate) fn header_iov(&self, i: usize, offset: usize) -> libc::iovec {
        debug_assert!(offset <= self.header_size);
        libc::iovec {
            // SAFETY: offset <= header_size keeps the pointer in the slot.
            iov_base: unsafe { self.slot_ptr(i).add(offset) } as *mut libc::c_void,
            iov_len: self.header_size - offset,
        }
    }

    /// Stable pointer to slot `i`'s read iovec, for batch message headers.
    pub(crate) fn read_iov_ptr(&self, i: usize) -> *mut libc::iovec {
        self.check(i);
        self.read_iovs.at(i)
    }

    /// Stable pointer to slot `i`'s write iovec, for batch message headers.
    pub(crate) fn write_iov_ptr(&self, i: usize) -> *mut libc::iovec {
        self.check(i);
        self.write_iovs.at(i)
    }

    /// The `vmpktdesc` array, `capacity()` entries long, as filled in.
    pub fn descriptors_mut(&mut self) -> *mut PacketDesc {
        self.descs.as_ptr()
    }

    /// The `vmpktdesc` array with every slot advertising its full capacity,
    /// ready for the interface to read into.
    ///
    /// Sizes written back by the interface must not exceed `max_payload`.
    pub fn descriptors_for_read(&mut self) -> *mut PacketDesc {
        for i in 0..self.capacity {
            // SAFETY: i < capacity.
            unsafe {
                (*self.read_iovs.at(i)).iov_len = self.max_payload;
                (*self.descs.at(i)).vm_pkt_size = self.max_payload;
            }
        }
        self.descs.as_ptr()
    }

    /// Make the descriptors' sizes and iovec lengths agree for the first
    /// `n` packets, after the interface wrote sizes into the descriptors.
    pub fn sync_from_descriptors(&mut self, n: usize) -> Result<()> {
        for i in 0..n.min(self.capacity) {
            let len = self.packet_len(i);
            self.set_len(i, len)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketPool")
            .field("capacity", &self.capacity)
            .field("max_payload", &self.max_payload)
            .field("header_size", &self.header_size)
            .finish()
    }
}

/// Borrowed view of one pool slot.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    index: usize,
    payload: &'a [u8],
}

impl<'a> Packet<'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
