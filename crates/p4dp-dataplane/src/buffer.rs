//! Packet Buffer Pool
//!
//! Pre-allocated packet buffers owned by one lcore.
//!
//! # Design
//!
//! - Fixed capacity, no allocation after startup
//! - An [`Mbuf`] owns its buffer while in use; dropping it hands the buffer
//!   back to the pool it came from, so TX drivers and the crypto node can
//!   release packets without touching the lcore
//! - Headroom reserved for encapsulation, as on the NIC side

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use p4dp_common::PortId;

/// Data room per buffer
pub const BUFFER_SIZE: usize = 2048;

/// Headroom reserved in front of the packet data
pub const DEFAULT_HEADROOM: u16 = 128;

/// Largest frame a freshly allocated buffer can hold
pub const MAX_FRAME_LEN: usize = BUFFER_SIZE - DEFAULT_HEADROOM as usize;

/// Packet buffer
#[repr(C, align(64))]
pub struct PacketBuffer {
    /// Buffer index in pool
    index: u32,
    /// Data length
    data_len: u16,
    /// Headroom offset
    headroom: u16,
    /// Ingress port
    in_port: PortId,
    /// Packet data
    data: [u8; BUFFER_SIZE],
}

impl PacketBuffer {
    fn new(index: u32) -> Self {
        Self {
            index,
            data_len: 0,
            headroom: DEFAULT_HEADROOM,
            in_port: 0,
            data: [0; BUFFER_SIZE],
        }
    }

    /// Get packet data slice
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        let start = self.headroom as usize;
        &self.data[start..start + self.data_len as usize]
    }

    /// Get mutable packet data
    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let start = self.headroom as usize;
        &mut self.data[start..start + self.data_len as usize]
    }

    /// Get data length
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data_len as usize
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data_len == 0
    }

    /// Get headroom
    #[inline(always)]
    pub fn headroom(&self) -> usize {
        self.headroom as usize
    }

    /// Get tailroom
    #[inline(always)]
    pub fn tailroom(&self) -> usize {
        BUFFER_SIZE - self.headroom as usize - self.data_len as usize
    }

    /// Ingress port
    #[inline(always)]
    pub fn in_port(&self) -> PortId {
        self.in_port
    }

    /// Set ingress port
    #[inline(always)]
    pub fn set_in_port(&mut self, port: PortId) {
        self.in_port = port;
    }

    /// Get index in pool
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Prepend data (adjust headroom)
    #[inline]
    pub fn prepend(&mut self, len: u16) -> Option<&mut [u8]> {
        if self.headroom < len {
            return None;
        }
        self.headroom -= len;
        self.data_len += len;
        let start = self.headroom as usize;
        Some(&mut self.data[start..start + len as usize])
    }

    /// Append data (use tailroom)
    #[inline]
    pub fn append(&mut self, len: u16) -> Option<&mut [u8]> {
        if self.tailroom() < len as usize {
            return None;
        }
        let start = self.headroom as usize + self.data_len as usize;
        self.data_len += len;
        Some(&mut self.data[start..start + len as usize])
    }

    /// Append a copy of `bytes`; false when tailroom is short
    #[inline]
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> bool {
        let Ok(len) = u16::try_from(bytes.len()) else {
            return false;
        };
        match self.append(len) {
            Some(room) => {
                room.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Pull data (remove from head)
    #[inline]
    pub fn pull(&mut self, len: u16) -> Option<&[u8]> {
        if self.data_len < len {
            return None;
        }
        let start = self.headroom as usize;
        self.headroom += len;
        self.data_len -= len;
        Some(&self.data[start..start + len as usize])
    }

    /// Trim data (remove from tail)
    #[inline]
    pub fn trim(&mut self, len: u16) -> bool {
        if self.data_len < len {
            return false;
        }
        self.data_len -= len;
        true
    }

    /// Reset buffer
    #[inline]
    pub fn reset(&mut self) {
        self.data_len = 0;
        self.headroom = DEFAULT_HEADROOM;
        self.in_port = 0;
    }
}

struct PoolShared {
    free: ArrayQueue<Box<PacketBuffer>>,
    size: usize,
    allocated: AtomicUsize,
}

impl PoolShared {
    fn release(&self, mut buf: Box<PacketBuffer>) {
        buf.reset();
        // Only buffers minted by this pool come back, so the queue never overflows.
        if self.free.push(buf).is_ok() {
            self.allocated.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Packet buffer pool (pre-allocated)
///
/// Cloning yields another handle on the same pool.
#[derive(Clone)]
pub struct MbufPool {
    shared: Arc<PoolShared>,
}

impl MbufPool {
    /// Create new buffer pool
    pub fn new(size: usize) -> Self {
        let free = ArrayQueue::new(size.max(1));
        for i in 0..size {
            let _ = free.push(Box::new(PacketBuffer::new(i as u32)));
        }

        Self {
            shared: Arc::new(PoolShared {
                free,
                size,
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocate buffer from pool
    #[inline]
    pub fn alloc(&self) -> Option<Mbuf> {
        let buf = self.shared.free.pop()?;
        self.shared.allocated.fetch_add(1, Ordering::Relaxed);
        Some(Mbuf {
            buf: ManuallyDrop::new(buf),
            pool: Arc::clone(&self.shared),
        })
    }

    /// Allocate a buffer holding a copy of `bytes`
    pub fn alloc_with(&self, in_port: PortId, bytes: &[u8]) -> Option<Mbuf> {
        let mut mbuf = self.alloc()?;
        if !mbuf.extend_from_slice(bytes) {
            return None;
        }
        mbuf.set_in_port(in_port);
        Some(mbuf)
    }

    /// Get available count
    pub fn available(&self) -> usize {
        self.shared.free.len()
    }

    /// Get allocated count
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// Get pool size
    pub fn size(&self) -> usize {
        self.shared.size
    }
}

impl std::fmt::Debug for MbufPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MbufPool")
            .field("size", &self.size())
            .field("available", &self.available())
            .finish()
    }
}

/// Owned packet buffer; returns to its pool on drop
pub struct Mbuf {
    buf: ManuallyDrop<Box<PacketBuffer>>,
    pool: Arc<PoolShared>,
}

impl Deref for Mbuf {
    type Target = PacketBuffer;

    #[inline(always)]
    fn deref(&self) -> &PacketBuffer {
        &self.buf
    }
}

impl DerefMut for Mbuf {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut PacketBuffer {
        &mut self.buf
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        // SAFETY: `buf` is never touched again after being taken here.
        let buf = unsafe { ManuallyDrop::take(&mut self.buf) };
        self.pool.release(buf);
    }
}

impl std::fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbuf")
            .field("index", &self.index())
            .field("len", &self.len())
            .field("in_port", &self.in_port())
            .finish()
    }
}
