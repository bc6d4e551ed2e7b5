//! P4 Dataplane Common - Shared types for the per-core forwarding runtime
//!
//! This crate provides the pieces every dataplane component agrees on:
//! - Sizing constants for rings, pools and replica tables
//! - Hardware queue assignment records (port, queue, lcore)
//! - Async offload mode and crypto backend selection
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};

/// Ethernet port identifier
pub type PortId = u16;

/// Hardware queue identifier (RX or TX)
pub type QueueId = u16;

/// Logical core identifier
pub type LcoreId = u32;

/// NUMA socket identifier
pub type SocketId = usize;

/// Lookup table identifier
pub type TableId = usize;

/// Replicas kept per (table, socket)
pub const NB_REPLICA: usize = 2;

/// Maximum NUMA sockets
pub const NB_SOCKETS: usize = 8;

/// Maximum ethernet ports
pub const MAX_ETH_PORTS: usize = 32;

/// Maximum logical cores that may register as table readers
pub const MAX_LCORES: usize = 128;

/// Egress batch capacity per port
pub const MBUF_TABLE_SIZE: usize = 32;

/// Packets pulled per RX queue per burst
pub const MAX_PKT_BURST: usize = 32;

/// Packet buffers per lcore pool
pub const NB_MBUF: usize = 8192;

/// Maximum RX queues bound to one lcore
pub const MAX_RX_QUEUE_PER_LCORE: usize = 16;

/// Maximum RX queues per port
pub const MAX_RX_QUEUE_PER_PORT: usize = 128;

/// Maximum (port, queue, lcore) assignments
pub const MAX_LCORE_PARAMS: usize = 1024;

/// Default crypto submission/completion ring depth
pub const CRYPTO_RING_SIZE: usize = 32;

/// Default number of suspended-flow contexts per lcore
pub const CRYPTO_CONTEXT_POOL_SIZE: usize = 1;

/// Default in-flight async op records per lcore
pub const ASYNC_OP_POOL_SIZE: usize = 256;

/// Completions drained per poll when offload is synchronous
pub const CRYPTO_BURST_SIZE_SYNC: usize = 1;

/// Completions drained per poll when offload is asynchronous
pub const CRYPTO_BURST_SIZE_ASYNC: usize = 64;

/// Baseline delay unit of the fake crypto backend (nanoseconds)
pub const FAKE_CRYPTO_SLEEP_MULTIPLIER: u64 = 5000;

/// One static queue assignment: RX queue `queue_id` of `port_id` is polled by `lcore_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LcoreParams {
    /// Port
    pub port_id: PortId,
    /// RX queue on the port
    pub queue_id: QueueId,
    /// Polling lcore
    pub lcore_id: LcoreId,
}

impl LcoreParams {
    /// Create assignment triple
    pub const fn new(port_id: PortId, queue_id: QueueId, lcore_id: LcoreId) -> Self {
        Self { port_id, queue_id, lcore_id }
    }
}

/// RX queue bound to an lcore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RxQueue {
    /// Port
    pub port_id: PortId,
    /// Queue on the port
    pub queue_id: QueueId,
}

/// How per-packet crypto work is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AsyncMode {
    /// Crypto runs inline on the forwarding call stack
    #[default]
    Off,
    /// Flow suspends into a continuation while the transform runs
    Context,
    /// Ops are submitted to a device ring and completions polled later
    PollDevice,
    /// Crypto is bypassed entirely
    Skip,
}

impl AsyncMode {
    /// Whether packets are routed through the async machinery at all
    #[inline(always)]
    pub fn is_async(self) -> bool {
        matches!(self, Self::Context | Self::PollDevice)
    }

    /// Completions drained per poll in this mode
    #[inline(always)]
    pub fn crypto_burst_size(self) -> usize {
        if self.is_async() {
            CRYPTO_BURST_SIZE_ASYNC
        } else {
            CRYPTO_BURST_SIZE_SYNC
        }
    }
}

/// Which crypto engine services offloaded ops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoBackendKind {
    /// ChaCha20-Poly1305 AEAD transform
    Real,
    /// Fabricated result after a fixed delay
    #[default]
    Fake,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(NB_REPLICA, 2);
        assert_eq!(MBUF_TABLE_SIZE, 32);
        assert_eq!(CRYPTO_RING_SIZE, 32);
    }

    #[test]
    fn test_burst_size_per_mode() {
        assert_eq!(AsyncMode::Off.crypto_burst_size(), 1);
        assert_eq!(AsyncMode::Skip.crypto_burst_size(), 1);
        assert_eq!(AsyncMode::Context.crypto_burst_size(), 64);
        assert_eq!(AsyncMode::PollDevice.crypto_burst_size(), 64);
    }

    #[test]
    fn test_mode_serde_names() {
        let mode: AsyncMode = serde_json::from_str("\"poll_device\"").unwrap();
        assert_eq!(mode, AsyncMode::PollDevice);
    }
}
