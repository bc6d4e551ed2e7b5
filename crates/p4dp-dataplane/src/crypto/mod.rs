//! Crypto Offload
//!
//! Per-packet encrypt/decrypt work routed around the forwarding loop.
//!
//! - [`backend`]: the transforms (ChaCha20-Poly1305, or a fake that only
//!   burns time)
//! - [`device`]: submission/completion rings serviced by a crypto node thread
//! - [`context`]: bounded pools holding suspended flows
//! - [`dispatcher`]: per-lcore policy choosing inline, suspended or ring
//!   execution

pub mod backend;
pub mod context;
pub mod device;
pub mod dispatcher;

pub use backend::{AeadBackend, FakeBackend};
pub use context::{ContextPool, OpTag};
pub use device::{CryptoDevice, CryptoNode};
pub use dispatcher::{AsyncCryptoDispatcher, CryptoOutcome, PacketCryptoState};

use std::time::Duration;

use p4dp_common::CryptoBackendKind;

use crate::buffer::Mbuf;

/// Transform direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncOpKind {
    /// Encrypt
    Encrypt,
    /// Decrypt
    Decrypt,
}

/// One unit of offloaded crypto work.
///
/// The op owns its packet while in flight, so the lcore and the crypto
/// engine can never touch the buffer at the same time.
#[derive(Debug)]
pub struct AsyncOp {
    /// Packet to transform
    pub packet: Mbuf,
    /// Start of the protected region within the packet data
    pub offset: usize,
    /// Direction
    pub kind: AsyncOpKind,
    /// Identity used to reassociate the completion with its flow
    pub tag: OpTag,
}

/// Finished op travelling back to its lcore
#[derive(Debug)]
pub struct CryptoCompletion {
    /// The op, packet included
    pub op: AsyncOp,
    /// Transform result
    pub status: Result<(), CryptoError>,
}

/// Crypto errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    /// Packet ends before the crypto region
    #[error("packet too short for offset {offset}")]
    TooShort {
        /// Requested start of the crypto region
        offset: usize,
    },
    /// Trailer does not fit behind the payload
    #[error("no tailroom for authentication trailer")]
    NoTailroom,
    /// Tag mismatch
    #[error("authentication failed")]
    AuthFailed,
}

/// A crypto engine executing ops synchronously
pub trait CryptoBackend: Send {
    /// Transform `op.packet` in place
    fn execute(&mut self, op: &mut AsyncOp) -> Result<(), CryptoError>;

    /// Engine name for logs
    fn name(&self) -> &'static str;
}

impl CryptoBackend for Box<dyn CryptoBackend> {
    fn execute(&mut self, op: &mut AsyncOp) -> Result<(), CryptoError> {
        (**self).execute(op)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Engine id of the crypto node; lcores use their lcore id
pub const CRYPTO_NODE_ENGINE_ID: u32 = u32::MAX;

/// Build the configured engine.
///
/// `engine_id` must differ between engines built from the same key.
pub fn make_backend(
    kind: CryptoBackendKind,
    key: [u8; 32],
    engine_id: u32,
    fake_delay: Duration,
) -> Box<dyn CryptoBackend> {
    match kind {
        CryptoBackendKind::Real => Box::new(AeadBackend::new(key, engine_id)),
        CryptoBackendKind::Fake => Box::new(FakeBackend::new(fake_delay)),
    }
}
