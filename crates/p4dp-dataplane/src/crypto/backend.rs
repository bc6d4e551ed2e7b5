//! Crypto engines
//!
//! [`AeadBackend`] seals the packet region after `offset` with
//! ChaCha20-Poly1305, authenticating the bytes before `offset` as
//! associated data. The nonce and tag travel in a trailer:
//!
//! ```text
//! | header (aad) | ciphertext | nonce (12) | tag (16) |
//! ^0             ^offset
//! ```
//!
//! Every engine sharing a key must carry a distinct engine id: the id fills
//! the first four nonce bytes, a counter seeded at random fills the rest.
//!
//! [`FakeBackend`] leaves the packet alone and only spends a fixed delay,
//! for measuring the offload path without the cost of the transform.

use std::time::{Duration, Instant};

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, Tag};

use super::{AsyncOp, AsyncOpKind, CryptoBackend, CryptoError};

/// Nonce size
pub const NONCE_LEN: usize = 12;

/// Authentication tag size
pub const TAG_LEN: usize = 16;

/// Bytes appended by encryption
pub const AEAD_TRAILER_LEN: usize = NONCE_LEN + TAG_LEN;

/// ChaCha20-Poly1305 engine
pub struct AeadBackend {
    cipher: ChaCha20Poly1305,
    nonce_counter: u64,
    engine_id: u32,
}

impl AeadBackend {
    /// Create engine `engine_id` for `key`
    pub fn new(key: [u8; 32], engine_id: u32) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            nonce_counter: rand::random(),
            engine_id,
        }
    }

    /// Engine id carried in every nonce
    pub fn engine_id(&self) -> u32 {
        self.engine_id
    }

    /// Next nonce (unique per engine instance)
    #[inline]
    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let counter = self.nonce_counter;
        self.nonce_counter = self.nonce_counter.wrapping_add(1);
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&self.engine_id.to_be_bytes());
        nonce[4..].copy_from_slice(&counter.to_le_bytes());
        nonce
    }

    fn encrypt(&mut self, op: &mut AsyncOp) -> Result<(), CryptoError> {
        let offset = op.offset;
        if offset > op.packet.len() {
            return Err(CryptoError::TooShort { offset });
        }
        if op.packet.tailroom() < AEAD_TRAILER_LEN {
            return Err(CryptoError::NoTailroom);
        }

        let nonce = self.next_nonce();
        let (aad, region) = op.packet.data_mut().split_at_mut(offset);
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, region)
            .map_err(|_| CryptoError::AuthFailed)?;

        let mut trailer = [0u8; AEAD_TRAILER_LEN];
        trailer[..NONCE_LEN].copy_from_slice(&nonce);
        trailer[NONCE_LEN..].copy_from_slice(tag.as_slice());
        if !op.packet.extend_from_slice(&trailer) {
            return Err(CryptoError::NoTailroom);
        }
        Ok(())
    }

    fn decrypt(&mut self, op: &mut AsyncOp) -> Result<(), CryptoError> {
        let offset = op.offset;
        let len = op.packet.len();
        if offset.checked_add(AEAD_TRAILER_LEN).map_or(true, |need| len < need) {
            return Err(CryptoError::TooShort { offset });
        }

        let mut trailer = [0u8; AEAD_TRAILER_LEN];
        trailer.copy_from_slice(&op.packet.data()[len - AEAD_TRAILER_LEN..]);
        op.packet.trim(AEAD_TRAILER_LEN as u16);

        let (aad, region) = op.packet.data_mut().split_at_mut(offset);
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&trailer[..NONCE_LEN]),
                aad,
                region,
                Tag::from_slice(&trailer[NONCE_LEN..]),
            )
            .map_err(|_| CryptoError::AuthFailed)
    }
}

impl CryptoBackend for AeadBackend {
    fn execute(&mut self, op: &mut AsyncOp) -> Result<(), CryptoError> {
        match op.kind {
            AsyncOpKind::Encrypt => self.encrypt(op),
            AsyncOpKind::Decrypt => self.decrypt(op),
        }
    }

    fn name(&self) -> &'static str {
        "chacha20poly1305"
    }
}

/// Engine that fabricates success after a delay
#[derive(Debug, Clone)]
pub struct FakeBackend {
    delay: Duration,
}

impl FakeBackend {
    /// Create engine spending `delay` per op
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl CryptoBackend for FakeBackend {
    fn execute(&mut self, _op: &mut AsyncOp) -> Result<(), CryptoError> {
        if self.delay.is_zero() {
            return Ok(());
        }
        // Busy-wait like a polled accelerator; sleeping would hand the core away.
        let until = Instant::now() + self.delay;
        while Instant::now() < until {
            std::hint::spin_loop();
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}
