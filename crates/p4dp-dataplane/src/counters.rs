//! Occurrence Counters
//!
//! Per-lcore diagnostic counters. Only the owning lcore writes them; a
//! diagnostics reader on another thread may snapshot them at any time.

use std::sync::atomic::{AtomicU64, Ordering};

use p4dp_common::LcoreId;
use serde::Serialize;

/// Counter selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrence {
    /// Packet dropped for lack of async resources
    AsyncDrop,
    /// Packet handed to egress
    FwdPacket,
    /// Op submitted for crypto
    SentToCrypto,
    /// Crypto transform started
    DoingCrypto,
    /// Async op completed
    AsyncPacket,
    /// Packet left the forwarding path
    ProcessedPacket,
}

/// Per-lcore counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct OccurrenceCounters {
    async_drop: AtomicU64,
    fwd_packet: AtomicU64,
    sent_to_crypto: AtomicU64,
    doing_crypto: AtomicU64,
    async_packet: AtomicU64,
    processed_packet: AtomicU64,
}

impl OccurrenceCounters {
    /// Create zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, which: Occurrence) -> &AtomicU64 {
        match which {
            Occurrence::AsyncDrop => &self.async_drop,
            Occurrence::FwdPacket => &self.fwd_packet,
            Occurrence::SentToCrypto => &self.sent_to_crypto,
            Occurrence::DoingCrypto => &self.doing_crypto,
            Occurrence::AsyncPacket => &self.async_packet,
            Occurrence::ProcessedPacket => &self.processed_packet,
        }
    }

    /// Record one event. Must only be called by the owning lcore.
    #[inline(always)]
    pub fn record(&self, which: Occurrence) {
        self.record_n(which, 1);
    }

    /// Record `n` events. Must only be called by the owning lcore.
    #[inline(always)]
    pub fn record_n(&self, which: Occurrence, n: u64) {
        let cell = self.cell(which);
        // Single writer: a plain load/store pair cannot lose updates.
        cell.store(cell.load(Ordering::Relaxed).wrapping_add(n), Ordering::Relaxed);
    }

    /// Current value of one counter
    #[inline]
    pub fn get(&self, which: Occurrence) -> u64 {
        self.cell(which).load(Ordering::Relaxed)
    }

    /// Read all counters
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            async_drop: self.async_drop.load(Ordering::Relaxed),
            fwd_packet: self.fwd_packet.load(Ordering::Relaxed),
            sent_to_crypto: self.sent_to_crypto.load(Ordering::Relaxed),
            doing_crypto: self.doing_crypto.load(Ordering::Relaxed),
            async_packet: self.async_packet.load(Ordering::Relaxed),
            processed_packet: self.processed_packet.load(Ordering::Relaxed),
        }
    }

    /// Export to the `metrics` facade, labelled by lcore
    pub fn publish(&self, lcore: LcoreId) {
        let s = self.snapshot();
        let lcore = lcore.to_string();
        metrics::counter!("p4dp_async_drop", "lcore" => lcore.clone()).absolute(s.async_drop);
        metrics::counter!("p4dp_fwd_packet", "lcore" => lcore.clone()).absolute(s.fwd_packet);
        metrics::counter!("p4dp_sent_to_crypto", "lcore" => lcore.clone())
            .absolute(s.sent_to_crypto);
        metrics::counter!("p4dp_doing_crypto", "lcore" => lcore.clone()).absolute(s.doing_crypto);
        metrics::counter!("p4dp_async_packet", "lcore" => lcore.clone()).absolute(s.async_packet);
        metrics::counter!("p4dp_processed_packet", "lcore" => lcore)
            .absolute(s.processed_packet);
    }

    /// Emit a one-line summary
    pub fn log_summary(&self, lcore: LcoreId) {
        let s = self.snapshot();
        tracing::info!(
            lcore,
            async_drop = s.async_drop,
            fwd_packet = s.fwd_packet,
            sent_to_crypto = s.sent_to_crypto,
            doing_crypto = s.doing_crypto,
            async_packet = s.async_packet,
            processed_packet = s.processed_packet,
            "occurrence counters"
        );
    }
}

/// Counter snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Packets dropped on async backpressure or stale completion
    pub async_drop: u64,
    /// Packets accepted by an egress buffer
    pub fwd_packet: u64,
    /// Packets routed to the async path
    pub sent_to_crypto: u64,
    /// Ops accepted by a ring or context
    pub doing_crypto: u64,
    /// Ops completed
    pub async_packet: u64,
    /// Packets that left the pipeline, drops included
    pub processed_packet: u64,
}

impl CounterSnapshot {
    /// Field-wise sum
    pub fn merge(&mut self, other: &CounterSnapshot) {
        self.async_drop += other.async_drop;
        self.fwd_packet += other.fwd_packet;
        self.sent_to_crypto += other.sent_to_crypto;
        self.doing_crypto += other.doing_crypto;
        self.async_packet += other.async_packet;
        self.processed_packet += other.processed_packet;
    }

    /// True when no field decreased relative to `earlier`
    pub fn dominates(&self, earlier: &CounterSnapshot) -> bool {
        self.async_drop >= earlier.async_drop
            && self.fwd_packet >= earlier.fwd_packet
            && self.sent_to_crypto >= earlier.sent_to_crypto
            && self.doing_crypto >= earlier.doing_crypto
            && self.async_packet >= earlier.async_packet
            && self.processed_packet >= earlier.processed_packet
    }

    /// Ops accepted by the async path and not yet completed
    pub fn in_flight(&self) -> u64 {
        self.doing_crypto.saturating_sub(self.async_packet)
    }
}

/// Sum snapshots of several lcores
pub fn aggregate<'a>(counters: impl IntoIterator<Item = &'a OccurrenceCounters>) -> CounterSnapshot {
    let mut total = CounterSnapshot::default();
    for c in counters {
        total.merge(&c.snapshot());
    }
    total
}
