//! Per-lcore crypto dispatch
//!
//! Decides, packet by packet, whether the transform runs inline, inside a
//! suspended flow (`Context`) or on the poll-device rings (`PollDevice`).
//! Resource exhaustion never blocks: the packet is dropped and
//! `async_drop` counted.

use p4dp_common::{AsyncMode, DataplaneError, DataplaneResult, LcoreId, Resource};

use super::context::{ContextPool, OpTag};
use super::device::CryptoDevice;
use super::{AsyncOp, AsyncOpKind, CryptoBackend, CryptoCompletion};
use crate::buffer::Mbuf;
use crate::counters::{Occurrence, OccurrenceCounters};
use crate::program::{Resume, Verdict};

/// Tag carried by ops executed inline
const INLINE_TAG_SLOT: u32 = u32::MAX;

/// Crypto state of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketCryptoState {
    /// Transformed inline, no offload
    Sync,
    /// Enqueued, awaiting completion
    Submitted,
    /// Offloaded transform finished
    Completed,
    /// Rejected for lack of async resources
    Dropped,
}

/// Result of handing a packet to the dispatcher
#[derive(Debug)]
pub enum CryptoOutcome {
    /// Ran inline; the packet continues with `Verdict`
    Sync(Mbuf, Verdict),
    /// Suspended flow resumed after its transform
    Completed(Mbuf, Verdict),
    /// On the device ring; the verdict arrives through polling
    Submitted(OpTag),
    /// Dropped because `Resource` was exhausted; the packet was released
    Dropped(Resource),
}

impl CryptoOutcome {
    /// State the packet ended up in
    pub fn state(&self) -> PacketCryptoState {
        match self {
            Self::Sync(..) => PacketCryptoState::Sync,
            Self::Completed(..) => PacketCryptoState::Completed,
            Self::Submitted(_) => PacketCryptoState::Submitted,
            Self::Dropped(_) => PacketCryptoState::Dropped,
        }
    }
}

/// Crypto strategy of one lcore, fixed at startup
pub struct AsyncCryptoDispatcher {
    lcore_id: LcoreId,
    mode: AsyncMode,
    every_n: u32,
    sample: u32,
    backend: Box<dyn CryptoBackend>,
    device: Option<CryptoDevice>,
    contexts: ContextPool<Resume>,
    pending: ContextPool<Resume>,
    burst_size: usize,
    completions: Vec<CryptoCompletion>,
}

impl AsyncCryptoDispatcher {
    /// Create dispatcher running inline work on `backend`.
    ///
    /// Pool sizes default to `CRYPTO_CONTEXT_POOL_SIZE` and
    /// `ASYNC_OP_POOL_SIZE`; every packet is offloaded in async modes.
    pub fn new(lcore_id: LcoreId, mode: AsyncMode, backend: Box<dyn CryptoBackend>) -> Self {
        let burst_size = mode.crypto_burst_size();
        Self {
            lcore_id,
            mode,
            every_n: 1,
            sample: 0,
            backend,
            device: None,
            contexts: ContextPool::new(lcore_id, p4dp_common::CRYPTO_CONTEXT_POOL_SIZE),
            pending: ContextPool::new(lcore_id, p4dp_common::ASYNC_OP_POOL_SIZE),
            burst_size,
            completions: Vec::with_capacity(burst_size),
        }
    }

    /// Attach the rings used in `PollDevice` mode
    pub fn with_device(mut self, device: CryptoDevice) -> Self {
        self.device = Some(device);
        self
    }

    /// Offload only every `n`th crypto packet (debug sampling)
    pub fn with_sampling(mut self, n: u32) -> Self {
        self.every_n = n.max(1);
        self
    }

    /// Resize the suspended-flow and pending-op pools
    pub fn with_pools(mut self, contexts: usize, pending: usize) -> Self {
        self.contexts = ContextPool::new(self.lcore_id, contexts);
        self.pending = ContextPool::new(self.lcore_id, pending);
        self
    }

    /// Configured mode
    pub fn mode(&self) -> AsyncMode {
        self.mode
    }

    /// Completions drained per poll
    pub fn burst_size(&self) -> usize {
        self.burst_size
    }

    /// Ops on the device awaiting completion
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Device rings, when attached
    pub fn device(&self) -> Option<&CryptoDevice> {
        self.device.as_ref()
    }

    /// Reject a mode/device mismatch.
    ///
    /// `PollDevice` needs attached rings and no other mode may carry them.
    pub fn check_bindings(&self) -> DataplaneResult<()> {
        match (self.mode, self.device.is_some()) {
            (AsyncMode::PollDevice, false) => Err(DataplaneError::Config(format!(
                "lcore {}: poll_device mode without crypto rings",
                self.lcore_id
            ))),
            (mode, true) if mode != AsyncMode::PollDevice => Err(DataplaneError::Config(format!(
                "lcore {}: crypto rings attached in {:?} mode",
                self.lcore_id, mode
            ))),
            _ => Ok(()),
        }
    }

    /// Whether the next crypto packet takes the async path.
    ///
    /// Advances the sampling counter; call once per crypto packet.
    #[inline]
    pub fn requires_async(&mut self) -> bool {
        if !self.mode.is_async() {
            return false;
        }
        if self.every_n <= 1 {
            return true;
        }
        self.sample = (self.sample + 1) % self.every_n;
        self.sample == 0
    }

    /// Transform `packet` from `offset` on and continue with `resume`.
    pub fn submit(
        &mut self,
        packet: Mbuf,
        offset: usize,
        kind: AsyncOpKind,
        resume: Resume,
        counters: &OccurrenceCounters,
    ) -> CryptoOutcome {
        if self.mode == AsyncMode::Skip {
            let mut packet = packet;
            let verdict = resume(&mut packet);
            return CryptoOutcome::Sync(packet, verdict);
        }

        if !self.requires_async() {
            return self.run_inline(packet, offset, kind, resume);
        }

        counters.record(Occurrence::SentToCrypto);
        if self.mode == AsyncMode::PollDevice {
            self.submit_to_device(packet, offset, kind, resume, counters)
        } else {
            self.run_suspended(packet, offset, kind, resume, counters)
        }
    }

    fn reject(&self, resource: Resource, counters: &OccurrenceCounters) -> CryptoOutcome {
        counters.record(Occurrence::AsyncDrop);
        let error = DataplaneError::ResourceExhausted(resource);
        tracing::trace!(lcore = self.lcore_id, %error, "async drop");
        CryptoOutcome::Dropped(resource)
    }

    fn run_inline(&mut self, packet: Mbuf, offset: usize, kind: AsyncOpKind, resume: Resume) -> CryptoOutcome {
        let mut op = AsyncOp {
            packet,
            offset,
            kind,
            tag: OpTag {
                lcore: self.lcore_id,
                slot: INLINE_TAG_SLOT,
                generation: 0,
            },
        };
        let verdict = match self.backend.execute(&mut op) {
            Ok(()) => resume(&mut op.packet),
            Err(e) => {
                tracing::trace!(lcore = self.lcore_id, error = %e, "inline crypto failed");
                Verdict::Drop
            }
        };
        CryptoOutcome::Sync(op.packet, verdict)
    }

    fn run_suspended(
        &mut self,
        packet: Mbuf,
        offset: usize,
        kind: AsyncOpKind,
        resume: Resume,
        counters: &OccurrenceCounters,
    ) -> CryptoOutcome {
        let Ok(tag) = self.contexts.insert(resume) else {
            return self.reject(Resource::ContextPool, counters);
        };
        counters.record(Occurrence::DoingCrypto);

        let mut op = AsyncOp {
            packet,
            offset,
            kind,
            tag,
        };
        let status = self.backend.execute(&mut op);
        counters.record(Occurrence::AsyncPacket);

        let Some(resume) = self.contexts.remove(tag) else {
            return CryptoOutcome::Completed(op.packet, Verdict::Drop);
        };
        let verdict = match status {
            Ok(()) => resume(&mut op.packet),
            Err(e) => {
                tracing::trace!(lcore = self.lcore_id, error = %e, "crypto failed");
                Verdict::Drop
            }
        };
        CryptoOutcome::Completed(op.packet, verdict)
    }

    fn submit_to_device(
        &mut self,
        packet: Mbuf,
        offset: usize,
        kind: AsyncOpKind,
        resume: Resume,
        counters: &OccurrenceCounters,
    ) -> CryptoOutcome {
        if self.device.is_none() {
            return self.reject(Resource::CryptoRing, counters);
        }
        let Ok(tag) = self.pending.insert(resume) else {
            return self.reject(Resource::AsyncOpPool, counters);
        };

        let op = AsyncOp {
            packet,
            offset,
            kind,
            tag,
        };
        let submitted = self.device.as_ref().map(|device| device.submit(op));
        if let Some(Err(rejected)) = submitted {
            self.pending.remove(tag);
            drop(rejected);
            return self.reject(Resource::CryptoRing, counters);
        }
        counters.record(Occurrence::DoingCrypto);
        CryptoOutcome::Submitted(tag)
    }

    /// Collect up to one crypto burst of finished ops, resuming their flows.
    ///
    /// Each packet lands in `out` with its verdict. Completions whose tag no
    /// longer matches a pending flow are dropped.
    pub fn poll_completions(&mut self, counters: &OccurrenceCounters, out: &mut Vec<(Mbuf, Verdict)>) -> usize {
        let Some(device) = self.device.as_ref() else {
            return 0;
        };
        self.completions.clear();
        let n = device.poll(self.burst_size, &mut self.completions);

        for completion in self.completions.drain(..) {
            let CryptoCompletion { mut op, status } = completion;
            counters.record(Occurrence::AsyncPacket);

            let Some(resume) = self.pending.remove(op.tag) else {
                tracing::warn!(lcore = self.lcore_id, tag = ?op.tag, "dropping stale crypto completion");
                counters.record(Occurrence::AsyncDrop);
                out.push((op.packet, Verdict::Drop));
                continue;
            };
            let verdict = match status {
                Ok(()) => resume(&mut op.packet),
                Err(e) => {
                    tracing::trace!(lcore = self.lcore_id, error = %e, "offloaded crypto failed");
                    Verdict::Drop
                }
            };
            out.push((op.packet, verdict));
        }
        n
    }
}

impl std::fmt::Debug for AsyncCryptoDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncCryptoDispatcher")
            .field("lcore_id", &self.lcore_id)
            .field("mode", &self.mode)
            .field("every_n", &self.every_n)
            .field("engine", &self.backend.name())
            .field("device", &self.device)
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MbufPool;
    use crate::crypto::{AeadBackend, FakeBackend};
    use p4dp_common::{CRYPTO_BURST_SIZE_ASYNC, CRYPTO_RING_SIZE};
    use std::time::Duration;

    fn fake() -> Box<dyn CryptoBackend> {
        Box::new(FakeBackend::new(Duration::ZERO))
    }

    fn forward_to(port: u16) -> Resume {
        Box::new(move |_: &mut Mbuf| Verdict::Forward(port))
    }

    fn packet(pool: &MbufPool, n: u8) -> Mbuf {
        pool.alloc_with(0, &[n; 8]).unwrap()
    }

    #[test]
    fn test_off_mode_runs_inline() {
        let pool = MbufPool::new(4);
        let counters = OccurrenceCounters::new();
        let mut dispatcher = AsyncCryptoDispatcher::new(0, AsyncMode::Off, Box::new(AeadBackend::new([9; 32], 0)));

        let outcome = dispatcher.submit(packet(&pool, 1), 2, AsyncOpKind::Encrypt, forward_to(3), &counters);
        assert_eq!(outcome.state(), PacketCryptoState::Sync);
        let CryptoOutcome::Sync(pkt, verdict) = outcome else { unreachable!() };
        assert_eq!(verdict, Verdict::Forward(3));
        assert!(pkt.len() > 8);

        let s = counters.snapshot();
        assert_eq!(s.sent_to_crypto, 0);
        assert_eq!(s.doing_crypto, 0);
    }

    #[test]
    fn test_skip_mode_leaves_packet_untouched() {
        let pool = MbufPool::new(4);
        let counters = OccurrenceCounters::new();
        let mut dispatcher = AsyncCryptoDispatcher::new(0, AsyncMode::Skip, Box::new(AeadBackend::new([9; 32], 0)));

        let CryptoOutcome::Sync(pkt, verdict) =
            dispatcher.submit(packet(&pool, 7), 0, AsyncOpKind::Encrypt, forward_to(1), &counters)
        else {
            panic!("skip must be sync");
        };
        assert_eq!(pkt.data(), &[7; 8]);
        assert_eq!(verdict, Verdict::Forward(1));
        assert!(!dispatcher.requires_async());
    }

    #[test]
    fn test_context_mode_resumes_flow() {
        let pool = MbufPool::new(4);
        let counters = OccurrenceCounters::new();
        let mut dispatcher = AsyncCryptoDispatcher::new(2, AsyncMode::Context, fake());

        let resume: Resume = Box::new(|pkt: &mut Mbuf| {
            pkt.data_mut()[0] = 0xEE;
            Verdict::Forward(4)
        });
        let outcome = dispatcher.submit(packet(&pool, 1), 0, AsyncOpKind::Decrypt, resume, &counters);
        let CryptoOutcome::Completed(pkt, verdict) = outcome else {
            panic!("context mode completes in place");
        };
        assert_eq!(pkt.data()[0], 0xEE);
        assert_eq!(verdict, Verdict::Forward(4));

        let s = counters.snapshot();
        assert_eq!((s.sent_to_crypto, s.doing_crypto, s.async_packet), (1, 1, 1));
        assert_eq!(s.in_flight(), 0);
    }

    #[test]
    fn test_context_pool_exhaustion_drops() {
        let pool = MbufPool::new(4);
        let counters = OccurrenceCounters::new();
        let mut dispatcher = AsyncCryptoDispatcher::new(0, AsyncMode::Context, fake()).with_pools(0, 0);

        let outcome = dispatcher.submit(packet(&pool, 1), 0, AsyncOpKind::Encrypt, forward_to(0), &counters);
        assert_eq!(outcome.state(), PacketCryptoState::Dropped);
        assert!(matches!(outcome, CryptoOutcome::Dropped(Resource::ContextPool)));
        assert_eq!(counters.get(Occurrence::AsyncDrop), 1);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_mode_device_mismatch() {
        let pool = MbufPool::new(4);
        let counters = OccurrenceCounters::new();

        let mut unbound = AsyncCryptoDispatcher::new(1, AsyncMode::PollDevice, fake());
        assert!(matches!(unbound.check_bindings(), Err(DataplaneError::Config(_))));
        let outcome = unbound.submit(packet(&pool, 1), 0, AsyncOpKind::Encrypt, forward_to(0), &counters);
        assert!(matches!(outcome, CryptoOutcome::Dropped(Resource::CryptoRing)));
        assert_eq!(counters.get(Occurrence::AsyncDrop), 1);
        assert_eq!(counters.get(Occurrence::DoingCrypto), 0);
        assert_eq!(pool.available(), 4);

        let stray = AsyncCryptoDispatcher::new(1, AsyncMode::Context, fake()).with_device(CryptoDevice::new(4));
        assert!(stray.check_bindings().is_err());

        let bound = AsyncCryptoDispatcher::new(1, AsyncMode::PollDevice, fake()).with_device(CryptoDevice::new(4));
        assert!(bound.check_bindings().is_ok());
        assert!(AsyncCryptoDispatcher::new(1, AsyncMode::Off, fake()).check_bindings().is_ok());
    }

    #[test]
    fn test_poll_device_backpressure() {
        let pool = MbufPool::new(128);
        let counters = OccurrenceCounters::new();
        let device = CryptoDevice::new(CRYPTO_RING_SIZE);
        let mut dispatcher = AsyncCryptoDispatcher::new(0, AsyncMode::PollDevice, fake()).with_device(device.clone());

        let mut accepted = 0;
        let mut rejected = 0;
        for i in 0..64u8 {
            match dispatcher.submit(packet(&pool, i), 0, AsyncOpKind::Encrypt, forward_to(0), &counters) {
                CryptoOutcome::Submitted(_) => accepted += 1,
                CryptoOutcome::Dropped(resource) => {
                    assert_eq!(resource, Resource::CryptoRing);
                    rejected += 1
                }
                other => panic!("unexpected outcome {:?}", other.state()),
            }
        }

        assert_eq!((accepted, rejected), (32, 32));
        let s = counters.snapshot();
        assert_eq!(s.async_drop, 32);
        assert_eq!(s.sent_to_crypto, 64);
        assert_eq!(s.doing_crypto, 32);
        assert_eq!(dispatcher.pending(), 32);
        assert_eq!(device.submitted(), 32);
        // rejected packets went back to the pool
        assert_eq!(pool.available(), 128 - 32);
    }

    #[test]
    fn test_completions_reassociate_with_their_flow() {
        let pool = MbufPool::new(16);
        let counters = OccurrenceCounters::new();
        let device = CryptoDevice::new(8);
        let mut dispatcher = AsyncCryptoDispatcher::new(0, AsyncMode::PollDevice, fake()).with_device(device.clone());

        for i in 0..5u8 {
            let outcome = dispatcher.submit(packet(&pool, i), 0, AsyncOpKind::Encrypt, forward_to(i as u16), &counters);
            assert_eq!(outcome.state(), PacketCryptoState::Submitted);
        }
        let mut engine = FakeBackend::new(Duration::ZERO);
        assert_eq!(device.service(&mut engine, 8), 5);

        let mut out = Vec::new();
        assert_eq!(dispatcher.poll_completions(&counters, &mut out), 5);
        for (pkt, verdict) in &out {
            assert_eq!(*verdict, Verdict::Forward(pkt.data()[0] as u16));
        }
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(counters.get(Occurrence::AsyncPacket), 5);
    }

    #[test]
    fn test_poll_bounded_by_crypto_burst() {
        let pool = MbufPool::new(128);
        let counters = OccurrenceCounters::new();
        let device = CryptoDevice::new(128);
        let mut dispatcher = AsyncCryptoDispatcher::new(0, AsyncMode::PollDevice, fake()).with_device(device.clone());

        for i in 0..100u8 {
            dispatcher.submit(packet(&pool, i), 0, AsyncOpKind::Encrypt, forward_to(0), &counters);
        }
        let mut engine = FakeBackend::new(Duration::ZERO);
        assert_eq!(device.service(&mut engine, 128), 100);

        let mut out = Vec::new();
        assert_eq!(dispatcher.poll_completions(&counters, &mut out), CRYPTO_BURST_SIZE_ASYNC);
        assert_eq!(dispatcher.poll_completions(&counters, &mut out), 100 - CRYPTO_BURST_SIZE_ASYNC);
        assert_eq!(out.len(), 100);
    }

    #[test]
    fn test_failed_transform_drops_without_resuming() {
        let pool = MbufPool::new(4);
        let counters = OccurrenceCounters::new();
        let device = CryptoDevice::new(4);
        let mut dispatcher = AsyncCryptoDispatcher::new(0, AsyncMode::PollDevice, fake()).with_device(device.clone());

        let resume: Resume = Box::new(|_: &mut Mbuf| -> Verdict { panic!("must not resume") });
        dispatcher.submit(packet(&pool, 1), 0, AsyncOpKind::Decrypt, resume, &counters);

        let mut engine = AeadBackend::new([1; 32], 0);
        device.service(&mut engine, 4);

        let mut out = Vec::new();
        dispatcher.poll_completions(&counters, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].1, Verdict::Drop);
    }

    #[test]
    fn test_stale_completion_dropped() {
        let pool = MbufPool::new(4);
        let counters = OccurrenceCounters::new();
        let device = CryptoDevice::new(4);
        let mut dispatcher = AsyncCryptoDispatcher::new(0, AsyncMode::PollDevice, fake()).with_device(device.clone());

        let stray = AsyncOp {
            packet: packet(&pool, 1),
            offset: 0,
            kind: AsyncOpKind::Encrypt,
            tag: OpTag {
                lcore: 0,
                slot: 3,
                generation: 9,
            },
        };
        device.submit(stray).unwrap();
        device.service(&mut FakeBackend::new(Duration::ZERO), 4);

        let mut out = Vec::new();
        assert_eq!(dispatcher.poll_completions(&counters, &mut out), 1);
        assert_eq!(out[0].1, Verdict::Drop);
        assert_eq!(counters.get(Occurrence::AsyncDrop), 1);
    }

    #[test]
    fn test_sampling_every_nth() {
        let mut dispatcher = AsyncCryptoDispatcher::new(0, AsyncMode::Context, fake()).with_sampling(4);
        let picked = (0..8).filter(|_| dispatcher.requires_async()).count();
        assert_eq!(picked, 2);
    }

    #[test]
    fn test_unsampled_packets_run_inline() {
        let pool = MbufPool::new(8);
        let counters = OccurrenceCounters::new();
        let device = CryptoDevice::new(8);
        let mut dispatcher = AsyncCryptoDispatcher::new(0, AsyncMode::PollDevice, fake())
            .with_device(device)
            .with_sampling(2);

        let states: Vec<_> = (0..4u8)
            .map(|i| {
                dispatcher
                    .submit(packet(&pool, i), 0, AsyncOpKind::Encrypt, forward_to(0), &counters)
                    .state()
            })
            .collect();
        assert_eq!(
            states,
            [
                PacketCryptoState::Sync,
                PacketCryptoState::Submitted,
                PacketCryptoState::Sync,
                PacketCryptoState::Submitted
            ]
        );
        assert_eq!(counters.get(Occurrence::SentToCrypto), 2);
    }
}
