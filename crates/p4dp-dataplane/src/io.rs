//! Packet I/O driver seam
//!
//! The poll-mode driver is an external collaborator. Lcores talk to it only
//! through [`PacketIo`]; [`MemoryIo`] is an in-process driver used by tests,
//! benchmarks and dry runs.

use std::collections::{HashMap, VecDeque};

use p4dp_common::{PortId, QueueId};

use crate::buffer::{Mbuf, MbufPool, MAX_FRAME_LEN};

/// RX dequeue / TX enqueue primitives of a poll-mode driver
pub trait PacketIo {
    /// Dequeue up to `max` packets from (`port`, `queue`) into `out`,
    /// allocating buffers from `pool`. Returns the number dequeued.
    fn rx_burst(
        &mut self,
        port: PortId,
        queue: QueueId,
        pool: &MbufPool,
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> usize;

    /// Enqueue `pkts` on TX queue `queue` of `port`.
    ///
    /// The driver removes the packets it accepts from the front of `pkts`
    /// and returns how many it took. Anything left is released by the caller.
    fn tx_burst(&mut self, port: PortId, queue: QueueId, pkts: &mut Vec<Mbuf>) -> usize;
}

/// In-memory driver: RX frames are injected, TX frames are captured
#[derive(Debug, Default)]
pub struct MemoryIo {
    rx: HashMap<(PortId, QueueId), VecDeque<Vec<u8>>>,
    tx: HashMap<PortId, Vec<Vec<u8>>>,
    tx_bursts: HashMap<PortId, Vec<usize>>,
    tx_limit: Option<usize>,
    rx_oversized: usize,
}

impl MemoryIo {
    /// Create empty driver
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept at most `limit` packets per TX burst
    pub fn with_tx_limit(limit: usize) -> Self {
        Self {
            tx_limit: Some(limit),
            ..Self::default()
        }
    }

    /// Queue a frame for reception
    pub fn inject(&mut self, port: PortId, queue: QueueId, frame: impl Into<Vec<u8>>) {
        self.rx.entry((port, queue)).or_default().push_back(frame.into());
    }

    /// Frames transmitted on `port`, in order
    pub fn transmitted(&self, port: PortId) -> &[Vec<u8>] {
        self.tx.get(&port).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Size of each TX burst issued on `port`
    pub fn bursts(&self, port: PortId) -> &[usize] {
        self.tx_bursts.get(&port).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Frames still waiting on RX queues
    pub fn rx_pending(&self) -> usize {
        self.rx.values().map(VecDeque::len).sum()
    }

    /// Frames discarded at RX for exceeding `MAX_FRAME_LEN`
    pub fn rx_oversized(&self) -> usize {
        self.rx_oversized
    }
}

impl PacketIo for MemoryIo {
    fn rx_burst(
        &mut self,
        port: PortId,
        queue: QueueId,
        pool: &MbufPool,
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> usize {
        let Some(ring) = self.rx.get_mut(&(port, queue)) else {
            return 0;
        };

        let mut n = 0;
        while n < max {
            let Some(frame) = ring.front() else { break };
            if frame.len() > MAX_FRAME_LEN {
                tracing::debug!(port, queue, len = frame.len(), "dropping oversized frame");
                ring.pop_front();
                self.rx_oversized += 1;
                continue;
            }
            // Pool exhausted: leave the frame on the ring, as a NIC would.
            let Some(mbuf) = pool.alloc_with(port, frame) else { break };
            ring.pop_front();
            out.push(mbuf);
            n += 1;
        }
        n
    }

    fn tx_burst(&mut self, port: PortId, _queue: QueueId, pkts: &mut Vec<Mbuf>) -> usize {
        let n = self.tx_limit.map_or(pkts.len(), |limit| limit.min(pkts.len()));
        let sink = self.tx.entry(port).or_default();
        for mbuf in pkts.drain(..n) {
            sink.push(mbuf.data().to_vec());
        }
        self.tx_bursts.entry(port).or_default().push(n);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_respects_max_and_order() {
        let pool = MbufPool::new(16);
        let mut io = MemoryIo::new();
        for i in 0..5u8 {
            io.inject(0, 1, vec![i]);
        }

        let mut out = Vec::new();
        assert_eq!(io.rx_burst(0, 1, &pool, &mut out, 3), 3);
        assert_eq!(out.iter().map(|m| m.data()[0]).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(io.rx_pending(), 2);
        assert_eq!(io.rx_burst(0, 0, &pool, &mut out, 3), 0);
    }

    #[test]
    fn test_rx_stops_when_pool_exhausted() {
        let pool = MbufPool::new(1);
        let mut io = MemoryIo::new();
        io.inject(0, 0, vec![1]);
        io.inject(0, 0, vec![2]);

        let mut out = Vec::new();
        assert_eq!(io.rx_burst(0, 0, &pool, &mut out, 8), 1);
        assert_eq!(io.rx_pending(), 1);
    }

    #[test]
    fn test_rx_skips_oversized_frames() {
        let pool = MbufPool::new(4);
        let mut io = MemoryIo::new();
        io.inject(0, 0, vec![0xAA; MAX_FRAME_LEN + 1]);
        io.inject(0, 0, vec![1; MAX_FRAME_LEN]);
        io.inject(0, 0, vec![2]);

        let mut out = Vec::new();
        assert_eq!(io.rx_burst(0, 0, &pool, &mut out, 8), 2);
        assert_eq!(out[0].len(), MAX_FRAME_LEN);
        assert_eq!(out[1].data(), &[2]);
        assert_eq!(io.rx_oversized(), 1);
        assert_eq!(io.rx_pending(), 0);
        assert_eq!(pool.allocated(), 2);
    }

    #[test]
    fn test_tx_limit_leaves_rest() {
        let pool = MbufPool::new(4);
        let mut io = MemoryIo::with_tx_limit(1);
        let mut pkts = vec![
            pool.alloc_with(0, &[1]).unwrap(),
            pool.alloc_with(0, &[2]).unwrap(),
        ];

        assert_eq!(io.tx_burst(2, 0, &mut pkts), 1);
        assert_eq!(pkts.len(), 1);
        assert_eq!(io.transmitted(2), &[vec![1]]);
    }
}
