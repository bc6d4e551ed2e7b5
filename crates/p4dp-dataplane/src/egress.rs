//! Egress Batching
//!
//! One fixed-capacity buffer per port. Appends accumulate packets in arrival
//! order; a full buffer is transmitted immediately, and the end-of-burst
//! signal drains every partial buffer so sparse traffic is never held.

use p4dp_common::{DataplaneError, DataplaneResult, PortId, QueueId, MBUF_TABLE_SIZE};

use crate::buffer::Mbuf;
use crate::io::PacketIo;

/// Outcome of a flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Packets accepted by the TX queue
    pub sent: usize,
    /// Packets refused by the TX queue and released
    pub dropped: usize,
}

impl FlushReport {
    /// Accumulate another report
    pub fn merge(&mut self, other: FlushReport) {
        self.sent += other.sent;
        self.dropped += other.dropped;
    }
}

/// Transmit batch for one port
#[derive(Debug)]
pub struct PacketEgressBuffer {
    m_table: Vec<Mbuf>,
}

impl PacketEgressBuffer {
    /// Create empty buffer
    pub fn new() -> Self {
        Self {
            m_table: Vec::with_capacity(MBUF_TABLE_SIZE),
        }
    }

    /// Buffered packets
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.m_table.len()
    }

    /// Check if empty
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.m_table.is_empty()
    }

    /// Check if at capacity
    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.m_table.len() >= MBUF_TABLE_SIZE
    }

    /// Buffered packets, oldest first
    pub fn packets(&self) -> &[Mbuf] {
        &self.m_table
    }

    /// Add a packet; returns true once the buffer reached capacity
    #[inline]
    fn push(&mut self, mbuf: Mbuf) -> bool {
        debug_assert!(!self.is_full());
        self.m_table.push(mbuf);
        self.is_full()
    }

    fn transmit<D: PacketIo>(&mut self, io: &mut D, port: PortId, queue: QueueId) -> FlushReport {
        if self.m_table.is_empty() {
            return FlushReport::default();
        }

        let before = self.m_table.len();
        io.tx_burst(port, queue, &mut self.m_table);
        let dropped = self.m_table.len();
        // Unsent packets go back to their pool.
        self.m_table.clear();

        if dropped > 0 {
            tracing::trace!(port, dropped, "tx queue refused packets");
        }
        FlushReport {
            sent: before - dropped,
            dropped,
        }
    }
}

impl Default for PacketEgressBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-port egress buffers of one lcore, with each port's TX queue id
#[derive(Debug)]
pub struct EgressBuffers {
    tx_queue_id: Vec<QueueId>,
    tx_mbufs: Vec<PacketEgressBuffer>,
}

impl EgressBuffers {
    /// Create buffers for ports `0..tx_queue_id.len()`
    pub fn new(tx_queue_id: Vec<QueueId>) -> Self {
        let tx_mbufs = tx_queue_id.iter().map(|_| PacketEgressBuffer::new()).collect();
        Self { tx_queue_id, tx_mbufs }
    }

    /// Number of ports
    pub fn nb_ports(&self) -> usize {
        self.tx_mbufs.len()
    }

    /// TX queue used for `port`
    pub fn tx_queue(&self, port: PortId) -> Option<QueueId> {
        self.tx_queue_id.get(port as usize).copied()
    }

    /// Packets buffered for `port`
    pub fn pending(&self, port: PortId) -> usize {
        self.tx_mbufs.get(port as usize).map_or(0, PacketEgressBuffer::len)
    }

    /// Packets buffered across all ports
    pub fn total_pending(&self) -> usize {
        self.tx_mbufs.iter().map(PacketEgressBuffer::len).sum()
    }

    /// Buffer `mbuf` for `port`, transmitting the batch if it fills up.
    ///
    /// Returns the flush report when the append triggered a flush.
    #[inline]
    pub fn append<D: PacketIo>(
        &mut self,
        port: PortId,
        mbuf: Mbuf,
        io: &mut D,
    ) -> DataplaneResult<Option<FlushReport>> {
        let idx = port as usize;
        let (Some(table), Some(&queue)) = (self.tx_mbufs.get_mut(idx), self.tx_queue_id.get(idx))
        else {
            return Err(DataplaneError::UnknownPort(port));
        };

        if table.push(mbuf) {
            return Ok(Some(table.transmit(io, port, queue)));
        }
        Ok(None)
    }

    /// Transmit whatever is buffered for `port`
    pub fn flush<D: PacketIo>(&mut self, port: PortId, io: &mut D) -> DataplaneResult<FlushReport> {
        let idx = port as usize;
        let (Some(table), Some(&queue)) = (self.tx_mbufs.get_mut(idx), self.tx_queue_id.get(idx))
        else {
            return Err(DataplaneError::UnknownPort(port));
        };
        Ok(table.transmit(io, port, queue))
    }

    /// End-of-burst: transmit every partial buffer
    pub fn flush_all<D: PacketIo>(&mut self, io: &mut D) -> FlushReport {
        let mut report = FlushReport::default();
        for (port, (table, &queue)) in self.tx_mbufs.iter_mut().zip(&self.tx_queue_id).enumerate() {
            report.merge(table.transmit(io, port as PortId, queue));
        }
        report
    }
}
