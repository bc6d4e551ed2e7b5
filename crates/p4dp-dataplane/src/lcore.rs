//! Per-Core Runtime
//!
//! Everything one forwarding lcore owns: its RX queue bindings, per-port
//! egress buffers, packet pool, crypto dispatcher and counters. Table
//! replicas are the only state shared with other cores.
//!
//! One [`LcoreRuntime::run_burst`] is one iteration of the forwarding loop:
//!
//! ```text
//! for each RX queue: rx_burst -> program -> verdict | crypto
//! poll crypto completions -> verdicts
//! end of burst: flush every egress buffer
//! announce quiescent state
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;
use p4dp_common::{
    AsyncMode, DataplaneError, DataplaneResult, LcoreId, PortId, RxQueue, SocketId, TableId,
    MAX_PKT_BURST, MAX_RX_QUEUE_PER_LCORE,
};

use crate::buffer::{Mbuf, MbufPool};
use crate::config::DataplaneConfig;
use crate::counters::{Occurrence, OccurrenceCounters};
use crate::crypto::{make_backend, AsyncCryptoDispatcher, AsyncOpKind, CryptoDevice, CryptoOutcome};
use crate::egress::{EgressBuffers, FlushReport};
use crate::io::PacketIo;
use crate::program::{Action, LocalTables, PacketProgram, Resume, Verdict};
use crate::qsbr::QsbrReader;
use crate::replica::ReplicaTableManager;
use crate::tables::LookupTable;

/// How long a stopping lcore waits for in-flight crypto ops
const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// State owned by one forwarding lcore
pub struct LcoreRuntime<T> {
    lcore_id: LcoreId,
    socket_id: SocketId,
    rx_queues: Vec<RxQueue>,
    egress: EgressBuffers,
    mempool: MbufPool,
    dispatcher: AsyncCryptoDispatcher,
    counters: Arc<OccurrenceCounters>,
    tables: Arc<ReplicaTableManager<T>>,
    reader: QsbrReader,
    rx_burst: Vec<Mbuf>,
    completed: Vec<(Mbuf, Verdict)>,
}

impl<T: LookupTable> LcoreRuntime<T> {
    /// Bind `lcore_id` to its queues and pools as described by `config`.
    ///
    /// `config` is expected to be validated; an lcore without RX queues or
    /// placed on a socket the manager lacks is rejected.
    pub fn new(
        lcore_id: LcoreId,
        config: &DataplaneConfig,
        tables: Arc<ReplicaTableManager<T>>,
    ) -> DataplaneResult<Self> {
        let rx_queues = config.rx_queues_for(lcore_id);
        if rx_queues.is_empty() {
            return Err(DataplaneError::Config(format!("lcore {} has no RX queues", lcore_id)));
        }
        if rx_queues.len() > MAX_RX_QUEUE_PER_LCORE {
            return Err(DataplaneError::Config(format!(
                "lcore {} has more than {} RX queues",
                lcore_id, MAX_RX_QUEUE_PER_LCORE
            )));
        }
        let tx_queue = config
            .tx_queue_for(lcore_id)
            .ok_or_else(|| DataplaneError::Config(format!("lcore {} has no TX queue", lcore_id)))?;

        let socket_id = config.socket_of(lcore_id);
        let reader = tables.register_reader(socket_id)?;

        let backend = make_backend(
            config.crypto_backend,
            config.crypto_key,
            lcore_id,
            config.fake_crypto_delay(),
        );
        let mut dispatcher = AsyncCryptoDispatcher::new(lcore_id, config.async_mode, backend)
            .with_sampling(config.crypto_every_n)
            .with_pools(config.crypto_context_pool_size, config.async_op_pool_size);
        if config.async_mode == AsyncMode::PollDevice {
            dispatcher = dispatcher.with_device(CryptoDevice::new(config.crypto_ring_size));
        }
        dispatcher.check_bindings()?;

        tracing::debug!(
            lcore = lcore_id,
            socket = socket_id,
            rx_queues = ?rx_queues,
            tx_queue,
            mode = ?config.async_mode,
            "lcore bound"
        );

        Ok(Self {
            lcore_id,
            socket_id,
            rx_queues,
            egress: EgressBuffers::new(vec![tx_queue; config.nb_ports]),
            mempool: MbufPool::new(config.mbuf_pool_size),
            dispatcher,
            counters: Arc::new(OccurrenceCounters::new()),
            tables,
            reader,
            rx_burst: Vec::with_capacity(MAX_PKT_BURST),
            completed: Vec::new(),
        })
    }

    /// Lcore id
    pub fn lcore_id(&self) -> LcoreId {
        self.lcore_id
    }

    /// NUMA socket whose replicas this lcore reads
    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    /// Polled RX queues
    pub fn rx_queues(&self) -> &[RxQueue] {
        &self.rx_queues
    }

    /// Counters, shareable with a diagnostics reader
    pub fn counters(&self) -> &Arc<OccurrenceCounters> {
        &self.counters
    }

    /// Packet pool
    pub fn mempool(&self) -> &MbufPool {
        &self.mempool
    }

    /// Allocate a packet buffer from this lcore's pool
    pub fn alloc_mbuf(&self) -> Option<Mbuf> {
        self.mempool.alloc()
    }

    /// Device rings, in `PollDevice` mode
    pub fn crypto_device(&self) -> Option<&CryptoDevice> {
        self.dispatcher.device()
    }

    /// Crypto ops awaiting completion
    pub fn pending_crypto(&self) -> usize {
        self.dispatcher.pending()
    }

    /// Packets waiting in egress buffers
    pub fn pending_egress(&self) -> usize {
        self.egress.total_pending()
    }

    /// Look up `key` in the local socket's active replica of `table_id`
    #[inline]
    pub fn lookup(&self, table_id: TableId, key: &T::Key) -> Option<T::Value> {
        self.tables.lookup(table_id, self.socket_id, key)
    }

    /// Table view handed to the packet program
    pub fn tables(&self) -> LocalTables<'_, T> {
        LocalTables::new(&*self.tables, self.socket_id)
    }

    /// Hand a packet to the crypto dispatcher
    pub fn submit_crypto(&mut self, packet: Mbuf, offset: usize, kind: AsyncOpKind, resume: Resume) -> CryptoOutcome {
        self.dispatcher.submit(packet, offset, kind, resume, &self.counters)
    }

    /// Buffer `packet` for `port`, transmitting when the batch fills
    pub fn enqueue_egress<D: PacketIo>(
        &mut self,
        port: PortId,
        packet: Mbuf,
        io: &mut D,
    ) -> DataplaneResult<Option<FlushReport>> {
        self.egress.append(port, packet, io)
    }

    /// Flush every partial egress buffer
    pub fn end_of_burst<D: PacketIo>(&mut self, io: &mut D) -> FlushReport {
        self.egress.flush_all(io)
    }

    /// Apply a final verdict to a packet leaving the forwarding path
    #[inline]
    fn finish<D: PacketIo>(&mut self, packet: Mbuf, verdict: Verdict, io: &mut D) {
        self.counters.record(Occurrence::ProcessedPacket);
        match verdict {
            Verdict::Forward(port) => {
                if let Err(e) = self.egress.append(port, packet, io) {
                    tracing::trace!(lcore = self.lcore_id, error = %e, "dropping packet");
                    return;
                }
                self.counters.record(Occurrence::FwdPacket);
            }
            Verdict::Drop => drop(packet),
        }
    }

    #[inline]
    fn handle<D: PacketIo, P: PacketProgram<T>>(&mut self, mut packet: Mbuf, io: &mut D, program: &mut P) {
        let action = {
            let tables = LocalTables::new(&*self.tables, self.socket_id);
            program.process(&mut packet, &tables)
        };
        match action {
            Action::Done(verdict) => self.finish(packet, verdict, io),
            Action::Crypto { offset, kind, resume } => {
                match self.dispatcher.submit(packet, offset, kind, resume, &self.counters) {
                    CryptoOutcome::Sync(packet, verdict) | CryptoOutcome::Completed(packet, verdict) => {
                        self.finish(packet, verdict, io)
                    }
                    CryptoOutcome::Submitted(_) => {}
                    CryptoOutcome::Dropped(_) => self.counters.record(Occurrence::ProcessedPacket),
                }
            }
        }
    }

    /// Resume flows whose crypto finished; returns completions handled
    pub fn poll_crypto<D: PacketIo>(&mut self, io: &mut D) -> usize {
        let mut done = std::mem::take(&mut self.completed);
        let n = self.dispatcher.poll_completions(&self.counters, &mut done);
        for (packet, verdict) in done.drain(..) {
            self.finish(packet, verdict, io);
        }
        self.completed = done;
        n
    }

    /// One forwarding-loop iteration; returns packets received
    pub fn run_burst<D: PacketIo, P: PacketProgram<T>>(&mut self, io: &mut D, program: &mut P) -> usize {
        let mut received = 0;
        let mut burst = std::mem::take(&mut self.rx_burst);

        for i in 0..self.rx_queues.len() {
            let RxQueue { port_id, queue_id } = self.rx_queues[i];
            received += io.rx_burst(port_id, queue_id, &self.mempool, &mut burst, MAX_PKT_BURST);
            for packet in burst.drain(..) {
                self.handle(packet, io, program);
            }
        }
        self.rx_burst = burst;

        self.poll_crypto(io);
        self.end_of_burst(io);
        self.reader.quiescent();
        received
    }

    /// Run the forwarding loop until `running` is cleared.
    ///
    /// On exit, in-flight crypto ops get a short grace period, buffers are
    /// flushed and the lcore stops holding back table reclamation.
    pub fn run<D: PacketIo, P: PacketProgram<T>>(&mut self, io: &mut D, program: &mut P, running: &AtomicBool) {
        tracing::debug!(lcore = self.lcore_id, "lcore loop starting");
        self.reader.online();

        let backoff = Backoff::new();
        while running.load(Ordering::Relaxed) {
            if self.run_burst(io, program) == 0 && self.dispatcher.pending() == 0 {
                backoff.snooze();
            } else {
                backoff.reset();
            }
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.dispatcher.pending() > 0 && Instant::now() < deadline {
            if self.poll_crypto(io) == 0 {
                std::hint::spin_loop();
            }
        }
        self.end_of_burst(io);
        self.reader.offline();

        self.counters.publish(self.lcore_id);
        self.counters.log_summary(self.lcore_id);
        tracing::debug!(lcore = self.lcore_id, "lcore loop stopped");
    }
}

impl<T> std::fmt::Debug for LcoreRuntime<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LcoreRuntime")
            .field("lcore_id", &self.lcore_id)
            .field("socket_id", &self.socket_id)
            .field("rx_queues", &self.rx_queues)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
