//! Dataplane Engine
//!
//! Starts one pinned-style worker thread per configured lcore, each running
//! its [`LcoreRuntime`] to completion, plus a crypto node when the
//! poll-device mode is selected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use p4dp_common::{AsyncMode, DataplaneError, DataplaneResult, LcoreId};

use crate::config::DataplaneConfig;
use crate::counters::{aggregate, CounterSnapshot, OccurrenceCounters};
use crate::crypto::{make_backend, CryptoNode, CRYPTO_NODE_ENGINE_ID};
use crate::io::PacketIo;
use crate::lcore::LcoreRuntime;
use crate::program::PacketProgram;
use crate::replica::ReplicaTableManager;
use crate::tables::LookupTable;

/// Per-worker handle
struct WorkerHandle {
    lcore_id: LcoreId,
    thread: Option<thread::JoinHandle<()>>,
}

/// The forwarding engine
///
/// Owns the shared table replicas and the worker threads:
/// - configuration is validated before anything starts
/// - counters stay readable after the workers stop
pub struct Dataplane<T> {
    config: DataplaneConfig,
    tables: Arc<ReplicaTableManager<T>>,
    running: Arc<AtomicBool>,
    workers: Vec<WorkerHandle>,
    counters: Vec<(LcoreId, Arc<OccurrenceCounters>)>,
    crypto_node: Option<CryptoNode>,
}

impl<T: LookupTable> Dataplane<T> {
    /// Validate `config` and create empty tables on every socket
    pub fn new(config: DataplaneConfig) -> DataplaneResult<Self> {
        config.validate()?;
        let tables = Arc::new(ReplicaTableManager::new(config.nb_sockets, config.nb_tables));
        Ok(Self {
            config,
            tables,
            running: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            counters: Vec::new(),
            crypto_node: None,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &DataplaneConfig {
        &self.config
    }

    /// Table replicas, for the control plane
    pub fn tables(&self) -> &Arc<ReplicaTableManager<T>> {
        &self.tables
    }

    /// Start every lcore.
    ///
    /// `setup` is called once per lcore on the calling thread and returns
    /// the lcore's driver and packet program.
    pub fn start<D, P, F>(&mut self, mut setup: F) -> DataplaneResult<()>
    where
        D: PacketIo + Send + 'static,
        P: PacketProgram<T> + 'static,
        F: FnMut(LcoreId) -> (D, P),
    {
        if self.running.load(Ordering::Acquire) {
            return Err(DataplaneError::AlreadyRunning);
        }

        let mut runtimes = Vec::new();
        for lcore_id in self.config.lcores() {
            runtimes.push(LcoreRuntime::new(lcore_id, &self.config, Arc::clone(&self.tables))?);
        }

        if self.config.async_mode == AsyncMode::PollDevice {
            let devices = runtimes
                .iter()
                .filter_map(|rt| rt.crypto_device().cloned())
                .collect();
            let backend = make_backend(
                self.config.crypto_backend,
                self.config.crypto_key,
                CRYPTO_NODE_ENGINE_ID,
                self.config.fake_crypto_delay(),
            );
            self.crypto_node = Some(CryptoNode::spawn(devices, backend, self.config.crypto_burst_size())?);
        }

        self.counters = runtimes
            .iter()
            .map(|rt| (rt.lcore_id(), Arc::clone(rt.counters())))
            .collect();
        self.running.store(true, Ordering::Release);

        for mut runtime in runtimes {
            let lcore_id = runtime.lcore_id();
            let (mut io, mut program) = setup(lcore_id);
            let running = Arc::clone(&self.running);

            let spawned = thread::Builder::new()
                .name(format!("p4dp-lcore-{}", lcore_id))
                .spawn(move || runtime.run(&mut io, &mut program, &running));
            match spawned {
                Ok(handle) => self.workers.push(WorkerHandle {
                    lcore_id,
                    thread: Some(handle),
                }),
                Err(e) => {
                    self.stop();
                    return Err(DataplaneError::Spawn(e.to_string()));
                }
            }
        }

        tracing::info!(
            lcores = self.workers.len(),
            mode = ?self.config.async_mode,
            "dataplane started"
        );
        Ok(())
    }

    /// Stop the workers and the crypto node
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);

        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                if handle.join().is_err() {
                    tracing::warn!(lcore = worker.lcore_id, "lcore worker panicked");
                }
            }
        }
        let stopped = self.workers.len();
        self.workers.clear();

        if let Some(mut node) = self.crypto_node.take() {
            node.stop();
        }
        if stopped > 0 {
            tracing::info!(lcores = stopped, "dataplane stopped");
        }
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Counters of each lcore
    pub fn counters(&self) -> Vec<(LcoreId, CounterSnapshot)> {
        self.counters
            .iter()
            .map(|(lcore, c)| (*lcore, c.snapshot()))
            .collect()
    }

    /// Counters summed over all lcores
    pub fn totals(&self) -> CounterSnapshot {
        aggregate(self.counters.iter().map(|(_, c)| c.as_ref()))
    }

    /// Export every lcore's counters to the `metrics` facade
    pub fn publish_metrics(&self) {
        for (lcore, c) in &self.counters {
            c.publish(*lcore);
        }
    }
}

impl<T> Drop for Dataplane<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        for worker in &mut self.workers {
            if let Some(handle) = worker.thread.take() {
                let _ = handle.join();
            }
        }
    }
}
