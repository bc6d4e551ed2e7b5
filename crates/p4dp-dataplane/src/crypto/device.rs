//! Poll-device rings
//!
//! Each lcore owns one [`CryptoDevice`]: a bounded submission ring and a
//! bounded completion ring. The lcore pushes ops and polls completions
//! without ever blocking; a [`CryptoNode`] thread services the rings of all
//! lcores with its own backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use p4dp_common::{DataplaneError, DataplaneResult};

use super::{AsyncOp, CryptoBackend, CryptoCompletion};

struct Rings {
    submit: ArrayQueue<AsyncOp>,
    complete: ArrayQueue<CryptoCompletion>,
}

/// Submission/completion ring pair of one lcore
#[derive(Clone)]
pub struct CryptoDevice {
    rings: Arc<Rings>,
}

impl CryptoDevice {
    /// Create rings of depth `ring_size`
    pub fn new(ring_size: usize) -> Self {
        Self {
            rings: Arc::new(Rings {
                submit: ArrayQueue::new(ring_size),
                complete: ArrayQueue::new(ring_size),
            }),
        }
    }

    /// Enqueue an op; a full ring hands it back
    #[inline]
    pub fn submit(&self, op: AsyncOp) -> Result<(), AsyncOp> {
        self.rings.submit.push(op)
    }

    /// Move up to `max` completions into `out`
    #[inline]
    pub fn poll(&self, max: usize, out: &mut Vec<CryptoCompletion>) -> usize {
        let mut n = 0;
        while n < max {
            let Some(c) = self.rings.complete.pop() else { break };
            out.push(c);
            n += 1;
        }
        n
    }

    /// Execute up to `max` submitted ops with `backend`.
    ///
    /// Engine side; only one servicer per device. An op is only taken when
    /// its completion is guaranteed a place in the completion ring.
    pub fn service<B: CryptoBackend + ?Sized>(&self, backend: &mut B, max: usize) -> usize {
        let mut n = 0;
        while n < max && !self.rings.complete.is_full() {
            let Some(mut op) = self.rings.submit.pop() else { break };
            let status = backend.execute(&mut op);
            if let Err(rejected) = self.rings.complete.push(CryptoCompletion { op, status }) {
                // Unreachable with a single servicer; the packet is released.
                tracing::warn!(tag = ?rejected.op.tag, "completion ring overflow");
            }
            n += 1;
        }
        n
    }

    /// Ops waiting for the engine
    pub fn submitted(&self) -> usize {
        self.rings.submit.len()
    }

    /// Completions waiting for the lcore
    pub fn completed(&self) -> usize {
        self.rings.complete.len()
    }

    /// Ring depth
    pub fn capacity(&self) -> usize {
        self.rings.submit.capacity()
    }
}

impl std::fmt::Debug for CryptoDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoDevice")
            .field("submitted", &self.submitted())
            .field("completed", &self.completed())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Crypto node: a thread servicing the devices of all lcores
pub struct CryptoNode {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CryptoNode {
    /// Start servicing `devices` with `backend`, `burst` ops per device per round
    pub fn spawn(
        devices: Vec<CryptoDevice>,
        mut backend: Box<dyn CryptoBackend>,
        burst: usize,
    ) -> DataplaneResult<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("p4dp-crypto-node".into())
            .spawn(move || {
                tracing::debug!(devices = devices.len(), engine = backend.name(), "crypto node starting");
                let backoff = Backoff::new();
                while flag.load(Ordering::Relaxed) {
                    let done: usize = devices
                        .iter()
                        .map(|d| d.service(&mut backend, burst))
                        .sum();
                    if done == 0 {
                        backoff.snooze();
                    } else {
                        backoff.reset();
                    }
                }
                tracing::debug!("crypto node stopped");
            })
            .map_err(|e| DataplaneError::Spawn(e.to_string()))?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// Stop and join
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }

    /// Check if running
    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for CryptoNode {
    fn drop(&mut self) {
        self.stop();
    }
}
