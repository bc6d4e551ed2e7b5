//! Quiescent-State-Based Reclamation
//!
//! Forwarding lcores register as readers of a socket's tables and announce a
//! quiescent state between bursts, i.e. a point where they hold no reference
//! into any replica. After a replica flip the writer advances the epoch; the
//! vacated replica may be rebuilt once every online reader has announced a
//! quiescent state at or after that epoch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::utils::{Backoff, CachePadded};
use p4dp_common::{DataplaneError, DataplaneResult};

/// Epoch value of a reader that is not reading
const OFFLINE: u64 = 0;

#[derive(Default)]
struct ReaderSlot {
    claimed: AtomicBool,
    epoch: AtomicU64,
}

/// Reader registry and epoch counter of one socket
pub struct QsbrDomain {
    global_epoch: CachePadded<AtomicU64>,
    readers: Box<[CachePadded<ReaderSlot>]>,
}

impl QsbrDomain {
    /// Create domain accepting up to `max_readers` registrations
    pub fn new(max_readers: usize) -> Arc<Self> {
        let readers = (0..max_readers)
            .map(|_| CachePadded::new(ReaderSlot::default()))
            .collect();
        Arc::new(Self {
            global_epoch: CachePadded::new(AtomicU64::new(1)),
            readers,
        })
    }

    /// Register a reader; it starts online at the current epoch
    pub fn register(self: &Arc<Self>) -> DataplaneResult<QsbrReader> {
        for (slot, reader) in self.readers.iter().enumerate() {
            if reader
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let handle = QsbrReader {
                    domain: Arc::clone(self),
                    slot,
                };
                handle.quiescent();
                return Ok(handle);
            }
        }
        Err(DataplaneError::Config(format!(
            "more than {} table readers registered",
            self.readers.len()
        )))
    }

    /// Current epoch
    pub fn current_epoch(&self) -> u64 {
        self.global_epoch.load(Ordering::SeqCst)
    }

    /// Start a new epoch and return it
    pub fn advance(&self) -> u64 {
        self.global_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Registered readers currently online
    pub fn online_readers(&self) -> usize {
        self.readers
            .iter()
            .filter(|r| r.claimed.load(Ordering::Acquire) && r.epoch.load(Ordering::SeqCst) != OFFLINE)
            .count()
    }

    /// True when every online reader has been quiescent since `epoch`
    pub fn is_quiescent_since(&self, epoch: u64) -> bool {
        self.readers.iter().all(|r| {
            if !r.claimed.load(Ordering::Acquire) {
                return true;
            }
            let seen = r.epoch.load(Ordering::SeqCst);
            seen == OFFLINE || seen >= epoch
        })
    }

    /// Spin until quiescent since `epoch`, or until `deadline` passes.
    ///
    /// Returns false on timeout.
    pub fn wait_quiescent(&self, epoch: u64, deadline: Option<Instant>) -> bool {
        let backoff = Backoff::new();
        loop {
            if self.is_quiescent_since(epoch) {
                return true;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }
}

impl std::fmt::Debug for QsbrDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QsbrDomain")
            .field("epoch", &self.current_epoch())
            .field("online_readers", &self.online_readers())
            .finish()
    }
}

/// Registration of one reader; going out of scope takes it offline
pub struct QsbrReader {
    domain: Arc<QsbrDomain>,
    slot: usize,
}

impl QsbrReader {
    fn cell(&self) -> &AtomicU64 {
        &self.domain.readers[self.slot].epoch
    }

    /// Announce that no replica reference is held
    #[inline]
    pub fn quiescent(&self) {
        let epoch = self.domain.global_epoch.load(Ordering::SeqCst);
        self.cell().store(epoch, Ordering::SeqCst);
    }

    /// Stop participating; writers no longer wait for this reader
    pub fn offline(&self) {
        self.cell().store(OFFLINE, Ordering::SeqCst);
    }

    /// Resume participating
    pub fn online(&self) {
        self.quiescent();
    }

    /// Whether the reader is online
    pub fn is_online(&self) -> bool {
        self.cell().load(Ordering::SeqCst) != OFFLINE
    }
}

impl Drop for QsbrReader {
    fn drop(&mut self) {
        self.offline();
        self.domain.readers[self.slot]
            .claimed
            .store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for QsbrReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QsbrReader")
            .field("slot", &self.slot)
            .field("online", &self.is_online())
            .finish()
    }
}
