//! Replicated Lookup Tables
//!
//! Every table id has two replicas per NUMA socket and an `active_replica`
//! index. Forwarding lcores read the active replica without locks; the
//! control plane builds into the inactive replica and publishes it with a
//! single release store of the index.
//!
//! # Reclamation
//!
//! A replica vacated by a flip is only rebuilt once every reader registered
//! on that socket has passed a quiescent state after the flip (see
//! [`crate::qsbr`]). Until then a lookup that loaded the old index keeps
//! seeing the old contents in full.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use p4dp_common::{DataplaneError, DataplaneResult, SocketId, TableId, MAX_LCORES, NB_REPLICA};
use parking_lot::{Mutex, MutexGuard};

use crate::qsbr::{QsbrDomain, QsbrReader};
use crate::tables::LookupTable;

/// Writer-side bookkeeping, guarded by the per-table writer lock
#[derive(Debug, Default)]
struct WriterState {
    /// Inactive replica holds a finished build awaiting activation
    ready: bool,
    /// Epoch of the flip that vacated the inactive replica; 0 once reclaimed
    retired_epoch: u64,
}

struct TableReplicas<T> {
    slots: [ArcSwapOption<T>; NB_REPLICA],
    active_replica: AtomicUsize,
    generation: AtomicU64,
    writer: Mutex<WriterState>,
}

impl<T> TableReplicas<T> {
    fn new() -> Self {
        Self {
            slots: [ArcSwapOption::empty(), ArcSwapOption::empty()],
            active_replica: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            writer: Mutex::new(WriterState::default()),
        }
    }
}

/// Tables of one NUMA socket
pub struct SocketState<T> {
    socket_id: SocketId,
    tables: Box<[TableReplicas<T>]>,
    qsbr: Arc<QsbrDomain>,
}

impl<T: LookupTable> SocketState<T> {
    /// Create `nb_tables` empty tables, replica 0 active
    pub fn new(socket_id: SocketId, nb_tables: usize) -> Self {
        Self {
            socket_id,
            tables: (0..nb_tables).map(|_| TableReplicas::new()).collect(),
            qsbr: QsbrDomain::new(MAX_LCORES),
        }
    }

    /// Socket id
    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    /// Number of tables
    pub fn nb_tables(&self) -> usize {
        self.tables.len()
    }

    /// Reader registry of this socket
    pub fn qsbr(&self) -> &Arc<QsbrDomain> {
        &self.qsbr
    }

    fn table(&self, table_id: TableId) -> DataplaneResult<&TableReplicas<T>> {
        self.tables
            .get(table_id)
            .ok_or(DataplaneError::UnknownTable(table_id))
    }

    #[inline]
    fn lookup(&self, table_id: TableId, key: &T::Key) -> Option<T::Value> {
        let replicas = self.tables.get(table_id)?;
        let idx = replicas.active_replica.load(Ordering::Acquire);
        let replica = replicas.slots[idx].load();
        replica.as_deref().and_then(|table| table.get(key))
    }
}

/// Double-buffered lookup tables for every socket
pub struct ReplicaTableManager<T> {
    sockets: Box<[SocketState<T>]>,
    nb_tables: usize,
}

impl<T: LookupTable> ReplicaTableManager<T> {
    /// Create `nb_tables` tables on each of `nb_sockets` sockets
    pub fn new(nb_sockets: usize, nb_tables: usize) -> Self {
        Self {
            sockets: (0..nb_sockets).map(|s| SocketState::new(s, nb_tables)).collect(),
            nb_tables,
        }
    }

    /// Number of sockets
    pub fn nb_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Number of tables per socket
    pub fn nb_tables(&self) -> usize {
        self.nb_tables
    }

    /// Socket state
    pub fn socket(&self, socket_id: SocketId) -> DataplaneResult<&SocketState<T>> {
        self.sockets
            .get(socket_id)
            .ok_or(DataplaneError::UnknownSocket(socket_id))
    }

    /// Register a forwarding lcore as a reader of `socket_id`'s tables
    pub fn register_reader(&self, socket_id: SocketId) -> DataplaneResult<QsbrReader> {
        self.socket(socket_id)?.qsbr.register()
    }

    /// Look `key` up in the active replica.
    ///
    /// Unknown table or socket ids and empty replicas read as a miss.
    #[inline]
    pub fn lookup(&self, table_id: TableId, socket_id: SocketId, key: &T::Key) -> Option<T::Value> {
        self.sockets.get(socket_id)?.lookup(table_id, key)
    }

    /// Index of the active replica
    pub fn active_replica(&self, table_id: TableId, socket_id: SocketId) -> DataplaneResult<usize> {
        let replicas = self.socket(socket_id)?.table(table_id)?;
        Ok(replicas.active_replica.load(Ordering::Acquire))
    }

    /// Completed activations of a table
    pub fn generation(&self, table_id: TableId, socket_id: SocketId) -> DataplaneResult<u64> {
        let replicas = self.socket(socket_id)?.table(table_id)?;
        Ok(replicas.generation.load(Ordering::Acquire))
    }

    /// Install initial contents into the empty active replica.
    ///
    /// Used at startup; no flip happens, so the active index stays put.
    pub fn seed(&self, table_id: TableId, socket_id: SocketId, contents: T::Contents) -> DataplaneResult<()> {
        let socket = self.socket(socket_id)?;
        let replicas = socket.table(table_id)?;
        let _writer = replicas.writer.lock();

        let active = replicas.active_replica.load(Ordering::Acquire);
        if replicas.slots[active].load().is_some() {
            return Err(DataplaneError::SlotNotEmpty { table_id, socket_id });
        }

        let table = T::build(contents).map_err(|e| DataplaneError::BuildFailed {
            table_id,
            socket_id,
            reason: e.to_string(),
        })?;
        replicas.slots[active].store(Some(Arc::new(table)));
        Ok(())
    }

    /// Reserve the inactive replica for a build, waiting for readers of a
    /// previous flip to quiesce.
    pub fn begin_build(&self, table_id: TableId, socket_id: SocketId) -> DataplaneResult<BuildHandle<'_, T>> {
        let (socket, replicas) = self.locate(table_id, socket_id)?;
        let writer = replicas.writer.lock();
        self.reclaim(socket, replicas, writer, table_id, None)
    }

    /// Like [`Self::begin_build`] but gives up after `timeout`
    pub fn begin_build_timeout(
        &self,
        table_id: TableId,
        socket_id: SocketId,
        timeout: Duration,
    ) -> DataplaneResult<BuildHandle<'_, T>> {
        let (socket, replicas) = self.locate(table_id, socket_id)?;
        let writer = replicas.writer.lock();
        self.reclaim(socket, replicas, writer, table_id, Some(timeout))
    }

    /// Reserve the inactive replica only if it is free right now
    pub fn try_begin_build(&self, table_id: TableId, socket_id: SocketId) -> DataplaneResult<BuildHandle<'_, T>> {
        let (socket, replicas) = self.locate(table_id, socket_id)?;
        let Some(mut writer) = replicas.writer.try_lock() else {
            return Err(DataplaneError::ReplicaInUse { table_id, socket_id });
        };
        if writer.retired_epoch != 0 {
            if !socket.qsbr.is_quiescent_since(writer.retired_epoch) {
                return Err(DataplaneError::ReplicaInUse { table_id, socket_id });
            }
            writer.retired_epoch = 0;
        }
        Ok(BuildHandle::new(socket, replicas, writer, table_id))
    }

    /// Publish the replica finished by the last build.
    ///
    /// Must not be called while a [`BuildHandle`] for the same table is
    /// alive on this thread; use [`BuildHandle::activate`] then.
    pub fn activate(&self, table_id: TableId, socket_id: SocketId) -> DataplaneResult<usize> {
        let (socket, replicas) = self.locate(table_id, socket_id)?;
        let mut writer = replicas.writer.lock();
        publish(socket, replicas, &mut writer, table_id)
    }

    /// Build `contents` into the inactive replica and activate it
    pub fn replace(&self, table_id: TableId, socket_id: SocketId, contents: T::Contents) -> DataplaneResult<usize> {
        let mut handle = self.begin_build(table_id, socket_id)?;
        handle.build(contents)?;
        handle.activate()
    }

    /// Replace `table_id` on every socket with the same contents.
    ///
    /// Stops at the first failing socket; sockets already replaced keep the
    /// new contents.
    pub fn replace_on_all_sockets(&self, table_id: TableId, contents: T::Contents) -> DataplaneResult<()>
    where
        T::Contents: Clone,
    {
        for socket_id in 0..self.sockets.len() {
            self.replace(table_id, socket_id, contents.clone())?;
        }
        Ok(())
    }

    fn locate(&self, table_id: TableId, socket_id: SocketId) -> DataplaneResult<(&SocketState<T>, &TableReplicas<T>)> {
        let socket = self.socket(socket_id)?;
        let replicas = socket.table(table_id)?;
        Ok((socket, replicas))
    }

    fn reclaim<'a>(
        &self,
        socket: &'a SocketState<T>,
        replicas: &'a TableReplicas<T>,
        mut writer: MutexGuard<'a, WriterState>,
        table_id: TableId,
        timeout: Option<Duration>,
    ) -> DataplaneResult<BuildHandle<'a, T>> {
        if writer.retired_epoch != 0 {
            let deadline = timeout.map(|t| Instant::now() + t);
            if !socket.qsbr.wait_quiescent(writer.retired_epoch, deadline) {
                return Err(DataplaneError::QuiescenceTimeout(timeout.unwrap_or_default()));
            }
            writer.retired_epoch = 0;
        }
        Ok(BuildHandle::new(socket, replicas, writer, table_id))
    }
}

fn publish<T>(
    socket: &SocketState<T>,
    replicas: &TableReplicas<T>,
    writer: &mut WriterState,
    table_id: TableId,
) -> DataplaneResult<usize> {
    if !writer.ready {
        return Err(DataplaneError::NothingToActivate {
            table_id,
            socket_id: socket.socket_id,
        });
    }

    let old = replicas.active_replica.load(Ordering::Relaxed);
    let new = (old + 1) % NB_REPLICA;
    replicas.active_replica.store(new, Ordering::Release);

    writer.ready = false;
    writer.retired_epoch = socket.qsbr.advance();
    let generation = replicas.generation.fetch_add(1, Ordering::AcqRel) + 1;

    tracing::info!(
        table_id,
        socket_id = socket.socket_id,
        replica = new,
        generation,
        "activated table replica"
    );
    Ok(new)
}

/// Exclusive access to the inactive replica of one (table, socket)
pub struct BuildHandle<'a, T> {
    socket: &'a SocketState<T>,
    replicas: &'a TableReplicas<T>,
    writer: MutexGuard<'a, WriterState>,
    table_id: TableId,
    slot: usize,
}

impl<'a, T: LookupTable> BuildHandle<'a, T> {
    fn new(
        socket: &'a SocketState<T>,
        replicas: &'a TableReplicas<T>,
        writer: MutexGuard<'a, WriterState>,
        table_id: TableId,
    ) -> Self {
        let active = replicas.active_replica.load(Ordering::Acquire);
        Self {
            socket,
            replicas,
            writer,
            table_id,
            slot: (active + 1) % NB_REPLICA,
        }
    }

    /// Replica index being built
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Construct the replica. On failure the slot is cleared and the
    /// active replica stays authoritative.
    pub fn build(&mut self, contents: T::Contents) -> DataplaneResult<()> {
        match T::build(contents) {
            Ok(table) => {
                self.replicas.slots[self.slot].store(Some(Arc::new(table)));
                self.writer.ready = true;
                Ok(())
            }
            Err(e) => {
                self.replicas.slots[self.slot].store(None);
                self.writer.ready = false;
                tracing::warn!(
                    table_id = self.table_id,
                    socket_id = self.socket.socket_id,
                    error = %e,
                    "table build failed, keeping active replica"
                );
                Err(DataplaneError::BuildFailed {
                    table_id: self.table_id,
                    socket_id: self.socket.socket_id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Publish the built replica; returns the new active index
    pub fn activate(mut self) -> DataplaneResult<usize> {
        publish(self.socket, self.replicas, &mut self.writer, self.table_id)
    }
}
