//! Generated forwarding logic seam
//!
//! The P4 backend emits the parser, match/action pipeline and deparser. The
//! runtime drives it through [`PacketProgram`] and only interprets the
//! returned [`Action`].

use p4dp_common::{PortId, SocketId, TableId};

use crate::buffer::Mbuf;
use crate::crypto::AsyncOpKind;
use crate::replica::ReplicaTableManager;
use crate::tables::LookupTable;

/// Final decision for a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Send out of a port
    Forward(PortId),
    /// Drop
    Drop,
}

/// Rest of a packet's processing after its crypto transform
pub type Resume = Box<dyn FnOnce(&mut Mbuf) -> Verdict + Send>;

/// What the program wants done with a packet
pub enum Action {
    /// Processing finished
    Done(Verdict),
    /// Transform the packet from `offset` on, then continue with `resume`
    Crypto {
        /// First byte of the protected region; earlier bytes are authenticated only
        offset: usize,
        /// Encrypt or decrypt
        kind: AsyncOpKind,
        /// Continuation run once the transform is done
        resume: Resume,
    },
}

impl Action {
    /// Forward to `port`
    pub fn forward(port: PortId) -> Self {
        Self::Done(Verdict::Forward(port))
    }

    /// Drop
    pub fn drop_packet() -> Self {
        Self::Done(Verdict::Drop)
    }

    /// Request a crypto transform followed by `resume`
    pub fn crypto(
        offset: usize,
        kind: AsyncOpKind,
        resume: impl FnOnce(&mut Mbuf) -> Verdict + Send + 'static,
    ) -> Self {
        Self::Crypto {
            offset,
            kind,
            resume: Box::new(resume),
        }
    }
}

impl std::fmt::Debug for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Done(v) => f.debug_tuple("Done").field(v).finish(),
            Self::Crypto { offset, kind, .. } => f
                .debug_struct("Crypto")
                .field("offset", offset)
                .field("kind", kind)
                .finish_non_exhaustive(),
        }
    }
}

/// Table access bound to the lcore's NUMA socket
pub struct LocalTables<'a, T> {
    manager: &'a ReplicaTableManager<T>,
    socket_id: SocketId,
}

impl<'a, T: LookupTable> LocalTables<'a, T> {
    pub(crate) fn new(manager: &'a ReplicaTableManager<T>, socket_id: SocketId) -> Self {
        Self { manager, socket_id }
    }

    /// Look up `key` in the active replica of `table_id`
    #[inline(always)]
    pub fn lookup(&self, table_id: TableId, key: &T::Key) -> Option<T::Value> {
        self.manager.lookup(table_id, self.socket_id, key)
    }

    /// Socket the tables live on
    pub fn socket_id(&self) -> SocketId {
        self.socket_id
    }
}

/// Generated per-packet logic
pub trait PacketProgram<T: LookupTable>: Send {
    /// Run parser and match/action stages on `pkt`
    fn process(&mut self, pkt: &mut Mbuf, tables: &LocalTables<'_, T>) -> Action;
}

impl<T, F> PacketProgram<T> for F
where
    T: LookupTable,
    F: FnMut(&mut Mbuf, &LocalTables<'_, T>) -> Action + Send,
{
    fn process(&mut self, pkt: &mut Mbuf, tables: &LocalTables<'_, T>) -> Action {
        self(pkt, tables)
    }
}
