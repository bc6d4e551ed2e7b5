//! Error types for the dataplane runtime

use thiserror::Error;

/// Bounded resource that ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Packet buffer pool
    MbufPool,
    /// Crypto submission ring
    CryptoRing,
    /// Suspended-flow context pool
    ContextPool,
    /// In-flight async op records
    AsyncOpPool,
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::MbufPool => "mbuf pool",
            Self::CryptoRing => "crypto ring",
            Self::ContextPool => "crypto context pool",
            Self::AsyncOpPool => "async op pool",
        };
        f.write_str(name)
    }
}

/// Dataplane error type
#[derive(Error, Debug)]
pub enum DataplaneError {
    /// Invalid startup configuration (fatal before steady state)
    #[error("config error: {0}")]
    Config(String),

    /// Replica construction failed; active replica untouched
    #[error("build of table {table_id} on socket {socket_id} failed: {reason}")]
    BuildFailed {
        /// Table
        table_id: usize,
        /// Socket
        socket_id: usize,
        /// Collaborator-provided reason
        reason: String,
    },

    /// Readers may still hold the vacated replica
    #[error("replica of table {table_id} on socket {socket_id} still in use by readers")]
    ReplicaInUse {
        /// Table
        table_id: usize,
        /// Socket
        socket_id: usize,
    },

    /// Readers did not quiesce in time
    #[error("readers did not quiesce within {0:?}")]
    QuiescenceTimeout(std::time::Duration),

    /// Activate called without a completed build
    #[error("no built replica pending for table {table_id} on socket {socket_id}")]
    NothingToActivate {
        /// Table
        table_id: usize,
        /// Socket
        socket_id: usize,
    },

    /// Seed targeted an already populated slot
    #[error("active replica of table {table_id} on socket {socket_id} already populated")]
    SlotNotEmpty {
        /// Table
        table_id: usize,
        /// Socket
        socket_id: usize,
    },

    /// Table id out of range
    #[error("unknown table: {0}")]
    UnknownTable(usize),

    /// Socket id out of range
    #[error("unknown socket: {0}")]
    UnknownSocket(usize),

    /// Port id out of range
    #[error("unknown port: {0}")]
    UnknownPort(u16),

    /// Bounded pool or ring exhausted
    #[error("{0} exhausted")]
    ResourceExhausted(Resource),

    /// Engine started twice
    #[error("dataplane already running")]
    AlreadyRunning,

    /// Worker thread could not be started
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

/// Result type for the dataplane
pub type DataplaneResult<T> = Result<T, DataplaneError>;
