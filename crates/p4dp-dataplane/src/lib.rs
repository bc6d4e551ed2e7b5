//! P4 Dataplane Per-Core Runtime
//!
//! The runtime around generated P4 forwarding logic: per-core resources,
//! asynchronous crypto offload and hot-swappable lookup table replicas.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            DATAPLANE                             │
//! │                                                                  │
//! │  ┌────────────────────┐        ┌────────────────────┐            │
//! │  │  LcoreRuntime 0    │  ...   │  LcoreRuntime N    │            │
//! │  │                    │        │                    │            │
//! │  │  RX queues (≤16)   │        │  RX queues (≤16)   │            │
//! │  │        │           │        │        │           │            │
//! │  │        ▼           │        │        ▼           │            │
//! │  │  PacketProgram ────┼──┐  ┌──┼─── PacketProgram   │            │
//! │  │        │           │  │  │  │        │           │            │
//! │  │        ▼           │  ▼  ▼  │        ▼           │            │
//! │  │  CryptoDispatcher  │ Replica│  CryptoDispatcher  │            │
//! │  │        │           │ Tables │        │           │            │
//! │  │        ▼           │ (per   │        ▼           │            │
//! │  │  Egress buffers    │ socket)│  Egress buffers    │            │
//! │  │  (32 per port)     │        │  (32 per port)     │            │
//! │  └────────┬───────────┘        └────────┬───────────┘            │
//! │           │ submit/complete rings       │                        │
//! │           └──────────► Crypto node ◄────┘                        │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! 1. **Exactly one active replica** per (table, socket) at every instant
//! 2. **No torn lookups**: a replica vacated by a flip is rebuilt only after
//!    every reader on the socket went quiescent
//! 3. **Bounded egress latency**: batches flush at 32 packets or at the end
//!    of a burst
//! 4. **Non-blocking offload**: a full ring or pool drops the packet and
//!    counts `async_drop`

#![warn(missing_docs)]

pub mod buffer;
pub mod config;
pub mod counters;
pub mod crypto;
pub mod egress;
pub mod engine;
pub mod io;
pub mod lcore;
pub mod program;
pub mod qsbr;
pub mod replica;
pub mod tables;

pub use buffer::{Mbuf, MbufPool, PacketBuffer};
pub use config::DataplaneConfig;
pub use counters::{CounterSnapshot, Occurrence, OccurrenceCounters};
pub use crypto::{AsyncCryptoDispatcher, AsyncOp, AsyncOpKind, CryptoBackend, CryptoOutcome};
pub use egress::{EgressBuffers, FlushReport, PacketEgressBuffer};
pub use engine::Dataplane;
pub use io::{MemoryIo, PacketIo};
pub use lcore::LcoreRuntime;
pub use program::{Action, LocalTables, PacketProgram, Verdict};
pub use replica::{BuildHandle, ReplicaTableManager, SocketState};
pub use tables::{ExactMatchContents, ExactMatchTable, LookupTable};

pub use p4dp_common::{AsyncMode, CryptoBackendKind, DataplaneError, DataplaneResult, Resource};
