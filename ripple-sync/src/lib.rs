//! # ripple-sync — optimistic-sync engine for collaborative documents
//!
//! The server-side half of a push/pull/poke sync protocol: clients mutate
//! local state instantly and reconcile asynchronously against this
//! authoritative per-document key/value store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   push (mutations)   ┌──────────────┐
//! │   Client     │ ───────────────────► │  SyncEngine  │
//! │ (optimistic) │ ◄─────────────────── │              │
//! └──────────────┘   pull (patch)       └──────┬───────┘
//!                                              │
//!                            ┌─────────────────┼──────────────────┐
//!                            ▼                 ▼                  ▼
//!                     ┌────────────┐   ┌──────────────┐   ┌─────────────┐
//!                     │ WriteBuffer│   │ Mutator      │   │ ObjectStore │
//!                     │ (per push) │   │ registry     │   │ (RocksDB)   │
//!                     └────────────┘   └──────────────┘   └─────────────┘
//! ```
//!
//! Three guarantees hold the protocol together:
//!
//! - **Idempotent push** — every mutation carries a client-local sequence
//!   number; the per-client watermark makes re-submitted batches no-ops.
//! - **Monotonic checkpoints** — every commit advances a document head
//!   version; a pull at cookie C returns exactly the rows newer than C.
//! - **Atomic commits** — object rows, the change index, and the watermark
//!   land in one store batch or not at all.
//!
//! ## Modules
//!
//! - [`protocol`] — push/pull DTOs, cookies, the binary socket envelope
//! - [`storage`] — RocksDB-backed versioned object store + client registry
//! - [`buffer`] — per-push read-through, write-back staging cache
//! - [`mutators`] — name-dispatched mutation handlers
//! - [`engine`] — the push and pull paths

pub mod buffer;
pub mod engine;
pub mod error;
pub mod mutators;
pub mod protocol;
pub mod storage;

// Re-exports for convenience
pub use buffer::WriteBuffer;
pub use engine::{PushOutcome, SyncEngine};
pub use error::SyncError;
pub use mutators::{DelMutator, Mutator, MutatorRegistry, PutMutator};
pub use protocol::{
    format_cookie, parse_cookie, MessageType, Mutation, PatchOp, ProtocolError, PullRequest,
    PullResponse, PushRequest, SocketMessage,
};
pub use storage::{ClientRecord, ObjectStore, PullData, StoreConfig, StoreError};
