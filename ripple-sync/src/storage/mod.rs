//! Persistent storage for versioned document objects and client records.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐    commits      ┌──────────────┐
//! │ SyncEngine  │ ──────────────► │ ObjectStore  │
//! │ (push/pull) │                 │ (RocksDB)    │
//! └─────────────┘                 └──────┬───────┘
//!                                        │ column families
//!                                        ▼
//!                  ┌───────────────────────────────────────────┐
//!                  │ CF "objects" — (doc, key) → versioned row │
//!                  │ CF "changes" — (doc, version, key) index  │
//!                  │ CF "clients" — client → watermark, cookie │
//!                  │ CF "meta"    — doc → head version         │
//!                  └───────────────────────────────────────────┘
//! ```
//!
//! Every commit is a single atomic `WriteBatch`: the object rows, the
//! change-index maintenance, the document head version, and the client
//! watermark either all land or none do. Partial application is never
//! observable.

pub mod rocks;

pub use rocks::{ClientRecord, ObjectStore, PullData, StoreConfig, StoreError};
