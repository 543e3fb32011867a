//! # ripple-server — transports for the ripple sync engine
//!
//! Serves the sync protocol over two listeners sharing one engine:
//!
//! ```text
//! ┌─────────────┐  POST /push, /pull   ┌─────────────┐
//! │ HTTP client │ ◄──────────────────► │    axum     │
//! └─────────────┘                      └──────┬──────┘
//!                                             │
//! ┌─────────────┐  /ws/d/{doc}         ┌──────┴──────┐      ┌────────────┐
//! │  WS client  │ ◄──────────────────► │ SyncServer  │ ───► │ SyncEngine │
//! └──────┬──────┘   pokes, push/pull   └──────┬──────┘      └────────────┘
//!        ▲                                    │
//!        └───────────── poke ─────────────────┘
//!             (ConnectionRegistry fan-out)
//! ```
//!
//! A push arriving on either transport pokes every live connection on the
//! document; poked clients pull (again, on either transport) to converge.
//!
//! ## Modules
//!
//! - [`broadcast`] — live-connection registry and poke fan-out
//! - [`server`] — WebSocket accept loop and per-connection protocol
//! - [`http`] — axum push/pull endpoints

pub mod broadcast;
pub mod http;
pub mod server;

// Re-exports for convenience
pub use broadcast::{BroadcastStats, ConnectionRegistry, Poke};
pub use http::{build_router, AppState};
pub use server::{ServerConfig, SyncServer};
