//! Live-connection registry and poke fan-out.
//!
//! One registry per server process maps client ids to their live
//! connections. A successful push broadcasts a content-free poke to every
//! connection on the same document — including the originator, whose
//! re-pull is harmless because pull is idempotent. The poke never carries
//! state; it only means "something changed, go pull".
//!
//! At most one live connection exists per client id: a new registration
//! evicts the previous one (last-connection-wins). Fan-out is
//! fire-and-forget; unreachable connections are pruned lazily when a send
//! fails.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Content-free "something changed" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poke;

/// Statistics for monitoring fan-out health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub pokes_sent: u64,
    pub pokes_dropped: u64,
    pub connections_evicted: u64,
    pub active_connections: usize,
}

/// Atomic counters — no lock on the fan-out hot path.
#[derive(Default)]
struct AtomicBroadcastStats {
    pokes_sent: AtomicU64,
    pokes_dropped: AtomicU64,
    connections_evicted: AtomicU64,
}

/// One live connection.
struct Connection {
    /// Distinguishes this connection from a later one for the same client
    connection_id: Uuid,
    document_id: String,
    sender: mpsc::UnboundedSender<Poke>,
}

/// Process-wide registry of live client connections.
///
/// Owned by the server, shared as an `Arc`. All mutation happens through
/// connect/disconnect events and lazy pruning — there is no ambient
/// global state.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
    stats: AtomicBroadcastStats,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client's live connection on a document.
    ///
    /// Returns this connection's id and the receiver for its pokes. Any
    /// prior connection for the same client is evicted: its sender is
    /// dropped, which closes its poke channel and lets its task shut the
    /// socket down.
    pub async fn register(
        &self,
        client_id: &str,
        document_id: &str,
    ) -> (Uuid, mpsc::UnboundedReceiver<Poke>) {
        let connection_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut connections = self.connections.write().await;
        let evicted = connections.insert(
            client_id.to_string(),
            Connection {
                connection_id,
                document_id: document_id.to_string(),
                sender,
            },
        );

        if evicted.is_some() {
            self.stats.connections_evicted.fetch_add(1, Ordering::Relaxed);
            debug!("client {client_id}: evicting previous connection");
        }

        (connection_id, receiver)
    }

    /// Remove a connection, but only the generation that registered it.
    ///
    /// A disconnecting task passes the id it was given so it can never
    /// tear down a newer connection that has already replaced it.
    pub async fn unregister(&self, client_id: &str, connection_id: Uuid) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get(client_id) {
            if conn.connection_id == connection_id {
                connections.remove(client_id);
            }
        }
    }

    /// Fan a poke out to every connection on the document.
    ///
    /// Fire-and-forget: send failures mark the connection dead and it is
    /// pruned before returning. Returns the number of pokes delivered.
    pub async fn poke(&self, document_id: &str) -> usize {
        let mut delivered = 0usize;
        let mut dead: Vec<(String, Uuid)> = Vec::new();

        {
            let connections = self.connections.read().await;
            for (client_id, conn) in connections.iter() {
                if conn.document_id != document_id {
                    continue;
                }
                if conn.sender.send(Poke).is_ok() {
                    delivered += 1;
                } else {
                    dead.push((client_id.clone(), conn.connection_id));
                }
            }
        }

        self.stats
            .pokes_sent
            .fetch_add(delivered as u64, Ordering::Relaxed);

        if !dead.is_empty() {
            self.stats
                .pokes_dropped
                .fetch_add(dead.len() as u64, Ordering::Relaxed);
            let mut connections = self.connections.write().await;
            for (client_id, connection_id) in dead {
                warn!("client {client_id}: pruning stale connection");
                if let Some(conn) = connections.get(&client_id) {
                    if conn.connection_id == connection_id {
                        connections.remove(&client_id);
                    }
                }
            }
        }

        delivered
    }

    /// Whether a client currently has a live connection.
    pub async fn is_connected(&self, client_id: &str) -> bool {
        self.connections.read().await.contains_key(client_id)
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Get fan-out statistics.
    pub async fn stats(&self) -> BroadcastStats {
        let connections = self.connections.read().await;
        BroadcastStats {
            pokes_sent: self.stats.pokes_sent.load(Ordering::Relaxed),
            pokes_dropped: self.stats.pokes_dropped.load(Ordering::Relaxed),
            connections_evicted: self.stats.connections_evicted.load(Ordering::Relaxed),
            active_connections: connections.len(),
        }
    }
}
