//! Push and pull: the two halves of the sync protocol.
//!
//! Push applies an ordered batch of client mutations exactly once despite
//! retries; pull returns every change a client is missing since its last
//! checkpoint. Both operate on the same store and meet at the cookie: a
//! pull's cookie is the store version its patch covers.
//!
//! The per-client async mutex is the protocol's only serialization point.
//! It stands in for a `SELECT ... FOR UPDATE` row lock and guarantees that
//! one client's mutation ids are consumed in submission order. Pushes from
//! different clients proceed in parallel.

use crate::buffer::WriteBuffer;
use crate::error::SyncError;
use crate::mutators::MutatorRegistry;
use crate::protocol::{format_cookie, parse_cookie, PatchOp, PullRequest, PullResponse, PushRequest};
use crate::storage::ObjectStore;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// What a push did, for logging and poke decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    /// The client's watermark after the push
    pub last_mutation_id: u64,
    /// How many mutations were newly applied (duplicates and gaps excluded)
    pub applied: usize,
}

/// The sync engine: mutation processor and diff computer over one store.
///
/// Cheap to share — transports hold it in an `Arc` and call `push`/`pull`
/// concurrently.
pub struct SyncEngine {
    store: Arc<ObjectStore>,
    mutators: MutatorRegistry,
    /// Per-client locks serializing concurrent pushes from one client
    client_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncEngine {
    /// Create an engine over a store with the given mutator registry.
    pub fn new(store: Arc<ObjectStore>, mutators: MutatorRegistry) -> Self {
        Self {
            store,
            mutators,
            client_locks: RwLock::new(HashMap::new()),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// Get or create the lock serializing pushes for one client.
    async fn client_lock(&self, client_id: &str) -> Arc<Mutex<()>> {
        // Fast path: read lock
        {
            let locks = self.client_locks.read().await;
            if let Some(lock) = locks.get(client_id) {
                return lock.clone();
            }
        }

        // Slow path: write lock to create
        let mut locks = self.client_locks.write().await;
        // Double-check after acquiring write lock
        if let Some(lock) = locks.get(client_id) {
            return lock.clone();
        }

        let lock = Arc::new(Mutex::new(()));
        locks.insert(client_id.to_string(), lock.clone());
        lock
    }

    /// Apply a batch of client mutations to a document, exactly once each.
    ///
    /// Under the client's lock: mutations at or below the watermark are
    /// duplicates and skipped silently; mutations that jump past
    /// `watermark + 1` leave a gap and are skipped with a warning (the
    /// client replays them from local history eventually); everything else
    /// is dispatched to its mutator against the write buffer. The buffer
    /// and the advanced watermark land in one atomic store commit, so
    /// re-submitting the same batch after a perceived timeout is a no-op.
    ///
    /// Unknown mutation names reject the whole request before any store
    /// read or write.
    pub async fn push(
        &self,
        document_id: &str,
        req: &PushRequest,
    ) -> Result<PushOutcome, SyncError> {
        for mutation in &req.mutations {
            if !self.mutators.contains(&mutation.name) {
                return Err(SyncError::UnknownMutator(mutation.name.clone()));
            }
        }

        let lock = self.client_lock(&req.client_id).await;
        let _guard = lock.lock().await;

        let mut last_mutation_id = self.store.last_mutation_id(&req.client_id)?;
        let mut buffer = WriteBuffer::new(&self.store, document_id);
        let mut applied = 0usize;

        for mutation in &req.mutations {
            if mutation.id <= last_mutation_id {
                debug!(
                    "client {}: mutation {} already applied, skipping",
                    req.client_id, mutation.id
                );
                continue;
            }
            if mutation.id > last_mutation_id + 1 {
                warn!(
                    "client {}: mutation {} leaves a gap above watermark {}, skipping",
                    req.client_id, mutation.id, last_mutation_id
                );
                continue;
            }

            let mutator = self
                .mutators
                .get(&mutation.name)
                .ok_or_else(|| SyncError::UnknownMutator(mutation.name.clone()))?;
            mutator.apply(&mut buffer, &mutation.args)?;

            last_mutation_id = mutation.id;
            applied += 1;
        }

        let writes = buffer.into_writes();
        self.store
            .commit(document_id, &writes, Some((&req.client_id, last_mutation_id)))?;

        debug!(
            "client {}: push applied {}/{} mutations, watermark {}",
            req.client_id,
            applied,
            req.mutations.len(),
            last_mutation_id
        );

        Ok(PushOutcome {
            last_mutation_id,
            applied,
        })
    }

    /// Compute the delta a client is missing since its checkpoint.
    ///
    /// Reads run against one store snapshot: the changed rows, the
    /// client's watermark, and the document head version are mutually
    /// consistent. Tombstoned rows become `del` operations, live rows
    /// `put` operations. Applying the patch to a replica at the request
    /// cookie yields the document state at the response cookie.
    ///
    /// Safe to call repeatedly with the same cookie — the only side effect
    /// is recording the returned checkpoint in the client registry.
    pub fn pull(
        &self,
        document_id: &str,
        req: &PullRequest,
    ) -> Result<PullResponse, SyncError> {
        let since = parse_cookie(req.cookie.as_deref())?;
        let data = self.store.pull_snapshot(document_id, &req.client_id, since)?;

        let patch = data
            .rows
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => PatchOp::Put { key, value },
                None => PatchOp::Del { key },
            })
            .collect();

        self.store
            .set_last_cookie(&req.client_id, document_id, data.head_version)?;

        debug!(
            "client {}: pull since {} -> cookie {}, watermark {}",
            req.client_id, since, data.head_version, data.last_mutation_id
        );

        Ok(PullResponse {
            cookie: format_cookie(data.head_version),
            last_mutation_id: data.last_mutation_id,
            patch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Mutation;
    use crate::storage::StoreConfig;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, SyncEngine) {
        let dir = TempDir::new().unwrap();
        let store =
            Arc::new(ObjectStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap());
        let engine = SyncEngine::new(store, MutatorRegistry::with_defaults());
        (dir, engine)
    }

    fn put_mutation(id: u64, key: &str, value: serde_json::Value) -> Mutation {
        Mutation {
            id,
            name: "put".into(),
            args: json!({"key": key, "value": value}),
        }
    }

    fn del_mutation(id: u64, key: &str) -> Mutation {
        Mutation {
            id,
            name: "del".into(),
            args: json!({"key": key}),
        }
    }

    fn push_req(client: &str, mutations: Vec<Mutation>) -> PushRequest {
        PushRequest {
            client_id: client.into(),
            mutations,
        }
    }

    fn pull_req(client: &str, cookie: Option<&str>) -> PullRequest {
        PullRequest {
            client_id: client.into(),
            cookie: cookie.map(String::from),
        }
    }

    #[tokio::test]
    async fn test_push_applies_in_order() {
        let (_dir, engine) = setup();

        let outcome = engine
            .push(
                "doc",
                &push_req(
                    "a",
                    vec![
                        put_mutation(1, "x", json!(1)),
                        put_mutation(2, "x", json!(2)),
                        put_mutation(3, "y", json!(3)),
                    ],
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome.applied, 3);
        assert_eq!(outcome.last_mutation_id, 3);
        assert_eq!(engine.store().get("doc", "x").unwrap(), Some(json!(2)));
        assert_eq!(engine.store().get("doc", "y").unwrap(), Some(json!(3)));
    }

    #[tokio::test]
    async fn test_push_is_idempotent() {
        let (_dir, engine) = setup();
        let req = push_req("a", vec![put_mutation(1, "x", json!(1))]);

        engine.push("doc", &req).await.unwrap();
        let head = engine.store().head_version("doc").unwrap();

        // Resubmit the identical batch: no-op
        let outcome = engine.push("doc", &req).await.unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.last_mutation_id, 1);
        assert_eq!(engine.store().head_version("doc").unwrap(), head);
        assert_eq!(
            engine.store().changed_since("doc", 0).unwrap(),
            vec![("x".to_string(), Some(json!(1)))]
        );
    }

    #[tokio::test]
    async fn test_duplicate_inside_batch_is_skipped() {
        let (_dir, engine) = setup();

        let outcome = engine
            .push(
                "doc",
                &push_req(
                    "a",
                    vec![
                        put_mutation(1, "x", json!("first")),
                        put_mutation(1, "x", json!("echo")),
                        put_mutation(2, "y", json!("second")),
                    ],
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome.applied, 2);
        assert_eq!(engine.store().get("doc", "x").unwrap(), Some(json!("first")));
    }

    #[tokio::test]
    async fn test_gap_is_skipped_not_fatal() {
        let (_dir, engine) = setup();

        // Client starts at mutation 5 — the gap is logged and skipped
        let outcome = engine
            .push("doc", &push_req("a", vec![put_mutation(5, "x", json!(1))]))
            .await
            .unwrap();

        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.last_mutation_id, 0);
        assert_eq!(engine.store().get("doc", "x").unwrap(), None);

        // The client eventually resubmits the full history
        let outcome = engine
            .push(
                "doc",
                &push_req(
                    "a",
                    (1..=5).map(|i| put_mutation(i, "x", json!(i))).collect(),
                ),
            )
            .await
            .unwrap();
        assert_eq!(outcome.applied, 5);
        assert_eq!(engine.store().get("doc", "x").unwrap(), Some(json!(5)));
    }

    #[tokio::test]
    async fn test_unknown_mutator_rejects_whole_push() {
        let (_dir, engine) = setup();

        let err = engine
            .push(
                "doc",
                &push_req(
                    "a",
                    vec![
                        put_mutation(1, "x", json!(1)),
                        Mutation {
                            id: 2,
                            name: "resize".into(),
                            args: json!({}),
                        },
                    ],
                ),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::UnknownMutator(_)));
        // Store untouched: nothing applied, watermark unchanged
        assert_eq!(engine.store().get("doc", "x").unwrap(), None);
        assert_eq!(engine.store().last_mutation_id("a").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_failed_mutation_aborts_whole_batch() {
        let (_dir, engine) = setup();

        let err = engine
            .push(
                "doc",
                &push_req(
                    "a",
                    vec![
                        put_mutation(1, "x", json!(1)),
                        // Malformed args for the del mutator
                        Mutation {
                            id: 2,
                            name: "del".into(),
                            args: json!({"wrong": true}),
                        },
                    ],
                ),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Decode(_)));
        // All-or-nothing: mutation 1 was not committed either
        assert_eq!(engine.store().get("doc", "x").unwrap(), None);
        assert_eq!(engine.store().last_mutation_id("a").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_same_client_pushes_serialize() {
        let (_dir, engine) = setup();
        let engine = Arc::new(engine);

        let req = push_req("a", vec![put_mutation(1, "x", json!(1))]);
        let resubmit = req.clone();
        let (r1, r2) = tokio::join!(engine.push("doc", &req), engine.push("doc", &resubmit));
        r1.unwrap();
        r2.unwrap();

        // Exactly one write happened
        assert_eq!(
            engine.store().changed_since("doc", 0).unwrap(),
            vec![("x".to_string(), Some(json!(1)))]
        );
        assert_eq!(engine.store().last_mutation_id("a").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pull_from_empty_cookie_reconstructs_state() {
        let (_dir, engine) = setup();
        engine
            .push(
                "doc",
                &push_req(
                    "a",
                    vec![
                        put_mutation(1, "x", json!(1)),
                        put_mutation(2, "y", json!(2)),
                        del_mutation(3, "y"),
                    ],
                ),
            )
            .await
            .unwrap();

        let resp = engine.pull("doc", &pull_req("b", None)).unwrap();

        assert!(resp.cookie.is_some());
        assert_eq!(resp.last_mutation_id, 0); // b never pushed
        let mut patch = resp.patch.clone();
        patch.sort_by(|l, r| l.key().cmp(r.key()));
        assert_eq!(
            patch,
            vec![
                PatchOp::Put {
                    key: "x".into(),
                    value: json!(1)
                },
                PatchOp::Del { key: "y".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_pull_is_idempotent_and_converges() {
        let (_dir, engine) = setup();
        engine
            .push("doc", &push_req("a", vec![put_mutation(1, "x", json!(1))]))
            .await
            .unwrap();

        // Same cookie twice, no intervening writes: identical responses
        let first = engine.pull("doc", &pull_req("b", None)).unwrap();
        let again = engine.pull("doc", &pull_req("b", None)).unwrap();
        assert_eq!(first, again);

        // Pulling from the returned cookie yields an empty patch
        let resp = engine
            .pull("doc", &pull_req("b", first.cookie.as_deref()))
            .unwrap();
        assert!(resp.patch.is_empty());
        assert_eq!(resp.cookie, first.cookie);
    }

    #[tokio::test]
    async fn test_pull_records_last_cookie() {
        let (_dir, engine) = setup();
        engine
            .push("doc", &push_req("a", vec![put_mutation(1, "x", json!(1))]))
            .await
            .unwrap();

        let resp = engine.pull("doc", &pull_req("b", None)).unwrap();
        let recorded = engine.store().last_cookie("b").unwrap();
        assert_eq!(format_cookie(recorded), resp.cookie);
    }

    #[tokio::test]
    async fn test_pull_rejects_garbage_cookie() {
        let (_dir, engine) = setup();
        let err = engine
            .pull("doc", &pull_req("b", Some("not-a-version")))
            .unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_pull_reports_pushers_own_watermark() {
        let (_dir, engine) = setup();
        engine
            .push(
                "doc",
                &push_req("a", vec![put_mutation(1, "x", json!(1)), put_mutation(2, "y", json!(2))]),
            )
            .await
            .unwrap();

        let resp = engine.pull("doc", &pull_req("a", None)).unwrap();
        assert_eq!(resp.last_mutation_id, 2);
    }
}
