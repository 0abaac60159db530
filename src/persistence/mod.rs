//! Document stores backing consortia, computations, and run results
//!
//! Stores hold JSON documents keyed by `_id` with CouchDB-style `_rev`
//! revisions: a save must carry the current revision of the document it
//! replaces, otherwise it fails with [`StoreError::Conflict`]. Every write is
//! published on a live change feed.

pub mod registry;

#[cfg(feature = "sqlite")]
pub mod store;

pub use registry::{StoreLifecycle, StoreRegistry};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

pub(crate) const CHANGE_FEED_CAPACITY: usize = 1024;

/// Error types for store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document {id} not found in {store}")]
    NotFound { store: String, id: String },

    #[error("document update conflict on {id} in {store}")]
    Conflict { store: String, id: String },

    #[error("documents in {store} must be JSON objects")]
    InvalidDocument { store: String },

    #[error("store {0} has been destroyed")]
    Destroyed(String),

    #[error("change feed for {store} dropped {skipped} events")]
    Lagged { store: String, skipped: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Acknowledgement of a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveResponse {
    pub id: String,
    pub rev: String,
}

/// One entry of a store's change feed
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub id: String,
    pub seq: u64,
    pub deleted: bool,
    /// Full document, including `_id` and `_rev`
    pub doc: Value,
}

/// Live subscription to a store's changes, starting from "now"
pub struct ChangeFeed {
    store: String,
    rx: broadcast::Receiver<ChangeEvent>,
}

impl ChangeFeed {
    pub fn new(store: impl Into<String>, rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self {
            store: store.into(),
            rx,
        }
    }

    pub fn store(&self) -> &str {
        &self.store
    }

    /// Next change; `None` once the store is gone
    pub async fn next(&mut self) -> Option<Result<ChangeEvent, StoreError>> {
        match self.rx.recv().await {
            Ok(change) => Some(Ok(change)),
            Err(broadcast::error::RecvError::Closed) => None,
            Err(broadcast::error::RecvError::Lagged(skipped)) => Some(Err(StoreError::Lagged {
                store: self.store.clone(),
                skipped,
            })),
        }
    }
}

/// Trait for document store backends
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store name, e.g. `local-consortium-<id>`
    fn name(&self) -> &str;

    /// Fetch a live document
    async fn get(&self, id: &str) -> Result<Value, StoreError>;

    /// Create or replace a document; `_rev` must match the stored revision
    async fn save(&self, doc: Value) -> Result<SaveResponse, StoreError>;

    /// Delete a document at revision `rev`
    async fn remove(&self, id: &str, rev: &str) -> Result<SaveResponse, StoreError>;

    /// Every live document, ordered by `_id`
    async fn all(&self) -> Result<Vec<Value>, StoreError>;

    /// Subscribe to subsequent changes
    fn changes(&self) -> ChangeFeed;

    /// Delete all documents and stop the change feed
    async fn destroy(&self) -> Result<(), StoreError>;

    /// Stop background work without deleting data
    fn close(&self) {}

    /// Resolve once the store caught up with its replication source
    async fn wait_synced(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Fetch a document, mapping "not found" to `None`
    async fn get_opt(&self, id: &str) -> Result<Option<Value>, StoreError> {
        match self.get(id).await {
            Ok(doc) => Ok(Some(doc)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Documents whose top-level fields equal every field of `selector`
    async fn find(&self, selector: &Map<String, Value>) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|doc| selector.iter().all(|(key, expected)| doc.get(key) == Some(expected)))
            .collect())
    }
}

/// Next revision string after `current`, e.g. `3-9f8e7d6c`
pub fn next_rev(current: Option<&str>) -> String {
    let generation = current
        .and_then(|rev| rev.split('-').next())
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", generation + 1, &suffix[..16])
}

/// Split a document into its id and object body, generating an id if absent
pub(crate) fn prepare_document(store: &str, doc: Value) -> Result<(String, Option<String>, Map<String, Value>), StoreError> {
    let Value::Object(mut body) = doc else {
        return Err(StoreError::InvalidDocument {
            store: store.to_string(),
        });
    };
    let id = match body.get("_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => uuid::Uuid::new_v4().simple().to_string(),
    };
    let rev = body.get("_rev").and_then(Value::as_str).map(str::to_string);
    body.insert("_id".to_string(), Value::String(id.clone()));
    Ok((id, rev, body))
}

/// Whether a write carrying `incoming` may replace a document at `stored`
pub(crate) fn revision_matches(stored: Option<(&str, bool)>, incoming: Option<&str>) -> bool {
    match (stored, incoming) {
        (None, None) => true,
        (None, Some(_)) => false,
        (Some((_, true)), None) => true,
        (Some((rev, _)), Some(incoming)) => rev == incoming,
        (Some((_, false)), None) => false,
    }
}

#[derive(Debug, Clone)]
struct StoredDocument {
    rev: String,
    deleted: bool,
    body: Value,
}

#[derive(Debug, Default)]
struct MemoryState {
    docs: BTreeMap<String, StoredDocument>,
    seq: u64,
}

/// In-memory store (for tests, simulations, or ephemeral nodes)
pub struct InMemoryStore {
    name: String,
    state: RwLock<MemoryState>,
    changes: broadcast::Sender<ChangeEvent>,
    destroyed: AtomicBool,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            name: name.into(),
            state: RwLock::new(MemoryState::default()),
            changes,
            destroyed: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StoreError::Destroyed(self.name.clone()));
        }
        Ok(())
    }

    fn write_locked(
        &self,
        state: &mut MemoryState,
        id: String,
        incoming_rev: Option<&str>,
        mut body: Map<String, Value>,
        deleted: bool,
    ) -> Result<SaveResponse, StoreError> {
        let stored = state.docs.get(&id);
        if !revision_matches(stored.map(|d| (d.rev.as_str(), d.deleted)), incoming_rev) {
            return Err(StoreError::Conflict {
                store: self.name.clone(),
                id,
            });
        }

        let rev = next_rev(stored.map(|d| d.rev.as_str()));
        body.insert("_rev".to_string(), Value::String(rev.clone()));
        let body = Value::Object(body);

        state.seq += 1;
        state.docs.insert(
            id.clone(),
            StoredDocument {
                rev: rev.clone(),
                deleted,
                body: body.clone(),
            },
        );

        // no receivers is not an error
        let _ = self.changes.send(ChangeEvent {
            id: id.clone(),
            seq: state.seq,
            deleted,
            doc: body,
        });

        debug!("{}: wrote {} at {}", self.name, id, rev);
        Ok(SaveResponse { id, rev })
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<Value, StoreError> {
        self.ensure_live()?;
        let state = self.state.read().await;
        state
            .docs
            .get(id)
            .filter(|d| !d.deleted)
            .map(|d| d.body.clone())
            .ok_or_else(|| StoreError::NotFound {
                store: self.name.clone(),
                id: id.to_string(),
            })
    }

    async fn save(&self, doc: Value) -> Result<SaveResponse, StoreError> {
        self.ensure_live()?;
        let (id, rev, body) = prepare_document(&self.name, doc)?;
        let mut state = self.state.write().await;
        self.write_locked(&mut state, id, rev.as_deref(), body, false)
    }

    async fn remove(&self, id: &str, rev: &str) -> Result<SaveResponse, StoreError> {
        self.ensure_live()?;
        let mut state = self.state.write().await;
        match state.docs.get(id) {
            Some(doc) if !doc.deleted => {}
            _ => {
                return Err(StoreError::NotFound {
                    store: self.name.clone(),
                    id: id.to_string(),
                })
            }
        }
        let mut body = Map::new();
        body.insert("_id".to_string(), Value::String(id.to_string()));
        body.insert("_deleted".to_string(), Value::Bool(true));
        self.write_locked(&mut state, id.to_string(), Some(rev), body, true)
    }

    async fn all(&self) -> Result<Vec<Value>, StoreError> {
        self.ensure_live()?;
        let state = self.state.read().await;
        Ok(state
            .docs
            .values()
            .filter(|d| !d.deleted)
            .map(|d| d.body.clone())
            .collect())
    }

    fn changes(&self) -> ChangeFeed {
        ChangeFeed::new(self.name.clone(), self.changes.subscribe())
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.destroyed.store(true, Ordering::SeqCst);
        let mut state = self.state.write().await;
        state.docs.clear();
        debug!("{}: destroyed", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_assigns_revisions() {
        let store = InMemoryStore::new("consortia");
        let first = store.save(json!({ "_id": "c1", "label": "a" })).await.unwrap();
        assert!(first.rev.starts_with("1-"));

        let doc = store.get("c1").await.unwrap();
        assert_eq!(doc["_rev"], first.rev.as_str());

        let mut updated = doc.clone();
        updated["label"] = json!("b");
        let second = store.save(updated).await.unwrap();
        assert!(second.rev.starts_with("2-"));
        assert_eq!(store.get("c1").await.unwrap()["label"], "b");
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let store = InMemoryStore::new("results");
        store.save(json!({ "_id": "r1" })).await.unwrap();
        let stale = store.get("r1").await.unwrap();
        store.save(stale.clone()).await.unwrap();

        let err = store.save(stale).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let err = store.save(json!({ "_id": "r1" })).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "missing _rev on existing doc");

        let err = store.save(json!({ "_id": "new", "_rev": "1-x" })).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }), "_rev on unknown doc");
    }

    #[tokio::test]
    async fn test_remove_and_recreate() {
        let store = InMemoryStore::new("results");
        let saved = store.save(json!({ "_id": "r1" })).await.unwrap();
        store.remove("r1", &saved.rev).await.unwrap();

        assert!(store.get("r1").await.unwrap_err().is_not_found());
        assert!(store.all().await.unwrap().is_empty());
        assert_eq!(store.get_opt("r1").await.unwrap(), None);

        let recreated = store.save(json!({ "_id": "r1" })).await.unwrap();
        assert!(recreated.rev.starts_with("3-"));
    }

    #[tokio::test]
    async fn test_all_and_find() {
        let store = InMemoryStore::new("results");
        store.save(json!({ "_id": "b", "kind": "x" })).await.unwrap();
        store.save(json!({ "_id": "a", "kind": "y" })).await.unwrap();
        store.save(json!({ "_id": "c", "kind": "x" })).await.unwrap();

        let ids: Vec<String> = store
            .all()
            .await
            .unwrap()
            .iter()
            .map(|d| d["_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let mut selector = Map::new();
        selector.insert("kind".to_string(), json!("x"));
        assert_eq!(store.find(&selector).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_change_feed_starts_now() {
        let store = InMemoryStore::new("results");
        store.save(json!({ "_id": "before" })).await.unwrap();

        let mut feed = store.changes();
        let saved = store.save(json!({ "_id": "after" })).await.unwrap();
        store.remove("after", &saved.rev).await.unwrap();

        let change = feed.next().await.unwrap().unwrap();
        assert_eq!(change.id, "after");
        assert!(!change.deleted);
        assert_eq!(change.doc["_rev"], saved.rev.as_str());

        let deletion = feed.next().await.unwrap().unwrap();
        assert!(deletion.deleted);
        assert!(deletion.seq > change.seq);
    }

    #[tokio::test]
    async fn test_destroyed_store_rejects_calls() {
        let store = InMemoryStore::new("gone");
        store.save(json!({ "_id": "x" })).await.unwrap();
        store.destroy().await.unwrap();
        assert!(matches!(store.all().await, Err(StoreError::Destroyed(_))));
    }

    #[test]
    fn test_next_rev() {
        assert!(next_rev(None).starts_with("1-"));
        assert!(next_rev(Some("41-abc")).starts_with("42-"));
    }

    #[tokio::test]
    async fn test_non_object_rejected() {
        let store = InMemoryStore::new("s");
        assert!(matches!(
            store.save(json!([1, 2])).await,
            Err(StoreError::InvalidDocument { .. })
        ));
    }
}
