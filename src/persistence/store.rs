//! SQLite-based document store
//!
//! All stores of a node share one `documents` table, partitioned by store
//! name. Every write takes the next global sequence number; a background task
//! polls for rows past the last sequence it has seen and publishes them on the
//! change feed, which also picks up writes made by other processes sharing the
//! same file.

use crate::persistence::{
    next_rev, prepare_document, revision_matches, ChangeEvent, ChangeFeed, DocumentStore,
    SaveResponse, StoreError, CHANGE_FEED_CAPACITY,
};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Open (or create) a SQLite database for document stores
pub async fn connect(db_path: &Path) -> Result<SqlitePool, StoreError> {
    if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
    }
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    init(&pool).await?;
    Ok(pool)
}

/// Private in-memory database, mostly for tests
pub async fn connect_in_memory() -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    // a second connection would see a different database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    init(&pool).await?;
    Ok(pool)
}

/// Initialize database schema
async fn init(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            store TEXT NOT NULL,
            id TEXT NOT NULL,
            rev TEXT NOT NULL,
            seq INTEGER NOT NULL,
            deleted INTEGER NOT NULL DEFAULT 0,
            body TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (store, id)
        );

        CREATE INDEX IF NOT EXISTS idx_store_seq ON documents(store, seq);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// SQLite document store
pub struct SqliteStore {
    name: String,
    pool: SqlitePool,
    changes: broadcast::Sender<ChangeEvent>,
    poller: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl SqliteStore {
    /// Open the store `name`; its change feed starts at the current sequence
    pub async fn open(
        pool: SqlitePool,
        name: impl Into<String>,
        poll_interval: Duration,
    ) -> Result<Self, StoreError> {
        let name = name.into();
        let since: i64 = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM documents")
            .fetch_one(&pool)
            .await?
            .get("seq");

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let poller = tokio::spawn(poll_changes(
            pool.clone(),
            name.clone(),
            since,
            poll_interval,
            changes.clone(),
        ));

        debug!("{}: opened at seq {}", name, since);
        Ok(Self {
            name,
            pool,
            changes,
            poller: Mutex::new(Some(poller)),
            destroyed: AtomicBool::new(false),
        })
    }

    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StoreError::Destroyed(self.name.clone()));
        }
        Ok(())
    }

    fn stop_polling(&self) {
        let handle = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    async fn write(
        &self,
        id: String,
        incoming_rev: Option<&str>,
        mut body: Map<String, Value>,
        deleted: bool,
    ) -> Result<SaveResponse, StoreError> {
        let mut tx = self.pool.begin().await?;

        let stored = sqlx::query("SELECT rev, deleted FROM documents WHERE store = ?1 AND id = ?2")
            .bind(&self.name)
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| (row.get::<String, _>("rev"), row.get::<bool, _>("deleted")));

        if deleted && !matches!(stored, Some((_, false))) {
            return Err(StoreError::NotFound {
                store: self.name.clone(),
                id,
            });
        }
        let current = stored.as_ref().map(|(rev, del)| (rev.as_str(), *del));
        if !revision_matches(current, incoming_rev) {
            return Err(StoreError::Conflict {
                store: self.name.clone(),
                id,
            });
        }

        let rev = next_rev(current.map(|(rev, _)| rev));
        body.insert("_rev".to_string(), Value::String(rev.clone()));
        let body = serde_json::to_string(&Value::Object(body))?;

        let seq: i64 = sqlx::query("SELECT COALESCE(MAX(seq), 0) + 1 AS seq FROM documents")
            .fetch_one(&mut *tx)
            .await?
            .get("seq");

        sqlx::query(
            r#"
            INSERT INTO documents (store, id, rev, seq, deleted, body, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
            ON CONFLICT(store, id) DO UPDATE SET
                rev = excluded.rev,
                seq = excluded.seq,
                deleted = excluded.deleted,
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.name)
        .bind(&id)
        .bind(&rev)
        .bind(seq)
        .bind(deleted)
        .bind(body)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("{}: wrote {} at {} (seq {})", self.name, id, rev, seq);
        Ok(SaveResponse { id, rev })
    }
}

async fn poll_changes(
    pool: SqlitePool,
    store: String,
    mut since: i64,
    poll_interval: Duration,
    changes: broadcast::Sender<ChangeEvent>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    loop {
        ticker.tick().await;

        let rows = match sqlx::query(
            r#"
            SELECT id, seq, deleted, body
            FROM documents
            WHERE store = ?1 AND seq > ?2
            ORDER BY seq ASC
            "#,
        )
        .bind(&store)
        .bind(since)
        .fetch_all(&pool)
        .await
        {
            Ok(rows) => rows,
            Err(e) => {
                warn!("{}: change poll failed: {}", store, e);
                continue;
            }
        };

        for row in rows {
            let seq: i64 = row.get("seq");
            since = since.max(seq);
            let doc = match serde_json::from_str::<Value>(&row.get::<String, _>("body")) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!("{}: skipping unreadable row: {}", store, e);
                    continue;
                }
            };
            let _ = changes.send(ChangeEvent {
                id: row.get("id"),
                seq: seq as u64,
                deleted: row.get("deleted"),
                doc,
            });
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for SqliteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str) -> Result<Value, StoreError> {
        self.ensure_live()?;
        let row = sqlx::query(
            "SELECT body FROM documents WHERE store = ?1 AND id = ?2 AND deleted = 0",
        )
        .bind(&self.name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(serde_json::from_str(&row.get::<String, _>("body"))?),
            None => Err(StoreError::NotFound {
                store: self.name.clone(),
                id: id.to_string(),
            }),
        }
    }

    async fn save(&self, doc: Value) -> Result<SaveResponse, StoreError> {
        self.ensure_live()?;
        let (id, rev, body) = prepare_document(&self.name, doc)?;
        self.write(id, rev.as_deref(), body, false).await
    }

    async fn remove(&self, id: &str, rev: &str) -> Result<SaveResponse, StoreError> {
        self.ensure_live()?;
        let mut body = Map::new();
        body.insert("_id".to_string(), Value::String(id.to_string()));
        body.insert("_deleted".to_string(), Value::Bool(true));
        self.write(id.to_string(), Some(rev), body, true).await
    }

    async fn all(&self) -> Result<Vec<Value>, StoreError> {
        self.ensure_live()?;
        let rows = sqlx::query(
            "SELECT body FROM documents WHERE store = ?1 AND deleted = 0 ORDER BY id ASC",
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Ok(serde_json::from_str(&row.get::<String, _>("body"))?))
            .collect()
    }

    fn changes(&self) -> ChangeFeed {
        ChangeFeed::new(self.name.clone(), self.changes.subscribe())
    }

    async fn destroy(&self) -> Result<(), StoreError> {
        self.destroyed.store(true, Ordering::SeqCst);
        self.stop_polling();
        sqlx::query("DELETE FROM documents WHERE store = ?1")
            .bind(&self.name)
            .execute(&self.pool)
            .await?;
        debug!("{}: destroyed", self.name);
        Ok(())
    }

    fn close(&self) {
        self.stop_polling();
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        self.stop_polling();
    }
}
