//! Audit reporter — append-only stream of decisions and outcomes.
//!
//! [`AuditReporter::record`] enqueues and returns; the admission path never
//! blocks on slow downstream consumers. A writer task drains the queue into
//! the durable store and fans events out to live subscribers. Subscribers
//! restart from a cursor: the store's row ID is the cursor, so a dashboard
//! that reconnects resumes exactly where it left off, in decision order.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, warn};

use crate::gate::ledger::SessionLedger;
use crate::types::{AuditEvent, SessionSummary};

/// Page size when replaying backlog from the store.
const BACKLOG_PAGE: u32 = 256;

/// Capacity of the live fan-out channel. A subscriber that falls further
/// behind than this resyncs from the store instead of losing events.
const LIVE_CAPACITY: usize = 1024;

/// Durable, append-only storage for audit events.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Append one event and return its cursor.
    async fn append(&self, event: &AuditEvent) -> anyhow::Result<i64>;

    /// Events with cursor strictly greater than `cursor`, oldest first.
    async fn events_after(&self, cursor: i64, limit: u32)
        -> anyhow::Result<Vec<(i64, AuditEvent)>>;

    /// Cheap reachability probe for health reporting.
    async fn ping(&self) -> anyhow::Result<()>;
}

/// SQLite-backed audit store.
pub struct SqliteAuditStore {
    pool: SqlitePool,
}

impl SqliteAuditStore {
    /// Open (or create) the audit database at the given path and apply the
    /// schema migration.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the migration
    /// fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create audit db directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open audit db at {}", path.display()))?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub async fn open_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::new().in_memory(true);
        // One connection only: each sqlite :memory: connection is its own
        // database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory audit db")?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
        let migration_sql = include_str!("../../migrations/001_audit_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(pool)
            .await
            .context("failed to apply audit schema migration")?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    async fn append(&self, event: &AuditEvent) -> anyhow::Result<i64> {
        let payload = serde_json::to_string(event).context("failed to encode audit event")?;
        let result = sqlx::query(
            "INSERT INTO audit_events (timestamp, session_id, agent_id, kind, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(event.timestamp.to_rfc3339())
        .bind(&event.session_id)
        .bind(&event.agent_id)
        .bind(event.kind.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("failed to append audit event")?;
        Ok(result.last_insert_rowid())
    }

    async fn events_after(
        &self,
        cursor: i64,
        limit: u32,
    ) -> anyhow::Result<Vec<(i64, AuditEvent)>> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT id, payload FROM audit_events WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        )
        .bind(cursor)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .context("failed to read audit backlog")?;

        let mut events = Vec::with_capacity(rows.len());
        for (id, payload) in rows {
            let event: AuditEvent = serde_json::from_str(&payload)
                .with_context(|| format!("corrupt audit payload at cursor {id}"))?;
            events.push((id, event));
        }
        Ok(events)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("audit store unreachable")?;
        Ok(())
    }
}

/// In-memory audit store for unit tests.
#[derive(Default)]
pub struct MemoryAuditStore {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    async fn append(&self, event: &AuditEvent) -> anyhow::Result<i64> {
        let mut events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event.clone());
        i64::try_from(events.len()).context("audit store overflow")
    }

    async fn events_after(
        &self,
        cursor: i64,
        limit: u32,
    ) -> anyhow::Result<Vec<(i64, AuditEvent)>> {
        let events = match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let start = usize::try_from(cursor.max(0)).unwrap_or(usize::MAX);
        Ok(events
            .iter()
            .enumerate()
            .skip(start)
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .map(|(idx, event)| {
                let seq = i64::try_from(idx.saturating_add(1)).unwrap_or(i64::MAX);
                (seq, event.clone())
            })
            .collect())
    }

    async fn ping(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handle for recording, streaming, and summarizing audit events.
///
/// Cheap to clone; all clones feed the same writer task.
#[derive(Clone)]
pub struct AuditReporter {
    tx: mpsc::UnboundedSender<AuditEvent>,
    live: broadcast::Sender<(i64, AuditEvent)>,
    store: Arc<dyn AuditStore>,
    ledger: Arc<SessionLedger>,
}

impl AuditReporter {
    /// Start the writer task and return the reporter plus the task handle.
    ///
    /// The writer drains the queue into `store` and fans out to live
    /// subscribers; it exits when every reporter clone has been dropped,
    /// which is the graceful-shutdown flush point.
    pub fn spawn(
        store: Arc<dyn AuditStore>,
        ledger: Arc<SessionLedger>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        let (live, _) = broadcast::channel(LIVE_CAPACITY);

        let writer_store = Arc::clone(&store);
        let writer_live = live.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match writer_store.append(&event).await {
                    Ok(seq) => {
                        // No subscribers is fine; send only fails then.
                        let _ = writer_live.send((seq, event));
                    }
                    Err(e) => error!(error = %e, "failed to persist audit event"),
                }
            }
            debug!("audit writer drained and stopped");
        });

        (
            Self {
                tx,
                live,
                store,
                ledger,
            },
            handle,
        )
    }

    /// Reporter that drops every event. For unit tests of components that
    /// only need a recording sink.
    pub fn discard() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (live, _) = broadcast::channel(1);
        Self {
            tx,
            live,
            store: Arc::new(MemoryAuditStore::new()),
            ledger: Arc::new(SessionLedger::new()),
        }
    }

    /// Enqueue an event. Never blocks; returns immediately.
    pub fn record(&self, event: AuditEvent) {
        if self.tx.send(event).is_err() {
            // Only happens during shutdown (writer already drained) or in
            // discard-mode tests.
            debug!("audit writer gone; event dropped");
        }
    }

    /// Infinite, cursor-restartable event stream.
    ///
    /// Replays the store backlog after `cursor`, then follows live events,
    /// in decision order and without duplicates. A subscriber that lags
    /// beyond the fan-out buffer resyncs from the store instead of
    /// skipping events.
    pub fn stream_from(&self, cursor: i64) -> UnboundedReceiverStream<AuditEvent> {
        let store = Arc::clone(&self.store);
        // Subscribe before reading the backlog so no event can fall in the
        // gap between the two.
        let mut live_rx = self.live.subscribe();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut last = cursor;
            if !replay_backlog(store.as_ref(), &mut last, &out_tx).await {
                return;
            }
            loop {
                match live_rx.recv().await {
                    Ok((seq, event)) => {
                        if seq > last {
                            last = seq;
                            if out_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "audit subscriber lagged; resyncing from store");
                        if !replay_backlog(store.as_ref(), &mut last, &out_tx).await {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        UnboundedReceiverStream::new(out_rx)
    }

    /// Operator-facing aggregate for one session.
    pub fn summarize(&self, session_id: &str) -> Option<SessionSummary> {
        self.ledger.summary(session_id)
    }

    /// Reachability of the durable store, for health reporting.
    pub async fn store_healthy(&self) -> bool {
        self.store.ping().await.is_ok()
    }
}

/// Page through the store from `last`, forwarding into `out`.
///
/// Returns `false` when the subscriber went away or the store failed.
async fn replay_backlog(
    store: &dyn AuditStore,
    last: &mut i64,
    out: &mpsc::UnboundedSender<AuditEvent>,
) -> bool {
    loop {
        let batch = match store.events_after(*last, BACKLOG_PAGE).await {
            Ok(batch) => batch,
            Err(e) => {
                error!(error = %e, "audit backlog read failed; stream ends");
                return false;
            }
        };
        if batch.is_empty() {
            return true;
        }
        for (seq, event) in batch {
            *last = seq;
            if out.send(event).is_err() {
                return false;
            }
        }
    }
}
