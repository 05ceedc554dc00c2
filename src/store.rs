// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Routing state persistence.
//!
//! The store is the durability anchor: gaps, channel progress, batches and
//! the batch id sequence all live in SQLite so a restart resumes at the last
//! committed batch boundary.
//!
//! # Pass Commits
//!
//! Everything one channel pass changed is written in ONE transaction by
//! [`RoutingStore::commit_pass`]:
//!
//! ```text
//! pass: scan → route → append ──▶ commit_pass ──▶ publish READY batches
//!                                   │
//!                                   ├── channel_progress (floor, last routed id)
//!                                   ├── data_gap         (replaced for the channel)
//!                                   ├── outgoing_batch   (open + closed this pass)
//!                                   ├── batch_row
//!                                   └── batch_sequence   (per-node high-water mark)
//! ```
//!
//! A pass that fails before the commit leaves the store untouched; the next
//! pass re-reads from the committed floor and rebuilds the same batches.
//! Batches are published only after the commit, so a crash between commit
//! and publish leaves READY batches that are republished on the next sweep.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended. Writes are retried with exponential backoff up to a bounded
//! number of attempts.

use crate::batch::{Batch, BatchStatus, CloseReason};
use crate::config::StoreConfig;
use crate::error::{Result, RouterError};
use crate::gap::{DataGap, GapKind, GapStatus};
use crate::model::ChangeRow;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// SQLite integers are signed; ids past `i64::MAX` cannot be stored.
fn to_i64(value: u64) -> std::result::Result<i64, sqlx::Error> {
    i64::try_from(value).map_err(|_| {
        sqlx::Error::Encode(format!("id {} exceeds the SQLite integer range", value).into())
    })
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

fn close_reason_from_str(value: &str) -> Option<CloseReason> {
    match value {
        "full" => Some(CloseReason::Full),
        "aged" => Some(CloseReason::Aged),
        "transaction_boundary" => Some(CloseReason::TransactionBoundary),
        "lane_rotated" => Some(CloseReason::LaneRotated),
        "forced" => Some(CloseReason::Forced),
        _ => None,
    }
}

/// Persisted progress for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelProgress {
    /// Gap tracker floor.
    pub floor_id: u64,
    /// Highest id routed on the channel.
    pub last_routed_id: u64,
}

/// Everything one channel pass writes.
#[derive(Debug)]
pub struct PassCommit<'a> {
    pub channel_id: &'a str,
    pub progress: ChannelProgress,
    /// Full gap set for the channel (open, overdue and retained closed).
    pub gaps: Vec<DataGap>,
    /// Batches touched by the pass: still-open and closed this pass.
    pub batches: Vec<&'a Batch>,
    /// `(node, last allocated batch id)`.
    pub sequences: Vec<(String, u64)>,
}

/// SQLite-backed routing state.
pub struct RoutingStore {
    pool: SqlitePool,
    path: String,
}

impl RoutingStore {
    /// Open the store, creating the database and tables if needed.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Initializing routing store");

        let (url, max_connections) = if config.is_in_memory() {
            ("sqlite::memory:".to_string(), 1)
        } else {
            (format!("sqlite://{}?mode=rwc", config.sqlite_path), 4)
        };

        let mut options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| RouterError::Config(format!("Invalid SQLite path: {}", e)))?
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);
        if config.wal_mode && !config.is_in_memory() {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            path: config.sqlite_path.clone(),
        };
        store.create_schema().await?;
        Ok(store)
    }

    async fn create_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS channel_progress (
                channel_id TEXT PRIMARY KEY,
                floor_id INTEGER NOT NULL,
                last_routed_id INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS data_gap (
                channel_id TEXT NOT NULL,
                start_id INTEGER NOT NULL,
                end_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                rescans INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                closed_at INTEGER,
                PRIMARY KEY (channel_id, start_id, end_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS batch_sequence (
                node_id TEXT PRIMARY KEY,
                last_batch_id INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS outgoing_batch (
                node_id TEXT NOT NULL,
                batch_id INTEGER NOT NULL,
                channel_id TEXT NOT NULL,
                initial_load INTEGER NOT NULL,
                status TEXT NOT NULL,
                row_count INTEGER NOT NULL,
                first_id INTEGER,
                last_id INTEGER,
                created_at INTEGER NOT NULL,
                closed_at INTEGER,
                close_reason TEXT,
                published_at INTEGER,
                error_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (node_id, batch_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_outgoing_batch_status ON outgoing_batch (status)",
            r#"
            CREATE TABLE IF NOT EXISTS batch_row (
                node_id TEXT NOT NULL,
                batch_id INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                data_id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (node_id, batch_id, seq)
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Pass commit
    // ═══════════════════════════════════════════════════════════════════════════

    /// Write everything a channel pass changed, atomically.
    pub async fn commit_pass(&self, commit: &PassCommit<'_>) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("commit_pass", || write_pass(pool, commit)).await?;
        debug!(
            channel_id = %commit.channel_id,
            floor_id = commit.progress.floor_id,
            gaps = commit.gaps.len(),
            batches = commit.batches.len(),
            "Committed routing pass"
        );
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Channel state
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn load_progress(&self, channel_id: &str) -> Result<Option<ChannelProgress>> {
        let row: Option<(i64, i64)> = sqlx::query_as(
            "SELECT floor_id, last_routed_id FROM channel_progress WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(floor, last)| ChannelProgress {
            floor_id: to_u64(floor),
            last_routed_id: to_u64(last),
        }))
    }

    pub async fn load_gaps(&self, channel_id: &str) -> Result<Vec<DataGap>> {
        let rows = sqlx::query(
            r#"
            SELECT start_id, end_id, kind, status, rescans, created_at, closed_at
            FROM data_gap WHERE channel_id = ? ORDER BY start_id
            "#,
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DataGap> {
                let code: String = row.try_get("status")?;
                let status = GapStatus::from_code(&code).ok_or_else(|| {
                    RouterError::StoreMessage(format!("bad gap status '{}'", code))
                })?;
                let label: String = row.try_get("kind")?;
                let kind = GapKind::parse(&label).ok_or_else(|| {
                    RouterError::StoreMessage(format!("bad gap kind '{}'", label))
                })?;
                let rescans: i64 = row.try_get("rescans")?;
                let closed_at: Option<i64> = row.try_get("closed_at")?;
                Ok(DataGap {
                    channel_id: channel_id.to_string(),
                    start_id: to_u64(row.try_get("start_id")?),
                    end_id: to_u64(row.try_get("end_id")?),
                    kind,
                    status,
                    rescans: u32::try_from(rescans).unwrap_or(u32::MAX),
                    created_at: from_millis(row.try_get("created_at")?),
                    closed_at: closed_at.map(from_millis),
                })
            })
            .collect()
    }

    /// Open batches persisted for a channel, with their rows.
    pub async fn load_open_batches(&self, channel_id: &str) -> Result<Vec<Batch>> {
        let rows = sqlx::query(&format!(
            "{} WHERE channel_id = ? AND status IN ('{}', '{}') ORDER BY node_id, batch_id",
            BATCH_SELECT,
            BatchStatus::New.code(),
            BatchStatus::Routing.code()
        ))
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        self.decode_batches(&rows).await
    }

    /// Last allocated batch id per node.
    pub async fn load_batch_sequences(&self) -> Result<Vec<(String, u64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT node_id, MAX(last_id) FROM (
                SELECT node_id, last_batch_id AS last_id FROM batch_sequence
                UNION ALL
                SELECT node_id, MAX(batch_id) AS last_id FROM outgoing_batch GROUP BY node_id
            ) GROUP BY node_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(node, last)| (node, to_u64(last)))
            .collect())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Batches
    // ═══════════════════════════════════════════════════════════════════════════

    pub async fn load_batch(&self, node_id: &str, batch_id: u64) -> Result<Option<Batch>> {
        let rows = sqlx::query(&format!("{} WHERE node_id = ? AND batch_id = ?", BATCH_SELECT))
            .bind(node_id)
            .bind(to_i64(batch_id)?)
            .fetch_all(&self.pool)
            .await?;
        Ok(self.decode_batches(&rows).await?.into_iter().next())
    }

    /// Batches due for (re)transmission: ERROR, READY never published, or
    /// READY published before `stale_before`.
    pub async fn batches_to_publish(&self, stale_before: DateTime<Utc>) -> Result<Vec<Batch>> {
        let rows = sqlx::query(&format!(
            r#"{} WHERE status = '{}'
               OR (status = '{}' AND (published_at IS NULL OR published_at < ?))
               ORDER BY node_id, batch_id"#,
            BATCH_SELECT,
            BatchStatus::Error.code(),
            BatchStatus::Ready.code(),
        ))
        .bind(to_millis(stale_before))
        .fetch_all(&self.pool)
        .await?;
        self.decode_batches(&rows).await
    }

    /// READY batches published before `stale_before` (acknowledgment overdue).
    pub async fn unacknowledged_before(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<(String, u64)>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT node_id, batch_id FROM outgoing_batch
            WHERE status = ? AND published_at IS NOT NULL AND published_at < ?
            ORDER BY node_id, batch_id
            "#,
        )
        .bind(BatchStatus::Ready.code())
        .bind(to_millis(stale_before))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(node, id)| (node, to_u64(id)))
            .collect())
    }

    /// Set a closed batch's status. Returns false if no closed batch matches
    /// (unknown, or still open and never published).
    pub async fn update_batch_status(
        &self,
        node_id: &str,
        batch_id: u64,
        status: BatchStatus,
    ) -> Result<bool> {
        let pool = &self.pool;
        let bump_errors = i64::from(status == BatchStatus::Error);
        let result = execute_with_retry("update_batch_status", || async move {
            sqlx::query(
                r#"
                UPDATE outgoing_batch
                SET status = ?, error_count = error_count + ?
                WHERE node_id = ? AND batch_id = ? AND status NOT IN (?, ?)
                "#,
            )
            .bind(status.code())
            .bind(bump_errors)
            .bind(node_id)
            .bind(to_i64(batch_id)?)
            .bind(BatchStatus::New.code())
            .bind(BatchStatus::Routing.code())
            .execute(pool)
            .await
        })
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record that batches were handed to the sink.
    pub async fn mark_published(&self, batches: &[(String, u64)], at: DateTime<Utc>) -> Result<()> {
        if batches.is_empty() {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("mark_published", || async move {
            let mut tx = pool.begin().await?;
            for (node_id, batch_id) in batches {
                sqlx::query(
                    r#"
                    UPDATE outgoing_batch SET status = ?, published_at = ?
                    WHERE node_id = ? AND batch_id = ? AND status IN (?, ?)
                    "#,
                )
                .bind(BatchStatus::Ready.code())
                .bind(to_millis(at))
                .bind(node_id)
                .bind(to_i64(*batch_id)?)
                .bind(BatchStatus::Ready.code())
                .bind(BatchStatus::Error.code())
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await?;
        Ok(())
    }

    /// Batch counts by status (for health and metrics).
    pub async fn batch_counts(&self) -> Result<HashMap<BatchStatus, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM outgoing_batch GROUP BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(code, count)| BatchStatus::from_code(&code).map(|s| (s, to_u64(count))))
            .collect())
    }

    async fn decode_batches(&self, headers: &[SqliteRow]) -> Result<Vec<Batch>> {
        let mut batches = Vec::with_capacity(headers.len());
        for header in headers {
            let mut batch = decode_batch_header(header)?;
            batch.rows = self.load_batch_rows(&batch.node_id, batch.batch_id).await?;
            batches.push(batch);
        }
        Ok(batches)
    }

    async fn load_batch_rows(&self, node_id: &str, batch_id: u64) -> Result<Vec<ChangeRow>> {
        let payloads: Vec<(String,)> = sqlx::query_as(
            "SELECT payload FROM batch_row WHERE node_id = ? AND batch_id = ? ORDER BY seq",
        )
        .bind(node_id)
        .bind(to_i64(batch_id)?)
        .fetch_all(&self.pool)
        .await?;
        payloads
            .into_iter()
            .map(|(json,)| {
                serde_json::from_str(&json).map_err(|e| {
                    RouterError::StoreMessage(format!(
                        "corrupt row in batch {}/{}: {}",
                        node_id, batch_id, e
                    ))
                })
            })
            .collect()
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Lifecycle
    // ═══════════════════════════════════════════════════════════════════════════

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        if self.path == ":memory:" {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Routing store closed");
    }
}

const BATCH_SELECT: &str = r#"
    SELECT node_id, batch_id, channel_id, initial_load, status, created_at,
           closed_at, close_reason, published_at, error_count
    FROM outgoing_batch"#;

fn decode_batch_header(row: &SqliteRow) -> Result<Batch> {
    let code: String = row.try_get("status")?;
    let status = BatchStatus::from_code(&code)
        .ok_or_else(|| RouterError::StoreMessage(format!("bad batch status '{}'", code)))?;
    let closed_at: Option<i64> = row.try_get("closed_at")?;
    let published_at: Option<i64> = row.try_get("published_at")?;
    let close_reason: Option<String> = row.try_get("close_reason")?;
    let error_count: i64 = row.try_get("error_count")?;
    let initial_load: i64 = row.try_get("initial_load")?;

    Ok(Batch {
        batch_id: to_u64(row.try_get("batch_id")?),
        node_id: row.try_get("node_id")?,
        channel_id: row.try_get("channel_id")?,
        initial_load: initial_load != 0,
        status,
        rows: Vec::new(),
        created_at: from_millis(row.try_get("created_at")?),
        closed_at: closed_at.map(from_millis),
        close_reason: close_reason.as_deref().and_then(close_reason_from_str),
        published_at: published_at.map(from_millis),
        error_count: u32::try_from(error_count).unwrap_or(u32::MAX),
    })
}

async fn write_pass(
    pool: &SqlitePool,
    commit: &PassCommit<'_>,
) -> std::result::Result<(), sqlx::Error> {
    let now = to_millis(Utc::now());
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO channel_progress (channel_id, floor_id, last_routed_id, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(channel_id) DO UPDATE SET
            floor_id = excluded.floor_id,
            last_routed_id = excluded.last_routed_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(commit.channel_id)
    .bind(to_i64(commit.progress.floor_id)?)
    .bind(to_i64(commit.progress.last_routed_id)?)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM data_gap WHERE channel_id = ?")
        .bind(commit.channel_id)
        .execute(&mut *tx)
        .await?;
    for gap in &commit.gaps {
        sqlx::query(
            r#"
            INSERT INTO data_gap (channel_id, start_id, end_id, kind, status, rescans, created_at, closed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(commit.channel_id)
        .bind(to_i64(gap.start_id)?)
        .bind(to_i64(gap.end_id)?)
        .bind(gap.kind.as_str())
        .bind(gap.status.code())
        .bind(i64::from(gap.rescans))
        .bind(to_millis(gap.created_at))
        .bind(gap.closed_at.map(to_millis))
        .execute(&mut *tx)
        .await?;
    }

    for batch in &commit.batches {
        write_batch(&mut tx, batch).await?;
    }

    for (node_id, last_batch_id) in &commit.sequences {
        sqlx::query(
            r#"
            INSERT INTO batch_sequence (node_id, last_batch_id) VALUES (?, ?)
            ON CONFLICT(node_id) DO UPDATE SET
                last_batch_id = MAX(last_batch_id, excluded.last_batch_id)
            "#,
        )
        .bind(node_id)
        .bind(to_i64(*last_batch_id)?)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await
}

async fn write_batch(
    tx: &mut Transaction<'_, Sqlite>,
    batch: &Batch,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO outgoing_batch (
            node_id, batch_id, channel_id, initial_load, status, row_count, first_id,
            last_id, created_at, closed_at, close_reason, published_at, error_count
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(node_id, batch_id) DO UPDATE SET
            status = excluded.status,
            row_count = excluded.row_count,
            first_id = excluded.first_id,
            last_id = excluded.last_id,
            closed_at = excluded.closed_at,
            close_reason = excluded.close_reason
        "#,
    )
    .bind(&batch.node_id)
    .bind(to_i64(batch.batch_id)?)
    .bind(&batch.channel_id)
    .bind(i64::from(batch.initial_load))
    .bind(batch.status.code())
    .bind(i64::try_from(batch.len()).unwrap_or(i64::MAX))
    .bind(batch.first_id().map(to_i64).transpose()?)
    .bind(batch.last_id().map(to_i64).transpose()?)
    .bind(to_millis(batch.created_at))
    .bind(batch.closed_at.map(to_millis))
    .bind(batch.close_reason.map(|r| r.as_str()))
    .bind(batch.published_at.map(to_millis))
    .bind(i64::from(batch.error_count))
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM batch_row WHERE node_id = ? AND batch_id = ?")
        .bind(&batch.node_id)
        .bind(to_i64(batch.batch_id)?)
        .execute(&mut **tx)
        .await?;

    for (seq, row) in batch.rows.iter().enumerate() {
        let payload = serde_json::to_string(row)
            .map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
        sqlx::query(
            "INSERT INTO batch_row (node_id, batch_id, seq, data_id, payload) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&batch.node_id)
        .bind(to_i64(batch.batch_id)?)
        .bind(i64::try_from(seq).unwrap_or(i64::MAX))
        .bind(to_i64(row.id)?)
        .bind(payload)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}
