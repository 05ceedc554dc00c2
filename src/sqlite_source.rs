// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed change log.
//!
//! Reads the `change_log` table written by the capture triggers. Row images
//! are stored as JSON arrays of `[column, value]` pairs so column order
//! survives the round trip.
//!
//! ```text
//! change_log
//! ├── id              INTEGER PRIMARY KEY   # shared capture sequence
//! ├── table_name      TEXT
//! ├── trigger_version INTEGER
//! ├── event_type      TEXT                  # I U D C R
//! ├── channel_id      TEXT
//! ├── source_node_id  TEXT NULL
//! ├── transaction_id  TEXT NULL
//! ├── row_data        TEXT                  # JSON
//! ├── old_data        TEXT NULL             # JSON
//! └── committed_at    INTEGER               # unix millis
//! ```

use crate::error::{Result, RouterError};
use crate::model::{ChangeRow, EventKind, RowImage, TableIdentity};
use crate::source::{BoxFuture, ChangeLogSource};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Change log reader over a SQLite database.
pub struct SqliteChangeLog {
    pool: SqlitePool,
}

fn to_i64(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Only plain identifiers may be spliced into lookup queries.
fn check_identifier(name: &str) -> Result<&str> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(name)
    } else {
        Err(RouterError::Config(format!("invalid SQL identifier '{}'", name)))
    }
}

fn decode_image(operation: &str, json: &str) -> Result<RowImage> {
    serde_json::from_str(json).map_err(|e| RouterError::change_log(operation, e.to_string()))
}

fn decode_row(row: &SqliteRow) -> Result<ChangeRow> {
    let event_code: String = row.try_get("event_type")?;
    let event = EventKind::from_code(&event_code).ok_or_else(|| {
        RouterError::change_log("read_range", format!("unknown event type '{}'", event_code))
    })?;
    let new_image: String = row.try_get("row_data")?;
    let old_image: Option<String> = row.try_get("old_data")?;
    let id: i64 = row.try_get("id")?;
    let trigger_version: i64 = row.try_get("trigger_version")?;

    Ok(ChangeRow {
        id: id.max(0) as u64,
        table: TableIdentity::new(
            row.try_get::<String, _>("table_name")?,
            trigger_version.max(0) as u32,
        ),
        event,
        channel_id: row.try_get("channel_id")?,
        source_node_id: row.try_get("source_node_id")?,
        transaction_id: row.try_get("transaction_id")?,
        new_image: decode_image("read_range", &new_image)?,
        old_image: old_image
            .as_deref()
            .map(|json| decode_image("read_range", json))
            .transpose()?,
        committed_at: millis_to_datetime(row.try_get("committed_at")?),
    })
}

impl SqliteChangeLog {
    /// Wrap an existing pool. The `change_log` table must exist.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) a change log database and ensure the schema.
    pub async fn open(path: &str) -> Result<Self> {
        info!(path = %path, "Opening SQLite change log");
        let (url, max_connections) = if path == ":memory:" {
            ("sqlite::memory:".to_string(), 1)
        } else {
            (format!("sqlite://{}?mode=rwc", path), 4)
        };
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(|e| RouterError::Config(format!("Invalid SQLite path: {}", e)))?
            .create_if_missing(true);
        // An in-memory database lives only as long as its one connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let log = Self::new(pool);
        log.ensure_schema().await?;
        Ok(log)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS change_log (
                id INTEGER PRIMARY KEY,
                table_name TEXT NOT NULL,
                trigger_version INTEGER NOT NULL DEFAULT 1,
                event_type TEXT NOT NULL,
                channel_id TEXT NOT NULL,
                source_node_id TEXT,
                transaction_id TEXT,
                row_data TEXT NOT NULL,
                old_data TEXT,
                committed_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_change_log_channel ON change_log (channel_id, id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Write a row, as the capture triggers would.
    pub async fn append(&self, row: &ChangeRow) -> Result<()> {
        let new_image = serde_json::to_string(&row.new_image)
            .map_err(|e| RouterError::Internal(e.to_string()))?;
        let old_image = row
            .old_image
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| RouterError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO change_log (
                id, table_name, trigger_version, event_type, channel_id,
                source_node_id, transaction_id, row_data, old_data, committed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(to_i64(row.id))
        .bind(&row.table.table_name)
        .bind(i64::from(row.table.trigger_version))
        .bind(row.event.code())
        .bind(&row.channel_id)
        .bind(&row.source_node_id)
        .bind(&row.transaction_id)
        .bind(new_image)
        .bind(old_image)
        .bind(row.committed_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        debug!(id = row.id, table = %row.table, "Appended change row");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn source_error(operation: &str, e: RouterError) -> RouterError {
    match e {
        RouterError::Store(inner) => RouterError::change_log(operation, inner.to_string()),
        other => other,
    }
}

impl ChangeLogSource for SqliteChangeLog {
    fn read_range(&self, start_id: u64, end_id: u64, limit: usize) -> BoxFuture<'_, Vec<ChangeRow>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r#"
                SELECT id, table_name, trigger_version, event_type, channel_id,
                       source_node_id, transaction_id, row_data, old_data, committed_at
                FROM change_log
                WHERE id >= ? AND id < ?
                ORDER BY id
                LIMIT ?
                "#,
            )
            .bind(to_i64(start_id))
            .bind(to_i64(end_id))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RouterError::change_log("read_range", e.to_string()))?;

            rows.iter()
                .map(|row| decode_row(row).map_err(|e| source_error("read_range", e)))
                .collect()
        })
    }

    fn max_id(&self) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM change_log")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| RouterError::change_log("max_id", e.to_string()))?;
            Ok(max.unwrap_or(0).max(0) as u64)
        })
    }

    fn count_after(&self, channel_id: &str, after_id: u64) -> BoxFuture<'_, u64> {
        let channel_id = channel_id.to_string();
        Box::pin(async move {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM change_log WHERE channel_id = ? AND id > ?")
                    .bind(&channel_id)
                    .bind(to_i64(after_id))
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| RouterError::change_log("count_after", e.to_string()))?;
            Ok(count.max(0) as u64)
        })
    }

    fn lookup(
        &self,
        table: &str,
        key_column: &str,
        value_column: &str,
    ) -> BoxFuture<'_, Vec<(String, String)>> {
        let query = check_identifier(table)
            .and_then(|t| Ok((t, check_identifier(key_column)?, check_identifier(value_column)?)))
            .map(|(t, k, v)| {
                format!(
                    "SELECT CAST({k} AS TEXT), CAST({v} AS TEXT) FROM {t} \
                     WHERE {k} IS NOT NULL AND {v} IS NOT NULL",
                )
            });
        Box::pin(async move {
            let query = query?;
            let pairs: Vec<(String, String)> = sqlx::query_as(&query)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| RouterError::change_log("lookup", e.to_string()))?;
            Ok(pairs)
        })
    }
}
