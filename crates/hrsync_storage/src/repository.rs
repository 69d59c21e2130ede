use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hrsync_contract::QueuePayload;
use hrsync_transfer::{QueueStore, StoreError, TransferRecord, TransferStatus};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

#[derive(Debug, Clone)]
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptRow {
    pub record_id: String,
    pub reason: String,
}

#[derive(Debug)]
pub struct QueueScan<P> {
    pub records: Vec<TransferRecord<P>>,
    pub corrupt: Vec<CorruptRow>,
}

#[derive(Debug, Clone, FromRow)]
struct QueueRow {
    record_id: String,
    seq: i64,
    priority: i64,
    status: String,
    attempts: i64,
    last_error: Option<String>,
    payload_json: String,
    enqueued_at: String,
    updated_at: String,
    last_attempt_at: Option<String>,
}

impl SqliteQueueStore {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true);

        // Every connection to :memory: is its own database.
        let in_memory = uri.contains(":memory:");
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }
        info!("transfer queue schema ready");
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM transfer_queue")
            .fetch_one(&self.pool)
            .await
            .context("count queued transfers")
    }

    pub async fn quarantined_count(&self) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM transfer_quarantine")
            .fetch_one(&self.pool)
            .await
            .context("count quarantined transfers")
    }

    /// Reads the queue without touching it. Rows that cannot be decoded are
    /// reported next to the good ones instead of failing the whole read.
    pub async fn scan<P>(&self) -> Result<QueueScan<P>>
    where
        P: DeserializeOwned,
    {
        let rows = self.fetch_rows().await?;
        let mut scan = QueueScan {
            records: Vec::with_capacity(rows.len()),
            corrupt: Vec::new(),
        };
        for row in rows {
            match row_to_record::<P>(row) {
                Ok(record) => scan.records.push(record),
                Err(StoreError::Corrupt { record_id, reason }) => {
                    scan.corrupt.push(CorruptRow { record_id, reason })
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(scan)
    }

    async fn quarantine(&self, row: &CorruptRow) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin quarantine")?;
        sqlx::query(
            "INSERT OR REPLACE INTO transfer_quarantine(record_id, reason, quarantined_at, seq, priority, status, attempts, last_error, payload_json, enqueued_at, updated_at, last_attempt_at) SELECT record_id, ?, ?, seq, priority, status, attempts, last_error, payload_json, enqueued_at, updated_at, last_attempt_at FROM transfer_queue WHERE record_id = ?",
        )
        .bind(&row.reason)
        .bind(Utc::now().to_rfc3339())
        .bind(&row.record_id)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("quarantine transfer {}", row.record_id))?;
        sqlx::query("DELETE FROM transfer_queue WHERE record_id = ?")
            .bind(&row.record_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("delete quarantined transfer {}", row.record_id))?;
        tx.commit().await.context("commit quarantine")?;
        Ok(())
    }

    async fn complete_row(&self, record_id: &str, receipt_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.context("begin completion")?;
        sqlx::query("DELETE FROM transfer_queue WHERE record_id = ?")
            .bind(record_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("delete completed transfer {record_id}"))?;
        sqlx::query(
            "INSERT OR REPLACE INTO transfer_receipts(record_id, receipt_id, completed_at) VALUES (?, ?, ?)",
        )
        .bind(record_id)
        .bind(receipt_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .with_context(|| format!("record receipt for {record_id}"))?;
        tx.commit().await.context("commit completion")?;
        Ok(())
    }

    async fn has_receipt(&self, record_id: &str) -> Result<bool> {
        let found = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM transfer_receipts WHERE record_id = ?",
        )
        .bind(record_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("look up receipt for {record_id}"))?;
        Ok(found > 0)
    }

    async fn fetch_rows(&self) -> Result<Vec<QueueRow>> {
        sqlx::query_as::<_, QueueRow>(
            "SELECT record_id, seq, priority, status, attempts, last_error, payload_json, enqueued_at, updated_at, last_attempt_at FROM transfer_queue ORDER BY priority DESC, seq ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("query transfer queue")
    }

    async fn write_row(&self, row: &QueueRow) -> Result<()> {
        sqlx::query(
            "INSERT INTO transfer_queue(record_id, seq, priority, status, attempts, last_error, payload_json, enqueued_at, updated_at, last_attempt_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(record_id) DO UPDATE SET priority = excluded.priority, status = excluded.status, attempts = excluded.attempts, last_error = excluded.last_error, payload_json = excluded.payload_json, updated_at = excluded.updated_at, last_attempt_at = excluded.last_attempt_at",
        )
        .bind(&row.record_id)
        .bind(row.seq)
        .bind(row.priority)
        .bind(&row.status)
        .bind(row.attempts)
        .bind(&row.last_error)
        .bind(&row.payload_json)
        .bind(&row.enqueued_at)
        .bind(&row.updated_at)
        .bind(&row.last_attempt_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert transfer {}", row.record_id))?;
        Ok(())
    }

    async fn delete_row(&self, record_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transfer_queue WHERE record_id = ?")
            .bind(record_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete transfer {record_id}"))?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl<P> QueueStore<P> for SqliteQueueStore
where
    P: QueuePayload + DeserializeOwned,
{
    async fn load(&self) -> Result<Vec<TransferRecord<P>>, StoreError> {
        let scan = self.scan::<P>().await.map_err(unavailable)?;
        for row in &scan.corrupt {
            warn!(record_id = %row.record_id, reason = %row.reason, "quarantining corrupt transfer");
            self.quarantine(row).await.map_err(unavailable)?;
        }
        Ok(scan.records)
    }

    async fn upsert(&self, record: &TransferRecord<P>) -> Result<(), StoreError> {
        let row = record_to_row(record)?;
        self.write_row(&row).await.map_err(unavailable)
    }

    async fn remove(&self, record_id: &str) -> Result<(), StoreError> {
        let deleted = self.delete_row(record_id).await.map_err(unavailable)?;
        if !deleted {
            debug!(record_id, "transfer already absent from store");
        }
        Ok(())
    }

    async fn complete(&self, record_id: &str, receipt_id: &str) -> Result<(), StoreError> {
        self.complete_row(record_id, receipt_id)
            .await
            .map_err(unavailable)
    }

    async fn was_completed(&self, record_id: &str) -> Result<bool, StoreError> {
        self.has_receipt(record_id).await.map_err(unavailable)
    }
}

fn unavailable(error: anyhow::Error) -> StoreError {
    StoreError::Unavailable(format!("{error:#}"))
}

fn record_to_row<P>(record: &TransferRecord<P>) -> Result<QueueRow, StoreError>
where
    P: QueuePayload,
{
    let seq = i64::try_from(record.seq).map_err(|_| StoreError::Corrupt {
        record_id: record.id.clone(),
        reason: format!("sequence {} out of range", record.seq),
    })?;

    Ok(QueueRow {
        record_id: record.id.clone(),
        seq,
        priority: i64::from(record.priority),
        status: record.status.as_str().to_string(),
        attempts: i64::from(record.attempts),
        last_error: record.last_error.clone(),
        payload_json: serde_json::to_string(&record.payload)?,
        enqueued_at: record.enqueued_at.to_rfc3339(),
        updated_at: record.updated_at.to_rfc3339(),
        last_attempt_at: record.last_attempt_at.map(|at| at.to_rfc3339()),
    })
}

fn row_to_record<P>(row: QueueRow) -> Result<TransferRecord<P>, StoreError>
where
    P: DeserializeOwned,
{
    let corrupt = |reason: String| StoreError::Corrupt {
        record_id: row.record_id.clone(),
        reason,
    };

    let status = TransferStatus::parse(&row.status)
        .ok_or_else(|| corrupt(format!("unknown status {:?}", row.status)))?;
    let seq = u64::try_from(row.seq).map_err(|_| corrupt(format!("negative seq {}", row.seq)))?;
    let priority = i32::try_from(row.priority)
        .map_err(|_| corrupt(format!("priority {} out of range", row.priority)))?;
    let attempts = u32::try_from(row.attempts)
        .map_err(|_| corrupt(format!("attempts {} out of range", row.attempts)))?;
    let payload = serde_json::from_str(&row.payload_json)
        .map_err(|err| corrupt(format!("payload: {err}")))?;
    let enqueued_at = parse_timestamp(&row.enqueued_at).map_err(&corrupt)?;
    let updated_at = parse_timestamp(&row.updated_at).map_err(&corrupt)?;
    let last_attempt_at = row
        .last_attempt_at
        .as_deref()
        .map(parse_timestamp)
        .transpose()
        .map_err(&corrupt)?;

    Ok(TransferRecord {
        id: row.record_id.clone(),
        seq,
        priority,
        payload,
        status,
        attempts,
        last_error: row.last_error.clone(),
        enqueued_at,
        updated_at,
        last_attempt_at,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| format!("timestamp {raw:?}: {err}"))
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
