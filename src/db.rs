use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::borrow::Cow;
use tracing::debug;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::repository::QueueRepository;
use crate::types::{
    CancelOutcome, DeliveryStatus, EnqueueOutcome, LastError, QueueCounts, QueueEntry,
    QueueStatus,
};

const CLAIM_CANDIDATES: i64 = 8;
const CLAIM_ROUNDS: usize = 3;

const ENTRY_COLUMNS: &str = "id, tenant_id, recipient_phone, payload, priority, status, attempts, max_attempts, \
     scheduled_at, created_at, updated_at, dedupe_key, provider_message_id, last_error, reclaim_count, \
     delivery_status, delivery_updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    Sqlite,
    Postgres,
}

pub fn db_kind_from_url(url: &str) -> DbKind {
    let lower = url.to_lowercase();
    if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
        DbKind::Postgres
    } else {
        DbKind::Sqlite
    }
}

pub fn rewrite_sql(sql: &str, kind: DbKind) -> Cow<'_, str> {
    match kind {
        DbKind::Sqlite => Cow::Borrowed(sql),
        DbKind::Postgres => {
            let mut out = String::with_capacity(sql.len() + 8);
            let mut idx = 1;
            for ch in sql.chars() {
                if ch == '?' {
                    out.push('$');
                    out.push_str(&idx.to_string());
                    idx += 1;
                } else {
                    out.push(ch);
                }
            }
            Cow::Owned(out)
        }
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, RepositoryError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| RepositoryError::Corrupt(format!("timestamp out of range: {ms}")))
}

fn datetime_to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn corrupt(err: impl std::fmt::Display) -> RepositoryError {
    RepositoryError::Corrupt(err.to_string())
}

pub async fn init_db(pool: &AnyPool, kind: DbKind) -> anyhow::Result<()> {
    let stmts = vec![
        r#"CREATE TABLE IF NOT EXISTS queue_entries (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            recipient_phone TEXT NOT NULL,
            payload TEXT NOT NULL,
            priority BIGINT NOT NULL,
            status TEXT NOT NULL,
            attempts BIGINT NOT NULL,
            max_attempts BIGINT NOT NULL,
            scheduled_at BIGINT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL,
            dedupe_key TEXT,
            provider_message_id TEXT,
            last_error TEXT,
            reclaim_count BIGINT NOT NULL,
            delivery_status TEXT,
            delivery_updated_at BIGINT
        )"#,
        r#"CREATE INDEX IF NOT EXISTS idx_queue_ready ON queue_entries(status, priority, scheduled_at)"#,
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_queue_dedupe ON queue_entries(dedupe_key)"#,
        r#"CREATE INDEX IF NOT EXISTS idx_queue_provider_id ON queue_entries(provider_message_id)"#,
    ];

    for stmt in stmts {
        let sql = rewrite_sql(stmt, kind);
        sqlx::query(sql.as_ref()).execute(pool).await?;
    }
    Ok(())
}

fn row_to_entry(row: &AnyRow) -> Result<QueueEntry, RepositoryError> {
    let id: String = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    let status: String = row.try_get("status")?;
    let last_error: Option<String> = row.try_get("last_error")?;
    let delivery_status: Option<String> = row.try_get("delivery_status")?;
    let delivery_updated_at: Option<i64> = row.try_get("delivery_updated_at")?;

    Ok(QueueEntry {
        id: Uuid::parse_str(&id).map_err(corrupt)?,
        tenant_id: row.try_get("tenant_id")?,
        recipient_phone: row.try_get("recipient_phone")?,
        payload: serde_json::from_str(&payload).map_err(corrupt)?,
        priority: row.try_get::<i64, _>("priority")? as i32,
        status: status.parse::<QueueStatus>().map_err(corrupt)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
        scheduled_at: millis_to_datetime(row.try_get("scheduled_at")?)?,
        created_at: millis_to_datetime(row.try_get("created_at")?)?,
        updated_at: millis_to_datetime(row.try_get("updated_at")?)?,
        dedupe_key: row.try_get("dedupe_key")?,
        provider_message_id: row.try_get("provider_message_id")?,
        last_error: last_error
            .map(|raw| serde_json::from_str::<LastError>(&raw))
            .transpose()
            .map_err(corrupt)?,
        reclaim_count: row.try_get::<i64, _>("reclaim_count")? as u32,
        delivery_status: delivery_status
            .map(|raw| raw.parse::<DeliveryStatus>())
            .transpose()
            .map_err(corrupt)?,
        delivery_updated_at: delivery_updated_at.map(millis_to_datetime).transpose()?,
    })
}

#[derive(Clone)]
pub struct SqlQueueRepository {
    pool: AnyPool,
    kind: DbKind,
}

impl SqlQueueRepository {
    pub fn new(pool: AnyPool, kind: DbKind) -> Self {
        Self { pool, kind }
    }

    pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<Self> {
        sqlx::any::install_default_drivers();
        let kind = db_kind_from_url(url);
        let mut options = AnyPoolOptions::new().max_connections(max_connections);
        if url.contains(":memory:") {
            // an in-memory database lives only as long as its connection
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(url).await?;
        init_db(&pool, kind).await?;
        Ok(Self { pool, kind })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    fn sql<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        rewrite_sql(sql, self.kind)
    }

    async fn fetch(&self, id: Uuid) -> Result<Option<QueueEntry>, RepositoryError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?");
        let row = sqlx::query(self.sql(&sql).as_ref())
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_entry).transpose()
    }

    async fn conflict_or_missing(&self, id: Uuid) -> RepositoryError {
        match self.fetch(id).await {
            Ok(Some(_)) => RepositoryError::ClaimConflict(id),
            Ok(None) => RepositoryError::NotFound(id),
            Err(err) => err,
        }
    }

    async fn try_claim(&self, id: &str, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            self.sql("UPDATE queue_entries SET status = 'processing', updated_at = ? WHERE id = ? AND status = 'pending'")
                .as_ref(),
        )
        .bind(datetime_to_millis(now))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl QueueRepository for SqlQueueRepository {
    async fn enqueue(&self, entry: QueueEntry) -> Result<EnqueueOutcome, RepositoryError> {
        let sql = format!(
            "INSERT INTO queue_entries ({ENTRY_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (dedupe_key) DO NOTHING"
        );
        let payload = serde_json::to_string(&entry.payload).map_err(corrupt)?;
        let last_error = entry
            .last_error
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(corrupt)?;
        let result = sqlx::query(self.sql(&sql).as_ref())
            .bind(entry.id.to_string())
            .bind(&entry.tenant_id)
            .bind(&entry.recipient_phone)
            .bind(payload)
            .bind(entry.priority as i64)
            .bind(entry.status.as_str())
            .bind(entry.attempts as i64)
            .bind(entry.max_attempts as i64)
            .bind(datetime_to_millis(entry.scheduled_at))
            .bind(datetime_to_millis(entry.created_at))
            .bind(datetime_to_millis(entry.updated_at))
            .bind(entry.dedupe_key.as_deref())
            .bind(entry.provider_message_id.as_deref())
            .bind(last_error)
            .bind(entry.reclaim_count as i64)
            .bind(entry.delivery_status.map(|s| s.as_str()))
            .bind(entry.delivery_updated_at.map(datetime_to_millis))
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 1 {
            return Ok(EnqueueOutcome::Inserted(entry.id));
        }

        let key = entry
            .dedupe_key
            .as_deref()
            .ok_or_else(|| RepositoryError::Corrupt(format!("insert of {} ignored", entry.id)))?;
        let existing: String = sqlx::query_scalar(self.sql("SELECT id FROM queue_entries WHERE dedupe_key = ?").as_ref())
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(EnqueueOutcome::Duplicate(Uuid::parse_str(&existing).map_err(corrupt)?))
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<QueueEntry>, RepositoryError> {
        for _ in 0..CLAIM_ROUNDS {
            let candidates: Vec<String> = sqlx::query_scalar(
                self.sql(
                    r#"SELECT id FROM queue_entries
                       WHERE status = 'pending' AND scheduled_at <= ?
                       ORDER BY priority DESC, scheduled_at ASC, created_at ASC
                       LIMIT ?"#,
                )
                .as_ref(),
            )
            .bind(datetime_to_millis(now))
            .bind(CLAIM_CANDIDATES)
            .fetch_all(&self.pool)
            .await?;

            if candidates.is_empty() {
                return Ok(None);
            }

            for id in candidates {
                if self.try_claim(&id, now).await? {
                    let id = Uuid::parse_str(&id).map_err(corrupt)?;
                    return self.fetch(id).await;
                }
                debug!(entry_id = %id, "claim lost to another worker");
            }
        }
        Ok(None)
    }

    async fn mark_sent(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        provider_message_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            self.sql(
                r#"UPDATE queue_entries
                   SET status = 'sent', provider_message_id = ?, last_error = NULL, updated_at = ?,
                       delivery_status = 'sent', delivery_updated_at = ?
                   WHERE id = ? AND status = 'processing' AND updated_at = ?"#,
            )
            .as_ref(),
        )
        .bind(provider_message_id)
        .bind(datetime_to_millis(now))
        .bind(datetime_to_millis(now))
        .bind(id.to_string())
        .bind(datetime_to_millis(claimed_at))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.conflict_or_missing(id).await);
        }
        Ok(())
    }

    async fn mark_retry(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        attempts: u32,
        scheduled_at: DateTime<Utc>,
        last_error: &LastError,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let last_error = serde_json::to_string(last_error).map_err(corrupt)?;
        let result = sqlx::query(
            self.sql(
                r#"UPDATE queue_entries
                   SET status = 'pending', attempts = ?, scheduled_at = ?, last_error = ?, updated_at = ?
                   WHERE id = ? AND status = 'processing' AND updated_at = ?"#,
            )
            .as_ref(),
        )
        .bind(attempts as i64)
        .bind(datetime_to_millis(scheduled_at))
        .bind(last_error)
        .bind(datetime_to_millis(now))
        .bind(id.to_string())
        .bind(datetime_to_millis(claimed_at))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.conflict_or_missing(id).await);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        claimed_at: DateTime<Utc>,
        attempts: u32,
        last_error: &LastError,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let last_error = serde_json::to_string(last_error).map_err(corrupt)?;
        let result = sqlx::query(
            self.sql(
                r#"UPDATE queue_entries
                   SET status = 'failed', attempts = ?, last_error = ?, updated_at = ?
                   WHERE id = ? AND status = 'processing' AND updated_at = ?"#,
            )
            .as_ref(),
        )
        .bind(attempts as i64)
        .bind(last_error)
        .bind(datetime_to_millis(now))
        .bind(id.to_string())
        .bind(datetime_to_millis(claimed_at))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.conflict_or_missing(id).await);
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntry>, RepositoryError> {
        let cutoff = datetime_to_millis(older_than);
        let stale: Vec<String> = sqlx::query_scalar(
            self.sql("SELECT id FROM queue_entries WHERE status = 'processing' AND updated_at < ?")
                .as_ref(),
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut reclaimed = Vec::with_capacity(stale.len());
        for id in stale {
            let result = sqlx::query(
                self.sql(
                    r#"UPDATE queue_entries
                       SET status = 'pending', updated_at = ?, reclaim_count = reclaim_count + 1
                       WHERE id = ? AND status = 'processing' AND updated_at < ?"#,
                )
                .as_ref(),
            )
            .bind(datetime_to_millis(now))
            .bind(&id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                let id = Uuid::parse_str(&id).map_err(corrupt)?;
                if let Some(entry) = self.fetch(id).await? {
                    reclaimed.push(entry);
                }
            }
        }
        Ok(reclaimed)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<QueueEntry>, RepositoryError> {
        self.fetch(id).await
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<CancelOutcome, RepositoryError> {
        let last_error = serde_json::to_string(&LastError::cancelled()).map_err(corrupt)?;
        let result = sqlx::query(
            self.sql(
                r#"UPDATE queue_entries
                   SET status = 'failed', last_error = ?, updated_at = ?
                   WHERE id = ? AND status = 'pending'"#,
            )
            .as_ref(),
        )
        .bind(last_error)
        .bind(datetime_to_millis(now))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(CancelOutcome::Cancelled);
        }

        Ok(match self.fetch(id).await? {
            None => CancelOutcome::NotFound,
            // pending again means it was claimed and retried between our read and write
            Some(entry) => match entry.status {
                QueueStatus::Processing | QueueStatus::Pending => CancelOutcome::InFlight,
                QueueStatus::Sent | QueueStatus::Failed => CancelOutcome::AlreadyFinal,
            },
        })
    }

    async fn record_delivery_status(
        &self,
        provider_message_id: &str,
        status: DeliveryStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let row = sqlx::query(
            self.sql("SELECT delivery_status FROM queue_entries WHERE provider_message_id = ?")
                .as_ref(),
        )
        .bind(provider_message_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let current: Option<String> = row.try_get("delivery_status")?;
        let current = current
            .as_deref()
            .map(str::parse::<DeliveryStatus>)
            .transpose()
            .map_err(corrupt)?;
        if !DeliveryStatus::can_advance_to(current, status) {
            return Ok(false);
        }

        let result = match current {
            Some(previous) => {
                sqlx::query(
                    self.sql(
                        r#"UPDATE queue_entries SET delivery_status = ?, delivery_updated_at = ?
                           WHERE provider_message_id = ? AND delivery_status = ?"#,
                    )
                    .as_ref(),
                )
                .bind(status.as_str())
                .bind(datetime_to_millis(at))
                .bind(provider_message_id)
                .bind(previous.as_str())
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    self.sql(
                        r#"UPDATE queue_entries SET delivery_status = ?, delivery_updated_at = ?
                           WHERE provider_message_id = ? AND delivery_status IS NULL"#,
                    )
                    .as_ref(),
                )
                .bind(status.as_str())
                .bind(datetime_to_millis(at))
                .bind(provider_message_id)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn counts(&self) -> Result<QueueCounts, RepositoryError> {
        let rows = sqlx::query("SELECT status, COUNT(1) AS n FROM queue_entries GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n = row.try_get::<i64, _>("n")? as u64;
            match status.parse::<QueueStatus>().map_err(corrupt)? {
                QueueStatus::Pending => counts.pending = n,
                QueueStatus::Processing => counts.processing = n,
                QueueStatus::Sent => counts.sent = n,
                QueueStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}
