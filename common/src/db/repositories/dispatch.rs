// Dispatch ledger repository backed by PostgreSQL
//
// Uniqueness of both leases and records is enforced by the database, so the
// check-and-set stays correct with several engine instances running.

use super::queries::dispatch_queries::{KEY_PREDICATE, SELECT_ALL_COLUMNS};
use crate::db::DbPool;
use crate::errors::{DatabaseError, LedgerError};
use crate::ledger::{ClaimOutcome, DispatchLedger};
use crate::models::{DispatchKey, DispatchRecord, DispatchTrigger, MilestoneKind};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

/// Repository for dispatch records and claims
pub struct DispatchRepository {
    pool: DbPool,
}

impl DispatchRepository {
    /// Create a new DispatchRepository
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Find the record for a key
    #[instrument(skip(self), fields(key = %key))]
    pub async fn find_by_key(
        &self,
        key: &DispatchKey,
    ) -> Result<Option<DispatchRecord>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM alert_dispatches WHERE {}",
            SELECT_ALL_COLUMNS, KEY_PREDICATE
        );

        let row = bind_key(sqlx::query(&query), key)
            .fetch_optional(self.pool.pool())
            .await?;

        row.map(|row| record_from_row(&row)).transpose()
    }

    /// List every record sent to a user, newest first
    #[instrument(skip(self))]
    pub async fn find_by_user(&self, user_id: i64) -> Result<Vec<DispatchRecord>, DatabaseError> {
        let query = format!(
            "SELECT {} FROM alert_dispatches WHERE user_id = $1 ORDER BY sent_at DESC",
            SELECT_ALL_COLUMNS
        );

        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(self.pool.pool())
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn record_exists(&self, key: &DispatchKey) -> Result<bool, DatabaseError> {
        let query = format!(
            "SELECT EXISTS (SELECT 1 FROM alert_dispatches WHERE {}) AS sent",
            KEY_PREDICATE
        );

        let row = bind_key(sqlx::query(&query), key)
            .fetch_one(self.pool.pool())
            .await?;

        Ok(row.try_get("sent")?)
    }

    async fn delete_claim(&self, key: &DispatchKey, owner: Uuid) -> Result<(), DatabaseError> {
        let query = format!(
            "DELETE FROM alert_dispatch_claims WHERE {} AND owner = $6",
            KEY_PREDICATE
        );

        bind_key(sqlx::query(&query), key)
            .bind(owner)
            .execute(self.pool.pool())
            .await?;

        Ok(())
    }
}

#[async_trait]
impl DispatchLedger for DispatchRepository {
    #[instrument(skip(self), fields(key = %key))]
    async fn has_sent(&self, key: &DispatchKey) -> Result<bool, LedgerError> {
        Ok(self.record_exists(key).await?)
    }

    #[instrument(skip(self, now, ttl), fields(key = %key))]
    async fn try_claim(
        &self,
        key: &DispatchKey,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ClaimOutcome, LedgerError> {
        if self.record_exists(key).await? {
            return Ok(ClaimOutcome::AlreadySent);
        }

        // Insert the lease, or take it over if the previous holder let it expire
        let claimed = bind_key(
            sqlx::query(
                r#"
                INSERT INTO alert_dispatch_claims (
                    user_id, exam_id, milestone_kind, offset_days, milestone_date,
                    owner, expires_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (user_id, exam_id, milestone_kind, offset_days, milestone_date)
                DO UPDATE SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE alert_dispatch_claims.expires_at <= $8
                   OR alert_dispatch_claims.owner = EXCLUDED.owner
                RETURNING owner
                "#,
            ),
            key,
        )
        .bind(owner)
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(DatabaseError::from)?;

        if claimed.is_none() {
            tracing::debug!("Dispatch claim held by another worker");
            return Ok(ClaimOutcome::InFlight);
        }

        // A concurrent holder may have recorded and dropped its lease between
        // the existence check and the insert
        if self.record_exists(key).await? {
            self.delete_claim(key, owner).await?;
            return Ok(ClaimOutcome::AlreadySent);
        }

        tracing::debug!(owner = %owner, "Dispatch claim acquired");
        Ok(ClaimOutcome::Claimed)
    }

    #[instrument(skip(self, record), fields(key = %record.key, trigger = %record.trigger))]
    async fn record_sent(&self, record: &DispatchRecord) -> Result<(), LedgerError> {
        let mut tx = self
            .pool
            .pool()
            .begin()
            .await
            .map_err(DatabaseError::from)?;

        sqlx::query(
            r#"
            INSERT INTO alert_dispatches (
                id, user_id, exam_id, milestone_kind, offset_days,
                milestone_date, recipient, trigger_source, sent_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.key.user_id)
        .bind(record.key.exam_id)
        .bind(record.key.kind.as_str())
        .bind(record.key.offset_days as i32)
        .bind(record.key.milestone_date)
        .bind(&record.recipient)
        .bind(record.trigger.to_string())
        .bind(record.sent_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| match DatabaseError::from(e) {
            DatabaseError::DuplicateKey(_) => LedgerError::Conflict(record.key.to_string()),
            other => LedgerError::from(other),
        })?;

        let query = format!("DELETE FROM alert_dispatch_claims WHERE {}", KEY_PREDICATE);
        bind_key(sqlx::query(&query), &record.key)
            .execute(&mut *tx)
            .await
            .map_err(DatabaseError::from)?;

        tx.commit().await.map_err(DatabaseError::from)?;

        tracing::info!(record_id = %record.id, "Dispatch recorded");
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn release(&self, key: &DispatchKey, owner: Uuid) -> Result<(), LedgerError> {
        Ok(self.delete_claim(key, owner).await?)
    }

    #[instrument(skip(self))]
    async fn prune(&self, before: NaiveDate) -> Result<u64, LedgerError> {
        let records = sqlx::query("DELETE FROM alert_dispatches WHERE milestone_date < $1")
            .bind(before)
            .execute(self.pool.pool())
            .await
            .map_err(DatabaseError::from)?;

        sqlx::query("DELETE FROM alert_dispatch_claims WHERE milestone_date < $1")
            .bind(before)
            .execute(self.pool.pool())
            .await
            .map_err(DatabaseError::from)?;

        tracing::debug!(pruned = records.rows_affected(), "Pruned dispatch records");
        Ok(records.rows_affected())
    }
}

fn bind_key<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    key: &DispatchKey,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(key.user_id)
        .bind(key.exam_id)
        .bind(key.kind.as_str())
        .bind(key.offset_days as i32)
        .bind(key.milestone_date)
}

fn record_from_row(row: &PgRow) -> Result<DispatchRecord, DatabaseError> {
    let kind: String = row.try_get("milestone_kind")?;
    let kind: MilestoneKind = kind.parse().map_err(DatabaseError::QueryFailed)?;
    let trigger: String = row.try_get("trigger_source")?;
    let trigger: DispatchTrigger = trigger.parse().map_err(DatabaseError::QueryFailed)?;
    let offset_days: i32 = row.try_get("offset_days")?;

    Ok(DispatchRecord {
        id: row.try_get("id")?,
        key: DispatchKey {
            user_id: row.try_get("user_id")?,
            exam_id: row.try_get("exam_id")?,
            kind,
            offset_days: u32::try_from(offset_days)
                .map_err(|e| DatabaseError::QueryFailed(format!("Invalid offset_days: {}", e)))?,
            milestone_date: row.try_get("milestone_date")?,
        },
        recipient: row.try_get("recipient")?,
        trigger,
        sent_at: row.try_get("sent_at")?,
    })
}
