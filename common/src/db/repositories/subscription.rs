// Subscription repository: read-only view of tracked (user, exam) pairs

use super::queries::subscription_queries::{FROM_TRACKED_PAIRS, SELECT_TRACKED_PAIR_COLUMNS};
use crate::db::DbPool;
use crate::errors::{DatabaseError, ResolverError};
use crate::models::{Exam, TrackedPair};
use crate::resolver::SubscriptionResolver;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::instrument;

/// Repository reading subscriptions joined with users and exams
pub struct SubscriptionRepository {
    pool: DbPool,
    page_size: i64,
}

impl SubscriptionRepository {
    /// Create a new SubscriptionRepository fetching `page_size` rows per query
    pub fn new(pool: DbPool, page_size: i64) -> Self {
        Self {
            pool,
            page_size: page_size.max(1),
        }
    }

    /// Fetch one page of tracked pairs strictly after the (user, exam) cursor
    #[instrument(skip(self))]
    pub async fn find_page_after(
        &self,
        after_user_id: i64,
        after_exam_id: i64,
    ) -> Result<Vec<TrackedPair>, DatabaseError> {
        let query = format!(
            r#"
            SELECT {}
            {}
            WHERE (ue.user_id, ue.exam_id) > ($1, $2)
            ORDER BY ue.user_id, ue.exam_id
            LIMIT $3
            "#,
            SELECT_TRACKED_PAIR_COLUMNS, FROM_TRACKED_PAIRS
        );

        let rows = sqlx::query(&query)
            .bind(after_user_id)
            .bind(after_exam_id)
            .bind(self.page_size)
            .fetch_all(self.pool.pool())
            .await?;

        rows.iter().map(pair_from_row).collect()
    }

    /// Fetch every tracked pair of a single user
    #[instrument(skip(self))]
    pub async fn find_by_user(&self, user_id: i64) -> Result<Vec<TrackedPair>, DatabaseError> {
        let query = format!(
            r#"
            SELECT {}
            {}
            WHERE ue.user_id = $1
            ORDER BY ue.exam_id
            "#,
            SELECT_TRACKED_PAIR_COLUMNS, FROM_TRACKED_PAIRS
        );

        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(self.pool.pool())
            .await?;

        rows.iter().map(pair_from_row).collect()
    }
}

#[async_trait]
impl SubscriptionResolver for SubscriptionRepository {
    #[instrument(skip(self))]
    async fn list_tracked_pairs(&self) -> Result<Vec<TrackedPair>, ResolverError> {
        let mut pairs = Vec::new();
        let mut cursor = (i64::MIN, i64::MIN);

        loop {
            let page = self.find_page_after(cursor.0, cursor.1).await?;
            let page_len = page.len() as i64;

            if let Some(last) = page.last() {
                cursor = (last.user_id, last.exam.id);
            }
            pairs.extend(page);

            if page_len < self.page_size {
                break;
            }
        }

        tracing::debug!(count = pairs.len(), "Resolved tracked pairs");
        Ok(pairs)
    }

    #[instrument(skip(self))]
    async fn tracked_pairs_for_user(&self, user_id: i64) -> Result<Vec<TrackedPair>, ResolverError> {
        Ok(self.find_by_user(user_id).await?)
    }
}

fn pair_from_row(row: &PgRow) -> Result<TrackedPair, DatabaseError> {
    let exam = Exam {
        id: row.try_get("exam_id")?,
        name: row.try_get("exam_name")?,
        institution: row.try_get("institution")?,
        start_registration: row.try_get("start_registration")?,
        end_registration: row.try_get("end_registration")?,
        payment_deadline: row.try_get("payment_deadline")?,
        exemption_deadline: row.try_get("exemption_deadline")?,
        first_phase_date: row.try_get("first_phase_date")?,
        second_phase_date: row.try_get("second_phase_date")?,
        results_date: row.try_get("results_date")?,
        first_call_date: row.try_get("first_call_date")?,
        enrollment_date: row.try_get("enrollment_date")?,
        second_call_date: row.try_get("second_call_date")?,
    };

    Ok(TrackedPair {
        user_id: row.try_get("user_id")?,
        contact: row.try_get("contact")?,
        exam,
    })
}
