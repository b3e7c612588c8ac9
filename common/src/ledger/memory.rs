// In-process dispatch ledger for single-instance deployments and tests

use super::{ClaimOutcome, DispatchLedger};
use crate::errors::LedgerError;
use crate::models::{DispatchKey, DispatchRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Claim {
    owner: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerState {
    records: HashMap<DispatchKey, DispatchRecord>,
    claims: HashMap<DispatchKey, Claim>,
}

/// Dispatch ledger held in memory behind a single mutex.
///
/// Check-and-set is atomic within the process only; deployments with more
/// than one instance need `DispatchRepository`.
#[derive(Debug, Default)]
pub struct InMemoryDispatchLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryDispatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored record
    pub fn records(&self) -> Vec<DispatchRecord> {
        self.lock().records.values().cloned().collect()
    }

    pub fn record_count(&self) -> usize {
        self.lock().records.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DispatchLedger for InMemoryDispatchLedger {
    async fn has_sent(&self, key: &DispatchKey) -> Result<bool, LedgerError> {
        Ok(self.lock().records.contains_key(key))
    }

    async fn try_claim(
        &self,
        key: &DispatchKey,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ClaimOutcome, LedgerError> {
        let mut state = self.lock();

        if state.records.contains_key(key) {
            return Ok(ClaimOutcome::AlreadySent);
        }

        if let Some(existing) = state.claims.get(key) {
            if existing.owner != owner && existing.expires_at > now {
                return Ok(ClaimOutcome::InFlight);
            }
            debug!(key = %key, "Taking over expired dispatch claim");
        }

        state.claims.insert(
            *key,
            Claim {
                owner,
                expires_at: now + ttl,
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn record_sent(&self, record: &DispatchRecord) -> Result<(), LedgerError> {
        let mut state = self.lock();

        if state.records.contains_key(&record.key) {
            return Err(LedgerError::Conflict(record.key.to_string()));
        }

        state.records.insert(record.key, record.clone());
        state.claims.remove(&record.key);
        Ok(())
    }

    async fn release(&self, key: &DispatchKey, owner: Uuid) -> Result<(), LedgerError> {
        let mut state = self.lock();
        if state.claims.get(key).is_some_and(|claim| claim.owner == owner) {
            state.claims.remove(key);
        }
        Ok(())
    }

    async fn prune(&self, before: NaiveDate) -> Result<u64, LedgerError> {
        let mut state = self.lock();
        let initial = state.records.len();
        state.records.retain(|key, _| key.milestone_date >= before);
        state.claims.retain(|key, _| key.milestone_date >= before);
        Ok((initial - state.records.len()) as u64)
    }
}
