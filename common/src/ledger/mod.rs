// Dispatch ledger: durable record of which notifications were already sent
//
// The ledger is what makes the sweep and the one-shot timers composable:
// whichever path claims a key first sends, the other observes the claim or
// the record and does nothing.

pub mod memory;

pub use memory::InMemoryDispatchLedger;

use crate::errors::LedgerError;
use crate::models::{DispatchKey, DispatchRecord};
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use uuid::Uuid;

/// Result of trying to take the send lease for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the lease and must send, then record or release
    Claimed,
    /// A dispatch record exists; nothing to do
    AlreadySent,
    /// Another worker holds an unexpired lease
    InFlight,
}

#[async_trait]
pub trait DispatchLedger: Send + Sync {
    /// Check whether a record exists for the key
    async fn has_sent(&self, key: &DispatchKey) -> Result<bool, LedgerError>;

    /// Atomically take the send lease for a key.
    ///
    /// Exactly one of several concurrent callers observes `Claimed`. An
    /// expired lease left behind by a crashed worker can be taken over.
    async fn try_claim(
        &self,
        key: &DispatchKey,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<ClaimOutcome, LedgerError>;

    /// Persist a confirmed send and drop the lease.
    ///
    /// Fails with `LedgerError::Conflict` if the key was already recorded.
    async fn record_sent(&self, record: &DispatchRecord) -> Result<(), LedgerError>;

    /// Drop a lease after a failed send so the key stays eligible
    async fn release(&self, key: &DispatchKey, owner: Uuid) -> Result<(), LedgerError>;

    /// Delete records and leases whose milestone date is before `before`
    async fn prune(&self, before: NaiveDate) -> Result<u64, LedgerError>;
}
