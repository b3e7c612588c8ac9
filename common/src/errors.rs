// Error handling framework for the deadline alert engine

use crate::models::MilestoneKind;
use thiserror::Error;

/// Milestone catalog errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("Invalid {kind} date '{value}' for exam {exam_id}")]
    InvalidMilestoneDate {
        exam_id: i64,
        kind: MilestoneKind,
        value: String,
    },
}

/// Sweep cadence errors
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression { expression: String, reason: String },

    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),

    #[error("Invalid time of day '{0}', expected HH:MM")]
    InvalidTimeOfDay(String),

    #[error("No next execution time available for '{expression}'")]
    NoNextExecution { expression: String },
}

/// Subscription resolver errors
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Subscription source unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed subscription row: {0}")]
    InvalidRow(String),
}

/// Dispatch ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// A record already exists for the key. Callers treat this as "already handled".
    #[error("Dispatch already recorded: {0}")]
    Conflict(String),

    #[error("Dispatch ledger unavailable: {0}")]
    Unavailable(String),
}

/// Messaging gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid recipient address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Message rejected by gateway: {0}")]
    Rejected(String),

    #[error("Gateway transport failed: {0}")]
    Transport(String),

    #[error("Gateway configuration error: {0}")]
    Config(String),
}

/// Errors that abort a whole sweep
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("A sweep is already running")]
    AlreadyRunning,

    #[error("Sweep lease held by another instance")]
    LeaseUnavailable,

    #[error("Subscription resolver unavailable: {0}")]
    ResolverUnavailable(#[from] ResolverError),

    #[error("Dispatch ledger unavailable: {0}")]
    LedgerUnavailable(String),
}

impl From<LedgerError> for SweepError {
    fn from(err: LedgerError) -> Self {
        SweepError::LedgerUnavailable(err.to_string())
    }
}

/// Database-specific errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Database health check failed: {0}")]
    HealthCheckFailed(String),

    #[error("Query execution failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate key violation: {0}")]
    DuplicateKey(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Row could not be decoded: {0}")]
    InvalidData(String),
}

/// Storage errors for auxiliary stores (Redis)
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

// Implement From for common external errors
impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DatabaseError::NotFound("Record not found".to_string()),
            sqlx::Error::Database(db_err) => match db_err.code() {
                Some(code) if code.as_ref() == "23505" => {
                    DatabaseError::DuplicateKey(db_err.message().to_string())
                }
                _ => DatabaseError::QueryFailed(db_err.message().to_string()),
            },
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::Decode(_) => DatabaseError::InvalidData(err.to_string()),
            _ => DatabaseError::QueryFailed(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DatabaseError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DatabaseError::MigrationFailed(err.to_string())
    }
}

impl From<DatabaseError> for LedgerError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::DuplicateKey(msg) => LedgerError::Conflict(msg),
            other => LedgerError::Unavailable(other.to_string()),
        }
    }
}

impl From<DatabaseError> for ResolverError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::InvalidData(reason) => ResolverError::InvalidRow(reason),
            other => ResolverError::Unavailable(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::RedisError(err.to_string())
    }
}
