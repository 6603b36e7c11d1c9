use thiserror::Error;

/// Postgres SQLSTATEs the store treats as "retry me": serialization failure,
/// deadlock, and lock-not-available (NOWAIT)
const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01", "55P03"];
const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Lock contention: {0}")]
    LockContention(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Transient failures that the calling layer retries with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockContention(_) | Self::ConnectionLost(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "row",
                id: "?".to_string(),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::ConnectionLost(err.to_string())
            }
            sqlx::Error::Database(db) => match db.code().as_deref() {
                Some(code) if RETRYABLE_SQLSTATES.contains(&code) => {
                    Self::LockContention(db.message().to_string())
                }
                Some(UNIQUE_VIOLATION) => Self::Conflict(db.message().to_string()),
                _ => Self::Database(err),
            },
            _ => Self::Database(err),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
