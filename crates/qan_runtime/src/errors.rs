#[derive(Debug, thiserror::Error)]
pub enum QanError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("not found")]
    NotFound,

    #[error("agent not connected")]
    AgentNotConnected,

    #[error("timed out waiting for agent reply")]
    Timeout,

    #[error("bad data: {message}")]
    BadData { message: String },

    #[error("invalid instance: {message}")]
    InvalidInstance { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("query classification failed: {0}")]
    Query(#[from] query_info::ParseError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("subprocess failed: {message}")]
    Subprocess { message: String },
}

pub type QanResult<T> = Result<T, QanError>;

impl QanError {
    pub fn bad_data(message: impl Into<String>) -> Self {
        QanError::BadData {
            message: message.into(),
        }
    }

    /// True for store failures that mean the connection to the store is gone
    /// or the store cannot accept writes. Sessions restart on these; all
    /// other write errors are logged and skipped.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            QanError::Io(_) => true,
            QanError::Database(err) => match err {
                sqlx::Error::Io(_)
                | sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    // A read-only store is treated like a lost connection:
                    // the session resets rather than dropping data silently.
                    db.message().contains("readonly")
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Duplicate-key collisions are expected when two writers race on the
    /// same new row; callers re-read or skip instead of failing the report.
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            QanError::Database(sqlx::Error::Database(db)) => {
                let msg = db.message();
                msg.contains("UNIQUE constraint failed") || msg.contains("Duplicate entry")
            }
            _ => false,
        }
    }
}
