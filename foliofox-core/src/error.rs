use thiserror::Error;

/// Errors surfaced by the FolioFox core.
#[derive(Error, Debug)]
pub enum FolioError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("model error: {0}")]
    Model(#[from] foliofox_model::ModelError),

    #[error("migration {version} checksum drift: recorded {recorded}, computed {computed}")]
    SchemaMismatch {
        version: i64,
        recorded: String,
        computed: String,
    },

    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FolioError {
    /// Whether a component should recover locally and retry, per the
    /// propagation policy: transient transport and server-side conditions
    /// are retried, everything else is surfaced.
    pub fn is_retryable(&self) -> bool {
        match self {
            FolioError::Http(err) => {
                err.is_timeout() || err.is_connect() || err.is_request()
            }
            FolioError::Database(sqlx::Error::PoolTimedOut) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FolioError>;
