use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Duplicate key in collection '{collection}' for index '{index}': {key}")]
    DuplicateKey {
        collection: String,
        index: String,
        key: String,
    },

    #[error("Index '{0}' not found in collection '{1}'")]
    IndexNotFound(String, String),

    #[error("Index '{0}' already exists in collection '{1}' with different options")]
    IndexExists(String, String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("I/0 error: {0}")]
    IoError(String),
}

impl DbError {
    /// True when a write was rejected by a unique index.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, Self::DuplicateKey { .. })
    }
}

pub type Result<T> = std::result::Result<T, DbError>;

impl From<std::io::Error> for DbError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// Failures that end a migration run.
///
/// Lock contention and ledger duplicate-key conflicts are resolved inside the
/// engine and never show up here.
#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Change unit '{change_id}' by '{author}' failed: {source}")]
    ChangeUnitExecutionFailed {
        change_id: String,
        author: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to record change unit '{change_id}' by '{author}': {source}")]
    LedgerWriteFailed {
        change_id: String,
        author: String,
        #[source]
        source: DbError,
    },

    /// Storage failure outside any one change unit: lock setup, acquire or
    /// release, ledger reads, or building the unique ledger index.
    #[error("Storage error: {0}")]
    Storage(DbError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MigrationError {
    /// Identity of the change unit the failure belongs to, if any.
    pub fn change_unit(&self) -> Option<(&str, &str)> {
        match self {
            Self::ChangeUnitExecutionFailed { change_id, author, .. }
            | Self::LedgerWriteFailed { change_id, author, .. } => {
                Some((change_id.as_str(), author.as_str()))
            }
            _ => None,
        }
    }
}

impl From<DbError> for MigrationError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::StorageUnavailable(msg) => Self::StorageUnavailable(msg),
            other => Self::Storage(other),
        }
    }
}
