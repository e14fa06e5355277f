use thiserror::Error;

/// Typed error surface for the storage engine. The HTTP adapter maps
/// each variant onto a status code; nothing here should leak internal
/// paths or credentials in its `Display` text.
#[derive(Debug, Error)]
pub enum LfssError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("user not found: {0}")]
    UserNotFound(String),

    #[error("permission denied")]
    PermissionDenied,

    #[error("file exists: {0}")]
    FileExists(String),

    #[error("file duplicate: {0}")]
    FileDuplicate(String),

    #[error("file locked: {0}")]
    FileLocked(String),

    #[error("storage quota exceeded")]
    StorageExceeded,

    #[error("too many items")]
    TooManyItems,

    #[error("database is locked")]
    DatabaseLocked,

    #[error("database transaction error: {0}")]
    DatabaseTransaction(String),

    #[error("invalid range")]
    InvalidRange,

    #[error("unsupported content type")]
    UnsupportedContentType,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LfssError {
    /// Classify a `rusqlite` error the way `connection_pool.py`'s
    /// `handle_sqlite_error` does: lock contention and reentrant
    /// transaction errors get their own kinds so the HTTP layer can
    /// answer 503 instead of 500.
    pub fn from_sqlite(err: rusqlite::Error) -> Self {
        use rusqlite::Error as E;
        match &err {
            E::SqliteFailure(e, msg) => {
                let text = msg.clone().unwrap_or_default();
                if e.code == rusqlite::ErrorCode::DatabaseBusy
                    || e.code == rusqlite::ErrorCode::DatabaseLocked
                    || text.contains("database is locked")
                {
                    LfssError::DatabaseLocked
                } else if text.contains("cannot start a transaction within a transaction")
                    || text.contains("no transaction is active")
                {
                    LfssError::DatabaseTransaction(text)
                } else {
                    LfssError::DatabaseTransaction(err.to_string())
                }
            }
            _ => LfssError::DatabaseTransaction(err.to_string()),
        }
    }
}

pub type LfssResult<T> = Result<T, LfssError>;
