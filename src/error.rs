use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrmError>;

#[derive(Debug, Error)]
pub enum OrmError {
    /// A table blueprint could not be normalized into a schema.
    #[error("Schema validation error: {0}")]
    SchemaValidation(String),

    /// A structural query referenced something unresolvable or mixed
    /// incompatible types.
    #[error("Query compilation error: {0}")]
    QueryCompilation(String),

    /// A migration plan contains destructive steps the caller did not allow.
    #[error("Migration conflict: {0}")]
    MigrationConflict(String),

    /// The storage engine rejected a statement.
    #[error("Execution error: {message}")]
    Execution {
        message: String,
        code: Option<String>,
    },

    /// A stored value does not match its declared column type.
    #[error("Type conversion error: {0}")]
    TypeConversion(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Sync error: {0}")]
    Sync(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OrmError {
    pub(crate) fn schema(msg: impl Into<String>) -> Self {
        OrmError::SchemaValidation(msg.into())
    }

    pub(crate) fn compile(msg: impl Into<String>) -> Self {
        OrmError::QueryCompilation(msg.into())
    }

    pub(crate) fn conversion(msg: impl Into<String>) -> Self {
        OrmError::TypeConversion(msg.into())
    }

    /// Engine error code, when the storage engine reported one.
    pub fn code(&self) -> Option<&str> {
        match self {
            OrmError::Execution { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for OrmError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => OrmError::Execution {
                message: db.message().to_string(),
                code: db.code().map(|c| c.into_owned()),
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                OrmError::Connection(err.to_string())
            }
            sqlx::Error::Configuration(e) => OrmError::Connection(e.to_string()),
            other => OrmError::Execution {
                message: other.to_string(),
                code: None,
            },
        }
    }
}
