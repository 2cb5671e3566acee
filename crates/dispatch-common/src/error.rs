use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// A required field is missing or malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// A unique constraint would be violated (duplicate slug, duplicate subscription).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Begin or commit failed; the surrounding transaction has been rolled back.
    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}
