//! Error types for coursemedia

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The backend reported the key as absent.
    #[error("File does not exist: {0}")]
    NotFound(String),

    #[error("the joined path is located outside of the base path component: {0}")]
    OutsideBasePath(String),

    #[error(
        "Storage tried to truncate away entire filename \"{0}\". \
         Please make sure that the corresponding file field allows sufficient \"max_length\"."
    )]
    TruncationExhausted(String),

    #[error("Invalid file mode: {0}")]
    InvalidMode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Decode error: {0}")]
    Decode(#[from] std::string::FromUtf8Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound(key.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Input errors are caused by the caller-supplied name or mode and are never retryable.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::OutsideBasePath(_)
                | Error::TruncationExhausted(_)
                | Error::InvalidMode(_)
                | Error::Decode(_)
        )
    }
}
