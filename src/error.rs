use thiserror::Error;

#[derive(Error, Debug)]
pub enum KuraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },

    #[error("schema error: {0}")]
    Schema(String),

    #[error("database busy: {0}")]
    Busy(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("misuse: {0}")]
    Misuse(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl KuraError {
    /// Errors that leave the database instance untrustworthy.
    /// A connection that sees one refuses further operations until reopened.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KuraError::Corruption(_) | KuraError::Crypto(_))
    }
}

pub type Result<T> = std::result::Result<T, KuraError>;
