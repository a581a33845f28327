use thiserror::Error;

/// Error type for segment read operations.
///
/// Absent columns or blocks are not errors; readers report them as `Ok(None)` / `Ok(false)`.
#[derive(Error, Debug)]
pub enum ReadError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        column: Option<String>,
        block: Option<u16>,
    },

    /// Fewer timestamps were decoded than the block declares. The decoded prefix is kept so
    /// callers can decide whether to use it.
    #[error("Short timestamp block {block}: decoded {decoded} of {expected} records")]
    PartialTimestamps {
        block: u16,
        decoded: usize,
        expected: usize,
        partial: Vec<u64>,
    },

    /// The process-wide file descriptor budget could not be acquired in time.
    #[error("File descriptor budget exhausted: requested={requested}, available={available}")]
    FdBudgetExhausted { requested: usize, available: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Blob store error: {0}")]
    Blob(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ReadError>;

impl ReadError {
    pub(crate) fn corruption(details: impl Into<String>) -> Self {
        ReadError::Corruption {
            details: details.into(),
            column: None,
            block: None,
        }
    }

    /// Attaches column/block context to corruption errors that do not carry it yet.
    pub(crate) fn in_block(self, column: &str, block: u16) -> Self {
        match self {
            ReadError::Corruption {
                details,
                column: None,
                block: None,
            } => ReadError::Corruption {
                details,
                column: Some(column.to_string()),
                block: Some(block),
            },
            other => other,
        }
    }

    /// True for failures a caller may retry later (currently only descriptor budget exhaustion).
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReadError::FdBudgetExhausted { .. })
    }

    /// Returns the partially decoded timestamps carried by a short decode, if any.
    pub fn into_partial_timestamps(self) -> Option<Vec<u64>> {
        match self {
            ReadError::PartialTimestamps { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ReadError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ReadError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
