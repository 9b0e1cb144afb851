use std::{error::Error, fmt, io};

use backtrace::Backtrace;

/// Crate-wide error type. Recoverable variants (duplicate key, missing key,
/// pool exhaustion) are expected to be matched on by callers; the rest
/// represent a broken on-disk invariant and are treated as fatal by the
/// caller's own `?` propagation.
#[derive(Debug)]
pub enum StorageError {
    IndexEntryAlreadyExists,
    IndexEntryNotFound,
    InvalidColLength { expected: usize, got: usize },
    FileExists(String),
    FileNotFound(String),
    FileNotClosed(String),
    FileNotOpen(String),
    BufferPoolExhausted,
    /// A broken on-disk invariant or logic error. Carries the backtrace of
    /// the call that raised it, since by the time a caller sees this the
    /// original stack is otherwise gone.
    Internal(String, Backtrace),
}

impl StorageError {
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        StorageError::Internal(msg.into(), Backtrace::new())
    }

    /// Logs the captured backtrace at `error` level. Callers on a fatal
    /// path call this before propagating, the way `SmallError::show_backtrace`
    /// is used before bubbling a lock-cycle error up out of the concurrency
    /// manager.
    pub fn show_backtrace(&self) {
        if let StorageError::Internal(msg, bt) = self {
            log::error!("internal error: {}\n{:?}", msg, bt);
        }
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StorageError::IndexEntryAlreadyExists => write!(f, "index entry already exists"),
            StorageError::IndexEntryNotFound => write!(f, "index entry not found"),
            StorageError::InvalidColLength { expected, got } => write!(
                f,
                "invalid column length: expected {}, got {}",
                expected, got
            ),
            StorageError::FileExists(path) => write!(f, "file already exists: {}", path),
            StorageError::FileNotFound(path) => write!(f, "file not found: {}", path),
            StorageError::FileNotClosed(path) => write!(f, "file not closed: {}", path),
            StorageError::FileNotOpen(path) => write!(f, "file not open: {}", path),
            StorageError::BufferPoolExhausted => {
                write!(f, "buffer pool exhausted, no victim frame available")
            }
            StorageError::Internal(msg, _) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for StorageError {}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        StorageError::Internal(e.to_string(), Backtrace::new())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
