pub mod archive;
pub mod cli;
pub mod manager;
pub mod restore;
pub mod stream;
pub mod version;
pub mod wrapper;

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PostgresError {
    #[error("pg version not allowed: {0}")]
    UnsupportedVersion(String),

    #[error("Invalid dump options: {0}")]
    InvalidOptions(String),

    #[error("Error running psql test v{version}: {output}")]
    ConnectionError { version: String, output: String },

    #[error("Error running pg_dump v{version}: {stderr}")]
    DumpFailed { version: String, stderr: String },

    #[error("Error creating zip archive: {0}")]
    PackagingError(Box<PostgresError>),

    #[error("Restore source unavailable: {0}")]
    AcquisitionError(String),

    #[error("Error extracting dump from archive: {0}")]
    ExtractionError(String),

    #[error("Restore with psql v{version} failed: {status}")]
    RestoreFailed { version: String, status: String },

    #[error("{tool} is not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(std::io::Error),
}

impl PostgresError {
    /// Wraps the error so it can travel through a byte stream and be
    /// recovered on the other side with `PostgresError::from`.
    pub fn into_io(self) -> io::Error {
        match self {
            PostgresError::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}

impl From<std::io::Error> for PostgresError {
    fn from(err: std::io::Error) -> Self {
        if !err
            .get_ref()
            .is_some_and(|inner| inner.is::<PostgresError>())
        {
            return PostgresError::Io(err);
        }

        match err.into_inner().map(|inner| inner.downcast::<PostgresError>()) {
            Some(Ok(inner)) => *inner,
            _ => PostgresError::Io(io::Error::other("stream error lost while unwrapping")),
        }
    }
}

pub type Result<T> = std::result::Result<T, PostgresError>;

// Re-export key types for convenience
pub use archive::{package_as_archive, DUMP_ENTRY};
pub use manager::PostgresManager;
pub use restore::RestoreSource;
pub use stream::ByteStream;
pub use version::{PgVersion, Toolset};
pub use wrapper::DumpOptions;
