use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use skillpack_domain::{SchemaVersionError, ValidationError};

/// Everything that can go wrong between "caller asked for an install" and
/// "the manifest and the filesystem agree again".
///
/// The variants are deliberate outcomes, not just wrapped causes: a
/// [`InstallError::Transaction`] means every prior commit in the batch was
/// already rolled back, and a [`InstallError::PartialCommit`] means the
/// just-published targets were rolled back after the manifest write failed,
/// so the filesystem still matches the old manifest.
#[derive(Debug, Error)]
pub enum InstallError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("timed out after {waited:?} waiting for manifest lock at {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error(transparent)]
    SchemaVersion(#[from] SchemaVersionError),

    #[error("symbolic link rejected: {path}")]
    SymlinkRejected { path: PathBuf },

    #[error("blocked file types in package: {}", files.join(", "))]
    BlockedFileTypes { files: Vec<String> },

    #[error("transaction failed, committed steps rolled back: {}", errors.join("; "))]
    Transaction { errors: Vec<String> },

    #[error("install published but manifest write failed; published targets were rolled back")]
    PartialCommit {
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
