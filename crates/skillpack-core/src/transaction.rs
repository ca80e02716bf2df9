use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::{debug, warn};

use skillpack_domain::{InstallRecord, Scope};

use crate::error::InstallError;
use crate::installer::{install_staged, InstallStep};
use crate::store::ManifestStore;

/// Result of running a batch of install steps as one unit.
///
/// On failure, `committed` is empty: every step that had published before
/// the failing one has already been rolled back, so the batch reads as
/// "nothing happened".
#[derive(Clone, Debug, Default)]
pub struct TransactionOutcome {
    pub success: bool,
    pub committed: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Run `steps` strictly in order, publishing each through the staged
/// installer, and roll back every prior commit on the first failure.
///
/// Steps are never reordered: two steps may alias the same target, so
/// independence is not assumed. An empty batch is a trivial success.
#[must_use]
pub fn execute_transaction(steps: &[InstallStep]) -> TransactionOutcome {
    let mut committed: Vec<PathBuf> = Vec::new();

    for step in steps {
        match install_staged(&step.source, &step.target) {
            Ok(result) => {
                debug!(
                    target = %step.target.display(),
                    files_copied = result.files_copied,
                    "transaction step committed"
                );
                committed.push(step.target.clone());
            }
            Err(err) => {
                let errors = vec![format!("{}: {err}", step.target.display())];
                rollback_targets(&committed);
                return TransactionOutcome {
                    success: false,
                    committed: Vec::new(),
                    errors,
                };
            }
        }
    }

    TransactionOutcome {
        success: true,
        committed,
        errors: Vec::new(),
    }
}

/// Best-effort removal of already-published targets, newest first. Failures
/// are logged, never raised: a secondary error during cleanup would mask the
/// primary cause.
pub(crate) fn rollback_targets(targets: &[PathBuf]) {
    for target in targets.iter().rev() {
        match fs::remove_dir_all(target) {
            Ok(()) => debug!(target = %target.display(), "rolled back published target"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                warn!(
                    target = %target.display(),
                    error = %err,
                    "failed to roll back published target"
                );
            }
        }
    }
}

/// What a successful batch apply did.
#[derive(Clone, Debug)]
pub struct ApplyReport {
    pub committed: Vec<PathBuf>,
    pub records_written: usize,
}

/// Run an install transaction and record its results in the manifest as one
/// logical operation.
///
/// If the transaction fails, nothing is recorded. If the transaction
/// succeeds but the manifest write fails, the just-published targets are
/// rolled back so the filesystem returns to matching the old manifest, and
/// [`InstallError::PartialCommit`] is returned, trading "no progress" for
/// "no lies".
pub fn apply_install(
    store: &ManifestStore,
    scope: Scope,
    steps: &[InstallStep],
    records: Vec<InstallRecord>,
) -> Result<ApplyReport, InstallError> {
    let outcome = execute_transaction(steps);
    if !outcome.success {
        return Err(InstallError::Transaction {
            errors: outcome.errors,
        });
    }

    let records_written = match store.add_many(scope, records) {
        Ok(count) => count,
        Err(err) => {
            rollback_targets(&outcome.committed);
            return Err(InstallError::PartialCommit {
                source: anyhow::Error::new(err),
            });
        }
    };

    Ok(ApplyReport {
        committed: outcome.committed,
        records_written,
    })
}
