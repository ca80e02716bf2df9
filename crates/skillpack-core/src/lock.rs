use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{debug, warn};

use crate::error::InstallError;

/// Tuning for advisory lock acquisition.
#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    /// A lock file older than this is treated as left behind by a crashed
    /// owner and reclaimed.
    pub stale_after: Duration,
    /// Hard ceiling on how long acquisition polls before failing with
    /// [`InstallError::LockTimeout`].
    pub timeout: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(10 * 60),
            timeout: Duration::from_secs(10),
        }
    }
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Best-effort advisory lock: a zero-byte marker file whose existence, not
/// contents, is the signal.
///
/// This is a cooperative convention, not a kernel-level exclusive lock. It
/// serializes this tool's own entry points across processes; it cannot stop
/// a process that ignores the convention. Do not reuse this pattern where
/// uncooperative writers exist.
#[derive(Debug)]
pub(crate) struct ManifestLock {
    path: PathBuf,
}

impl ManifestLock {
    /// Acquire the lock guarding `manifest_path`, polling with exponential
    /// backoff until `options.timeout` elapses.
    pub(crate) fn acquire(
        manifest_path: &Path,
        options: &LockOptions,
    ) -> Result<Self, InstallError> {
        let path = lock_path(manifest_path);
        let started = Instant::now();
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path, options.stale_after) {
                        // Owner presumably crashed; reclaim and retry at once.
                        match fs::remove_file(&path) {
                            Ok(()) => {
                                debug!(path = %path.display(), "reclaimed stale manifest lock");
                                continue;
                            }
                            Err(err) if err.kind() == ErrorKind::NotFound => continue,
                            Err(err) => {
                                warn!(
                                    path = %path.display(),
                                    error = %err,
                                    "failed to reclaim stale manifest lock"
                                );
                            }
                        }
                    }
                    let waited = started.elapsed();
                    if waited >= options.timeout {
                        return Err(InstallError::LockTimeout { path, waited });
                    }
                    thread::sleep(backoff.min(options.timeout.saturating_sub(waited)));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(err) => {
                    return Err(InstallError::Other(
                        anyhow::Error::new(err)
                            .context(format!("failed to create lock file {}", path.display())),
                    ))
                }
            }
        }
    }
}

impl Drop for ManifestLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                // Non-fatal: a future staleness check reclaims it.
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to release manifest lock"
                );
            }
        }
    }
}

/// Fixed lock path derived from the manifest path.
#[must_use]
pub(crate) fn lock_path(manifest_path: &Path) -> PathBuf {
    let mut name = manifest_path
        .file_name()
        .map_or_else(|| "manifest.json".to_string(), |n| n.to_string_lossy().into_owned());
    name.push_str(".lock");
    manifest_path.with_file_name(name)
}

fn is_stale(path: &Path, stale_after: Duration) -> bool {
    let Ok(metadata) = fs::metadata(path) else {
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    modified
        .elapsed()
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

/// Create the directory that will hold the manifest and its lock.
pub(crate) fn ensure_manifest_dir(manifest_path: &Path) -> Result<(), InstallError> {
    if let Some(parent) = manifest_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}
