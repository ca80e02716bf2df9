use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use tracing::{debug, warn};
use walkdir::WalkDir;

use skillpack_domain::{is_blocked_file_type, validate_relative_path};

use crate::error::InstallError;

const STAGING_PREFIX: &str = ".skillpack-stage-";

/// One (source, target) pair inside a transaction.
#[derive(Clone, Debug)]
pub struct InstallStep {
    pub source: PathBuf,
    pub target: PathBuf,
}

/// What a successful staged install published.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StagedInstall {
    pub files_copied: usize,
}

/// Copy a package tree into `target` through a staging directory.
///
/// The tree is enumerated (symlinks rejected), copied into a uniquely named
/// staging directory on the target's volume, swept for blocked file types,
/// and only then renamed into place. Failure at any step before the rename
/// leaves the target untouched; a leftover staging directory is acceptable
/// residue, an inconsistent target is not.
pub fn install_staged(source: &Path, target: &Path) -> Result<StagedInstall, InstallError> {
    let entries = enumerate_tree(source)?;

    let parent = target
        .parent()
        .ok_or_else(|| anyhow!("install target {} has no parent directory", target.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    // Staged next to the target so the final rename stays on one filesystem.
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(parent)
        .with_context(|| format!("failed to create staging directory in {}", parent.display()))?;

    let files_copied = copy_tree(source, &entries, staging.path())?;

    let blocked = blocked_files(staging.path())?;
    if !blocked.is_empty() {
        // TempDir drop cleans the staging directory; the target is untouched.
        return Err(InstallError::BlockedFileTypes { files: blocked });
    }

    replace_target(target)?;

    let staged = staging.keep();
    if let Err(err) = fs::rename(&staged, target) {
        if let Err(cleanup) = fs::remove_dir_all(&staged) {
            warn!(
                path = %staged.display(),
                error = %cleanup,
                "failed to clean up staging directory"
            );
        }
        return Err(InstallError::Other(anyhow::Error::new(err).context(
            format!("failed to publish staged tree to {}", target.display()),
        )));
    }

    debug!(
        target = %target.display(),
        files_copied,
        "published staged install"
    );
    Ok(StagedInstall { files_copied })
}

struct TreeEntry {
    relative: PathBuf,
    is_dir: bool,
}

/// Enumerate every entry under `source`, rejecting symlinks outright: their
/// targets are never validated, so a symlink is always invalid input rather
/// than something to resolve.
fn enumerate_tree(source: &Path) -> Result<Vec<TreeEntry>, InstallError> {
    let mut entries = Vec::new();
    for entry in WalkDir::new(source).follow_links(false) {
        let entry =
            entry.with_context(|| format!("failed to read source tree {}", source.display()))?;
        if entry.path_is_symlink() {
            return Err(InstallError::SymlinkRejected {
                path: entry.path().to_path_buf(),
            });
        }
        let relative = entry
            .path()
            .strip_prefix(source)
            .with_context(|| format!("entry escapes source root: {}", entry.path().display()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        validate_relative_path(&relative.to_string_lossy())?;
        entries.push(TreeEntry {
            relative: relative.to_path_buf(),
            is_dir: entry.file_type().is_dir(),
        });
    }
    Ok(entries)
}

fn copy_tree(
    source: &Path,
    entries: &[TreeEntry],
    staging: &Path,
) -> Result<usize, InstallError> {
    let mut files_copied = 0;
    for entry in entries {
        let from = source.join(&entry.relative);
        let to = staging.join(&entry.relative);
        if entry.is_dir {
            fs::create_dir_all(&to)
                .with_context(|| format!("failed to create {}", to.display()))?;
        } else {
            if let Some(dir) = to.parent() {
                fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            fs::copy(&from, &to)
                .with_context(|| format!("failed to copy {}", from.display()))?;
            files_copied += 1;
        }
    }
    Ok(files_copied)
}

/// Sweep the staged tree for denylisted file types. Runs against the staged
/// copy, not the source, so the published bytes are exactly what was checked.
fn blocked_files(staging: &Path) -> Result<Vec<String>, InstallError> {
    let mut blocked = Vec::new();
    for entry in WalkDir::new(staging).follow_links(false) {
        let entry = entry
            .with_context(|| format!("failed to re-read staged tree {}", staging.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_blocked_file_type(&name) {
            let shown = entry
                .path()
                .strip_prefix(staging)
                .map_or_else(|_| entry.path().to_path_buf(), Path::to_path_buf);
            blocked.push(shown.display().to_string());
        }
    }
    blocked.sort();
    Ok(blocked)
}

/// The publish step always fully replaces an existing target, never merges.
fn replace_target(target: &Path) -> Result<(), InstallError> {
    match fs::symlink_metadata(target) {
        Ok(metadata) => {
            let result = if metadata.is_dir() {
                fs::remove_dir_all(target)
            } else {
                fs::remove_file(target)
            };
            result.with_context(|| {
                format!("failed to remove existing target {}", target.display())
            })?;
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(InstallError::Other(anyhow::Error::new(err).context(
            format!("failed to inspect target {}", target.display()),
        ))),
    }
}
