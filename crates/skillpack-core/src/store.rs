use std::fs;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use anyhow::Context;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use skillpack_domain::{
    migrate, validate_name, InstallRecord, Manifest, MigrationOutcome, Scope, ValidationError,
};

use crate::error::InstallError;
use crate::layout::TargetLayout;
use crate::lock::{ensure_manifest_dir, LockOptions, ManifestLock};

/// Durable, lock-serialized access to the per-scope manifests.
///
/// `read` and `write` are individually atomic; `mutate` is the only
/// sanctioned read-modify-write cycle. Callers always receive owned
/// manifests, never references into a cache, so two operations in one
/// process cannot alias each other's state.
#[derive(Clone, Debug)]
pub struct ManifestStore {
    layout: TargetLayout,
    lock_options: LockOptions,
}

impl ManifestStore {
    #[must_use]
    pub fn new(layout: TargetLayout) -> Self {
        Self::with_lock_options(layout, LockOptions::default())
    }

    #[must_use]
    pub fn with_lock_options(layout: TargetLayout, lock_options: LockOptions) -> Self {
        Self {
            layout,
            lock_options,
        }
    }

    #[must_use]
    pub fn layout(&self) -> &TargetLayout {
        &self.layout
    }

    #[must_use]
    pub fn manifest_path(&self, scope: Scope) -> PathBuf {
        self.layout.manifest_path(scope)
    }

    /// Load the manifest for `scope`.
    ///
    /// A missing file is an empty manifest; a corrupt or outdated file is
    /// logged and degraded to an empty manifest rather than failing the
    /// calling command. Only a manifest from a *newer* schema version is a
    /// hard error, so state written by a newer tool is never discarded.
    pub fn read(&self, scope: Scope) -> Result<Manifest, InstallError> {
        let path = self.manifest_path(scope);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Manifest::empty()),
            Err(err) => {
                return Err(InstallError::Other(anyhow::Error::new(err).context(
                    format!("failed to read manifest at {}", path.display()),
                )))
            }
        };

        let raw: Value = match serde_json::from_str(&contents) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "manifest is not valid JSON; starting from an empty manifest"
                );
                return Ok(Manifest::empty());
            }
        };

        match migrate(raw)? {
            MigrationOutcome::Current(manifest) => Ok(manifest),
            MigrationOutcome::Reset { reason } => {
                warn!(
                    path = %path.display(),
                    reason = %reason,
                    "manifest failed validation; starting from an empty manifest"
                );
                Ok(Manifest::empty())
            }
        }
    }

    /// Persist `manifest` for `scope` durably and atomically.
    ///
    /// Serializes to a uniquely named temporary file in the manifest
    /// directory and renames it into place, so a concurrent reader sees
    /// either the old file or the new one, never a partial write.
    pub fn write(&self, scope: Scope, manifest: &Manifest) -> Result<(), InstallError> {
        let path = self.manifest_path(scope);
        ensure_manifest_dir(&path)?;
        let dir = path
            .parent()
            .context("manifest path has no parent directory")?;

        let mut body = serde_json::to_string_pretty(manifest)
            .context("failed to serialize manifest")?;
        body.push('\n');

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("failed to create temporary file in {}", dir.display()))?;
        tmp.write_all(body.as_bytes())
            .context("failed to write manifest contents")?;
        tmp.as_file()
            .sync_all()
            .context("failed to flush manifest to disk")?;
        tmp.persist(&path)
            .with_context(|| format!("failed to move manifest into {}", path.display()))?;
        debug!(path = %path.display(), packages = manifest.packages.len(), "manifest written");
        Ok(())
    }

    /// Perform one locked read-modify-write cycle against `scope`.
    ///
    /// The advisory lock is held for the whole cycle, so concurrent
    /// invocations serialize instead of losing updates. All batch operations
    /// go through a single `mutate` call.
    pub fn mutate<T>(
        &self,
        scope: Scope,
        f: impl FnOnce(&mut Manifest) -> Result<T, InstallError>,
    ) -> Result<T, InstallError> {
        let path = self.manifest_path(scope);
        ensure_manifest_dir(&path)?;
        let _lock = ManifestLock::acquire(&path, &self.lock_options)?;
        let mut manifest = self.read(scope)?;
        let out = f(&mut manifest)?;
        self.write(scope, &manifest)?;
        Ok(out)
    }

    /// Insert or update a batch of records in one locked cycle.
    ///
    /// Every record's agent and package name must pass `validate_name`
    /// (composite keys are only collision-free over validated names), and
    /// every `managed_root` is checked against the scan roots for its
    /// (agent, scope) pair, before anything is written.
    pub fn add_many(
        &self,
        scope: Scope,
        records: Vec<InstallRecord>,
    ) -> Result<usize, InstallError> {
        for record in &records {
            for (field, value) in [
                ("agent", &record.agent),
                ("package name", &record.package_name),
            ] {
                if let Err(err) = validate_name(value) {
                    return Err(ValidationError::new(
                        err.violations
                            .into_iter()
                            .map(|violation| format!("{field} '{value}': {violation}"))
                            .collect(),
                    )
                    .into());
                }
            }
            if record.scope != scope {
                return Err(ValidationError::single(format!(
                    "record for '{}' carries scope {} but was submitted to the {} manifest",
                    record.package_name,
                    record.scope.as_str(),
                    scope.as_str()
                ))
                .into());
            }
            self.layout.ensure_managed_root_allowed(record)?;
        }
        let count = records.len();
        self.mutate(scope, move |manifest| {
            for record in records {
                manifest.upsert(record);
            }
            Ok(count)
        })
    }

    /// Remove a batch of entries in one locked cycle, returning how many
    /// keys were actually present.
    pub fn remove_many(&self, scope: Scope, keys: &[String]) -> Result<usize, InstallError> {
        self.mutate(scope, |manifest| {
            let mut removed = 0;
            for key in keys {
                if manifest.remove(key).is_some() {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    /// Records currently installed for `scope`, sorted by package name.
    pub fn list(&self, scope: Scope) -> Result<Vec<InstallRecord>, InstallError> {
        let manifest = self.read(scope)?;
        let mut records: Vec<InstallRecord> = manifest.packages.into_values().collect();
        records.sort_by(|a, b| a.package_name.cmp(&b.package_name));
        Ok(records)
    }

    /// Remove installed packages and their on-disk trees in one locked cycle.
    ///
    /// For each key present, the record's `managed_root` (the only path the
    /// record authorizes) is deleted before the entry is dropped. An entry
    /// whose root cannot be deleted stays in the manifest so the record keeps
    /// matching the filesystem.
    pub fn remove_packages(
        &self,
        scope: Scope,
        keys: &[String],
    ) -> Result<RemoveReport, InstallError> {
        self.mutate(scope, |manifest| {
            let mut report = RemoveReport::default();
            for key in keys {
                let Some(record) = manifest.packages.get(key) else {
                    report.missing.push(key.clone());
                    continue;
                };
                match fs::remove_dir_all(&record.managed_root) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!(
                            key = %key,
                            path = %record.managed_root.display(),
                            error = %err,
                            "failed to delete managed root; keeping manifest entry"
                        );
                        report.failed.push(key.clone());
                        continue;
                    }
                }
                manifest.remove(key);
                report.removed.push(key.clone());
            }
            Ok(report)
        })
    }
}

/// Outcome of a batch removal; missing keys are reported, not fatal.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoveReport {
    pub removed: Vec<String>,
    pub missing: Vec<String>,
    pub failed: Vec<String>,
}

/// Opaque identifier assigned to a record at creation; never reused.
#[must_use]
pub fn new_install_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skillpack_domain::{manifest_key, rfc3339_now};
    use std::time::Duration;
    use tempfile::tempdir;

    fn store(root: &std::path::Path) -> ManifestStore {
        ManifestStore::new(TargetLayout::new(root.join("proj"), root.join("home")))
    }

    fn record(store: &ManifestStore, name: &str) -> InstallRecord {
        InstallRecord {
            install_id: new_install_id(),
            source_url: "https://github.com/acme/skills".to_string(),
            resolved_ref: Some("main".to_string()),
            resolved_revision: "deadbeef".to_string(),
            source_subpath: None,
            package_name: name.to_string(),
            package_relative_path: format!("skills/{name}"),
            agent: "claude".to_string(),
            scope: Scope::Project,
            managed_root: store.layout().skill_target("claude", Scope::Project, name),
            installed_at: rfc3339_now(),
            updated_at: rfc3339_now(),
        }
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut manifest = Manifest::empty();
        manifest.upsert(record(&store, "alpha"));
        manifest.upsert(record(&store, "beta"));

        store.write(Scope::Project, &manifest).unwrap();
        assert_eq!(store.read(Scope::Project).unwrap(), manifest);

        let on_disk = fs::read_to_string(store.manifest_path(Scope::Project)).unwrap();
        assert!(on_disk.ends_with('\n'));
    }

    #[test]
    fn missing_manifest_reads_as_empty() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        assert_eq!(store.read(Scope::User).unwrap(), Manifest::empty());
    }

    #[test]
    fn corrupt_manifest_degrades_to_empty() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let path = store.manifest_path(Scope::Project);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();
        assert_eq!(store.read(Scope::Project).unwrap(), Manifest::empty());
    }

    #[test]
    fn newer_schema_is_a_hard_error() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let path = store.manifest_path(Scope::Project);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"schema_version": 99, "packages": {}}"#).unwrap();
        assert!(matches!(
            store.read(Scope::Project),
            Err(InstallError::SchemaVersion(_))
        ));
    }

    #[test]
    fn concurrent_add_many_callers_never_lose_updates() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let records: Vec<InstallRecord> = (0..8)
            .map(|i| record(&store, &format!("pkg-{i}")))
            .collect();

        // Each caller honors the lock; the read-modify-write cycles must
        // serialize rather than clobber one another.
        std::thread::scope(|threads| {
            for rec in records {
                let store = &store;
                threads.spawn(move || {
                    let added = store.add_many(Scope::Project, vec![rec]).unwrap();
                    assert_eq!(added, 1);
                });
            }
        });

        let manifest = store.read(Scope::Project).unwrap();
        assert_eq!(manifest.packages.len(), 8);
    }

    #[test]
    fn add_many_rejects_foreign_managed_roots() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut bad = record(&store, "escapee");
        bad.managed_root = dir.path().join("elsewhere");
        assert!(matches!(
            store.add_many(Scope::Project, vec![bad]),
            Err(InstallError::Validation(_))
        ));
        // Nothing was written.
        assert!(!store.manifest_path(Scope::Project).exists());
    }

    #[test]
    fn add_many_rejects_scope_mismatch() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let rec = record(&store, "demo");
        assert!(matches!(
            store.add_many(Scope::User, vec![rec]),
            Err(InstallError::Validation(_))
        ));
    }

    #[test]
    fn add_many_rejects_names_that_would_collide_keys() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        // Unvalidated, these two would both key to "x:project:project:y" and
        // the second would silently replace the first.
        let mut first = record(&store, "y");
        first.agent = "x".to_string();
        first.package_name = "project:y".to_string();
        let mut second = record(&store, "y");
        second.agent = "x:project".to_string();
        assert_eq!(first.key(), second.key());

        for bad in [first, second] {
            match store.add_many(Scope::Project, vec![bad]) {
                Err(InstallError::Validation(err)) => {
                    assert!(
                        err.violations.iter().any(|v| v.contains("lowercase")),
                        "violations: {:?}",
                        err.violations
                    );
                }
                other => panic!("expected Validation error, got {other:?}"),
            }
        }
        assert!(!store.manifest_path(Scope::Project).exists());
    }

    #[test]
    fn remove_many_counts_only_present_keys() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .add_many(Scope::Project, vec![record(&store, "demo")])
            .unwrap();
        let key = manifest_key("claude", Scope::Project, "demo");
        let removed = store
            .remove_many(Scope::Project, &[key, "claude:project:ghost".to_string()])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.read(Scope::Project).unwrap().packages.is_empty());
    }

    #[test]
    fn remove_packages_deletes_managed_roots() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let rec = record(&store, "demo");
        let root = rec.managed_root.clone();
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("SKILL.md"), "# demo\n").unwrap();
        store.add_many(Scope::Project, vec![rec]).unwrap();

        let report = store
            .remove_packages(
                Scope::Project,
                &[
                    manifest_key("claude", Scope::Project, "demo"),
                    manifest_key("claude", Scope::Project, "ghost"),
                ],
            )
            .unwrap();
        assert_eq!(report.removed.len(), 1);
        assert_eq!(report.missing.len(), 1);
        assert!(report.failed.is_empty());
        assert!(!root.exists());
        assert!(store.read(Scope::Project).unwrap().packages.is_empty());
    }

    #[test]
    fn mutate_times_out_when_lock_is_held() {
        let dir = tempdir().unwrap();
        let layout = TargetLayout::new(dir.path().join("proj"), dir.path().join("home"));
        let store = ManifestStore::with_lock_options(
            layout,
            LockOptions {
                stale_after: Duration::from_secs(60),
                timeout: Duration::from_millis(100),
            },
        );
        let path = store.manifest_path(Scope::Project);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(crate::lock::lock_path(&path), b"").unwrap();

        let err = store
            .mutate(Scope::Project, |_| Ok(()))
            .unwrap_err();
        assert!(matches!(err, InstallError::LockTimeout { .. }));
        // The manifest was never touched.
        assert!(!path.exists());
    }

    #[test]
    fn mutate_releases_lock_on_closure_error() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let path = store.manifest_path(Scope::Project);
        let err = store
            .mutate(Scope::Project, |_| -> Result<(), InstallError> {
                Err(InstallError::Other(anyhow::anyhow!("boom")))
            })
            .unwrap_err();
        assert!(matches!(err, InstallError::Other(_)));
        assert!(!crate::lock::lock_path(&path).exists());
        // A second mutate proceeds immediately.
        store.mutate(Scope::Project, |_| Ok(())).unwrap();
    }

    #[test]
    fn list_returns_sorted_owned_copies() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .add_many(
                Scope::Project,
                vec![record(&store, "zeta"), record(&store, "alpha")],
            )
            .unwrap();
        let records = store.list(Scope::Project).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].package_name, "alpha");
        assert_eq!(records[1].package_name, "zeta");
    }
}
