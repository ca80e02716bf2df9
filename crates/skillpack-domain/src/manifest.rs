use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::record::{rfc3339_now, InstallRecord};

/// Schema version written by this build. Bump on incompatible layout changes.
pub const SCHEMA_VERSION: u32 = 1;

/// The persisted record set for one scope.
///
/// The whole manifest is loaded, mutated in memory, and rewritten atomically;
/// it is never partially written, and callers always work on owned copies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub schema_version: u32,
    pub packages: IndexMap<String, InstallRecord>,
}

impl Manifest {
    /// An empty manifest at the current schema version.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            packages: IndexMap::new(),
        }
    }

    /// Insert or update a record under its composite key.
    ///
    /// Updates keep the original `install_id` and `installed_at` and refresh
    /// `updated_at`; install ids are never reused or mutated after creation.
    pub fn upsert(&mut self, record: InstallRecord) {
        let key = record.key();
        if let Some(existing) = self.packages.get_mut(&key) {
            let install_id = existing.install_id.clone();
            let installed_at = existing.installed_at.clone();
            *existing = record;
            existing.install_id = install_id;
            existing.installed_at = installed_at;
            existing.updated_at = rfc3339_now();
        } else {
            self.packages.insert(key, record);
        }
    }

    /// Remove the record under `key`, returning it if present.
    pub fn remove(&mut self, key: &str) -> Option<InstallRecord> {
        self.packages.shift_remove(key)
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::empty()
    }
}

/// A manifest written by a newer tool version than this build supports.
///
/// Distinct from ordinary corruption on purpose: resetting such a manifest
/// would silently discard state the newer tool still depends on.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("manifest schema version {found} is newer than supported version {supported}; upgrade the tool before retrying")]
pub struct SchemaVersionError {
    pub found: u64,
    pub supported: u32,
}

/// Result of interpreting a decoded manifest file.
#[derive(Clone, Debug)]
pub enum MigrationOutcome {
    /// The file parsed at the current schema version.
    Current(Manifest),
    /// The file was absent a version, older, or structurally invalid;
    /// Phase-1 policy is to start over from an empty manifest.
    Reset { reason: String },
}

/// Interpret arbitrary decoded JSON as a manifest.
///
/// Old or malformed input degrades to [`MigrationOutcome::Reset`]; input from
/// a newer schema fails with a typed [`SchemaVersionError`] so the caller
/// never silently runs against data written by a newer tool.
pub fn migrate(raw: Value) -> Result<MigrationOutcome, SchemaVersionError> {
    let Some(object) = raw.as_object() else {
        return Ok(MigrationOutcome::Reset {
            reason: "manifest root is not an object".to_string(),
        });
    };

    let version = match object.get("schema_version") {
        Some(value) => match value.as_u64() {
            Some(version) => version,
            None => {
                return Ok(MigrationOutcome::Reset {
                    reason: format!("schema_version is not an integer: {value}"),
                })
            }
        },
        None => {
            return Ok(MigrationOutcome::Reset {
                reason: "schema_version field is missing".to_string(),
            })
        }
    };

    if version > u64::from(SCHEMA_VERSION) {
        return Err(SchemaVersionError {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    if version < u64::from(SCHEMA_VERSION) {
        return Ok(MigrationOutcome::Reset {
            reason: format!("schema version {version} predates version {SCHEMA_VERSION}"),
        });
    }

    let manifest: Manifest = match serde_json::from_value(raw) {
        Ok(manifest) => manifest,
        Err(err) => {
            return Ok(MigrationOutcome::Reset {
                reason: format!("manifest does not match schema: {err}"),
            })
        }
    };

    if let Err(reason) = validate_structure(&manifest) {
        return Ok(MigrationOutcome::Reset { reason });
    }

    Ok(MigrationOutcome::Current(manifest))
}

/// Structural checks beyond what serde enforces; the file tolerates hand
/// edits between runs, so shape alone is not trusted.
fn validate_structure(manifest: &Manifest) -> Result<(), String> {
    for (key, record) in &manifest.packages {
        if record.install_id.is_empty() {
            return Err(format!("record {key} has an empty install_id"));
        }
        if record.package_name.is_empty() || record.agent.is_empty() {
            return Err(format!("record {key} is missing its name or agent"));
        }
        if !record.managed_root.is_absolute() {
            return Err(format!(
                "record {key} has a non-absolute managed_root: {}",
                record.managed_root.display()
            ));
        }
        if record.key() != *key {
            return Err(format!(
                "record {key} is stored under a key that does not match its fields"
            ));
        }
    }
    Ok(())
}
