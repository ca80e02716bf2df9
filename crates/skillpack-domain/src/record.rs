use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Which manifest a record belongs to: per-project or per-user.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Project,
    User,
}

impl Scope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Project => "project",
            Scope::User => "user",
        }
    }
}

/// One installed package, keyed by (agent, scope, package name).
///
/// `managed_root` is the only path the system may delete on behalf of this
/// record; every other field is descriptive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub install_id: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_ref: Option<String>,
    pub resolved_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_subpath: Option<String>,
    pub package_name: String,
    pub package_relative_path: String,
    pub agent: String,
    pub scope: Scope,
    pub managed_root: PathBuf,
    pub installed_at: String,
    pub updated_at: String,
}

impl InstallRecord {
    /// Composite manifest key for this record.
    #[must_use]
    pub fn key(&self) -> String {
        manifest_key(&self.agent, self.scope, &self.package_name)
    }

    /// Refresh `updated_at` to the current instant.
    pub fn touch(&mut self) {
        self.updated_at = rfc3339_now();
    }
}

/// Deterministic composite key for one (agent, scope, package name) triple.
///
/// Agent and package names never contain `:` (see `validate_name`), so the
/// joined form is collision-free.
#[must_use]
pub fn manifest_key(agent: &str, scope: Scope, package_name: &str) -> String {
    format!("{agent}:{}:{package_name}", scope.as_str())
}

/// Current instant as an RFC 3339 string.
#[must_use]
pub fn rfc3339_now() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}
