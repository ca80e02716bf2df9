use std::env;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dirs_next::home_dir;

use skillpack_domain::{InstallRecord, Scope, ValidationError};

const MANIFEST_DIR: &str = ".skillpack";
const MANIFEST_FILE: &str = "manifest.json";

/// Where manifests live and which directories installed packages may occupy.
///
/// An explicit value threaded through every operation that needs it; there is
/// no process-global layout. Tests construct one over temp directories.
#[derive(Clone, Debug)]
pub struct TargetLayout {
    project_root: PathBuf,
    user_root: PathBuf,
}

impl TargetLayout {
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>, user_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            user_root: user_root.into(),
        }
    }

    /// Layout rooted at the current working directory and the invoking
    /// user's home directory.
    pub fn discover() -> Result<Self> {
        let project_root = env::current_dir().context("failed to resolve current directory")?;
        let user_root = home_dir().ok_or_else(|| anyhow!("unable to determine home directory"))?;
        Ok(Self::new(project_root, user_root))
    }

    #[must_use]
    pub fn scope_root(&self, scope: Scope) -> &Path {
        match scope {
            Scope::Project => &self.project_root,
            Scope::User => &self.user_root,
        }
    }

    /// Path of the persisted manifest for `scope`.
    #[must_use]
    pub fn manifest_path(&self, scope: Scope) -> PathBuf {
        self.scope_root(scope).join(MANIFEST_DIR).join(MANIFEST_FILE)
    }

    /// Directories under which every `managed_root` for this (agent, scope)
    /// pair must fall.
    #[must_use]
    pub fn scan_roots(&self, agent: &str, scope: Scope) -> Vec<PathBuf> {
        vec![self
            .scope_root(scope)
            .join(format!(".{agent}"))
            .join("skills")]
    }

    /// Conventional install target for one package.
    #[must_use]
    pub fn skill_target(&self, agent: &str, scope: Scope, package_name: &str) -> PathBuf {
        self.scope_root(scope)
            .join(format!(".{agent}"))
            .join("skills")
            .join(package_name)
    }

    /// Mutation-time check that a record's `managed_root` falls under a scan
    /// root for its (agent, scope) pair.
    ///
    /// Checked on every write, not just on read, to defend against records
    /// whose target convention changed between tool versions.
    pub fn ensure_managed_root_allowed(&self, record: &InstallRecord) -> Result<(), ValidationError> {
        if !record.managed_root.is_absolute() {
            return Err(ValidationError::single(format!(
                "managed_root must be absolute: {}",
                record.managed_root.display()
            )));
        }
        let roots = self.scan_roots(&record.agent, record.scope);
        if roots.iter().any(|root| record.managed_root.starts_with(root)
            && record.managed_root != *root)
        {
            Ok(())
        } else {
            Err(ValidationError::single(format!(
                "managed_root {} is outside the scan roots for agent '{}' in {} scope",
                record.managed_root.display(),
                record.agent,
                record.scope.as_str()
            )))
        }
    }
}
