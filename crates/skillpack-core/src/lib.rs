#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod error;
pub mod installer;
pub mod layout;
pub mod lock;
pub mod store;
pub mod transaction;

pub use error::InstallError;
pub use installer::{install_staged, InstallStep, StagedInstall};
pub use layout::TargetLayout;
pub use lock::LockOptions;
pub use store::{new_install_id, ManifestStore, RemoveReport};
pub use transaction::{apply_install, execute_transaction, ApplyReport, TransactionOutcome};

pub use skillpack_domain::{
    is_blocked_file_type, manifest_key, migrate, rfc3339_now, validate_name,
    validate_relative_path, InstallRecord, Manifest, MigrationOutcome, SchemaVersionError, Scope,
    ValidationError, SCHEMA_VERSION,
};
