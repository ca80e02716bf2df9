#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

pub mod manifest;
pub mod record;
pub mod validate;

pub use manifest::{migrate, Manifest, MigrationOutcome, SchemaVersionError, SCHEMA_VERSION};
pub use record::{manifest_key, rfc3339_now, InstallRecord, Scope};
pub use validate::{
    is_blocked_file_type, validate_name, validate_relative_path, ValidationError,
};
