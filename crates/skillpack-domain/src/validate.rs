use std::path::Path;

use percent_encoding::percent_decode_str;
use thiserror::Error;

/// A rejected name, path, or file type. Carries every violation found, not
/// just the first, so callers can surface a complete error list.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("validation failed: {}", violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

impl ValidationError {
    #[must_use]
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    #[must_use]
    pub fn single(violation: impl Into<String>) -> Self {
        Self {
            violations: vec![violation.into()],
        }
    }
}

const NAME_MAX_LEN: usize = 128;

/// Check that a proposed package or agent name is safe to use in paths and
/// manifest keys.
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    if name.is_empty() || name.len() > NAME_MAX_LEN {
        violations.push(format!(
            "name must be between 1 and {NAME_MAX_LEN} characters, got {}",
            name.len()
        ));
    }
    if name == "." || name == ".." {
        violations.push("name must not be '.' or '..'".to_string());
    }
    if name
        .chars()
        .any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_'))
    {
        violations.push(
            "name may only contain lowercase ASCII letters, digits, '-' and '_'".to_string(),
        );
    }
    if name.starts_with('-') || name.starts_with('_') {
        violations.push("name must not start with '-' or '_'".to_string());
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(violations))
    }
}

/// Check that a relative path cannot escape the directory it is joined to.
///
/// Percent-decoding happens before the traversal check: an encoded `..` is an
/// equally valid attack vector. Both the raw and decoded segment lists are
/// checked because normalization alone can mask parent-directory transitions.
pub fn validate_relative_path(path: &str) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    if path.is_empty() {
        violations.push("path must not be empty".to_string());
    }
    if path.contains('\0') {
        violations.push("path must not contain NUL bytes".to_string());
    }
    if Path::new(path).is_absolute() || path.starts_with('/') || path.starts_with('\\') {
        violations.push("path must be relative".to_string());
    }

    let decoded = percent_decode_str(path).decode_utf8_lossy();
    if has_parent_segment(path) {
        violations.push("path must not contain '..' components".to_string());
    } else if decoded != path && has_parent_segment(&decoded) {
        violations.push("path must not contain encoded '..' components".to_string());
    }
    if decoded.contains('\0') && !path.contains('\0') {
        violations.push("path must not contain encoded NUL bytes".to_string());
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(violations))
    }
}

fn has_parent_segment(path: &str) -> bool {
    path.split(['/', '\\']).any(|segment| segment == "..")
}

/// Extensions that are never published into a target, compared
/// case-insensitively against the end of the filename.
///
/// This is a denylist, not a sandbox: it stops accidental or careless
/// payloads, not a determined adversary with a novel extension.
const BLOCKED_EXTENSIONS: &[&str] = &[
    ".exe", ".dll", ".so", ".dylib", ".bin", ".com", ".msi", ".scr", ".bat", ".cmd", ".ps1",
    ".sh", ".bash", ".zsh", ".fish", ".deb", ".rpm", ".app",
];

/// Whether a filename ends in a denylisted executable/script extension.
#[must_use]
pub fn is_blocked_file_type(filename: &str) -> bool {
    let lowered = filename.to_ascii_lowercase();
    BLOCKED_EXTENSIONS
        .iter()
        .any(|ext| lowered.ends_with(ext))
}
