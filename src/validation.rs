//! # Prerequisite Validation
//!
//! Pre-flight checks that run before anything touches the network: token
//! file hygiene and output directory accessibility.
//!
//! Token hygiene violations are warnings, not fatal errors: the run
//! proceeds so that previously materialized secrets stay usable even when
//! the credential has gone bad.

use crate::error::{Diagnostic, Stage};
use anyhow::Context;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::warn;

/// Token file hygiene findings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenWarning {
    /// The token file does not exist
    Missing,
    /// The token file exists but holds no content
    Empty,
    /// The token file is readable by everyone on the host
    WorldReadable,
}

impl fmt::Display for TokenWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenWarning::Missing => f.write_str("token file does not exist"),
            TokenWarning::Empty => f.write_str("token file is empty"),
            TokenWarning::WorldReadable => f.write_str("token file is world-readable"),
        }
    }
}

/// Inspect a service account token file without failing the run
#[must_use]
pub fn token_file_warnings(path: &Path) -> Vec<TokenWarning> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(_) => return vec![TokenWarning::Missing],
    };

    let mut warnings = Vec::new();
    if metadata.len() == 0 {
        warnings.push(TokenWarning::Empty);
    }
    if metadata.permissions().mode() & 0o004 != 0 {
        warnings.push(TokenWarning::WorldReadable);
    }
    warnings
}

/// Log token hygiene warnings; never fatal
pub fn warn_token_hygiene(path: &Path) {
    let warnings = token_file_warnings(path);
    for warning in &warnings {
        warn!("⚠️  {}: {}", path.display(), warning);
    }
    if !warnings.is_empty() {
        warn!("Continuing with existing secrets if available");
    }
}

/// Ensure the output directory exists and is writable
///
/// Probes writability by creating and removing a scratch file, so
/// permission problems surface before any fetch.
pub fn ensure_output_dir(dir: &Path) -> Result<(), Diagnostic> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("cannot create output directory {}", dir.display()))
        .map_err(|e| {
            Diagnostic::new(Stage::Preflight, dir.display().to_string(), e).with_suggestions([
                "Check permissions on the parent directory",
                "Pass a writable directory with --output",
            ])
        })?;

    let probe = dir.join(".opsync-probe");
    std::fs::write(&probe, b"probe")
        .with_context(|| format!("output directory {} is not writable", dir.display()))
        .map_err(|e| {
            Diagnostic::new(Stage::Preflight, dir.display().to_string(), e)
                .with_suggestions(["Check permissions on the output directory"])
        })?;
    // Cleanup is best effort
    let _ = std::fs::remove_file(&probe);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;

    #[test]
    fn test_missing_token_file_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = token_file_warnings(&dir.path().join("no-such-token"));
        assert_eq!(warnings, vec![TokenWarning::Missing]);
    }

    #[test]
    fn test_empty_token_file_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, b"").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o600)).unwrap();
        assert_eq!(token_file_warnings(&path), vec![TokenWarning::Empty]);
    }

    #[test]
    fn test_world_readable_token_file_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, b"ops_token").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();
        assert_eq!(token_file_warnings(&path), vec![TokenWarning::WorldReadable]);
    }

    #[test]
    fn test_well_kept_token_file_has_no_warnings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, b"ops_token").unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o600)).unwrap();
        assert!(token_file_warnings(&path).is_empty());
    }

    #[test]
    fn test_ensure_output_dir_creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/secrets");
        ensure_output_dir(&nested).unwrap();
        assert!(nested.is_dir());
    }
}
