//! # Secrets Configuration
//!
//! Configuration model for a run: which secrets to materialize, where they
//! land on disk, and which systemd units depend on them.
//!
//! Loaded from a JSON file of the shape:
//!
//! ```json
//! {
//!   "secrets": [
//!     {
//!       "key": "db-password",
//!       "vaultRef": { "vault": "Infra", "item": "postgres", "field": "password" },
//!       "outputFile": "db-password",
//!       "owner": "postgres",
//!       "group": "postgres",
//!       "mode": "0600"
//!     }
//!   ],
//!   "systemdIntegration": {
//!     "enable": true,
//!     "services": [
//!       { "name": "postgres.service", "dependsOnKeys": ["db-password"], "action": "restart" }
//!     ]
//!   }
//! }
//! ```

use crate::constants::DEFAULT_FILE_MODE;
use crate::error::{Diagnostic, Stage};
use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Top-level secrets configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsConfig {
    /// Secrets to materialize, in declaration order
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,
    /// Optional systemd reconciliation configuration
    #[serde(default)]
    pub systemd_integration: SystemdIntegration,
}

/// Systemd reconciliation configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemdIntegration {
    /// Whether to restart/reload dependent units after materialization
    #[serde(default)]
    pub enable: bool,
    /// Unit bindings, in declaration order (plan order is reproducible)
    #[serde(default)]
    pub services: Vec<ServiceBinding>,
}

/// Binds a systemd unit to the secret keys it depends on
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBinding {
    /// Unit name, e.g. `postgres.service`
    pub name: String,
    /// Secret keys this unit depends on
    #[serde(default)]
    pub depends_on_keys: Vec<String>,
    /// Action to take when a dependency changed
    #[serde(default)]
    pub action: ServiceAction,
}

/// Action performed on a unit whose secrets changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    /// Full unit restart (default)
    #[default]
    Restart,
    /// In-place configuration reload
    Reload,
}

impl ServiceAction {
    /// The systemctl verb for this action
    #[must_use]
    pub fn verb(&self) -> &'static str {
        match self {
            ServiceAction::Restart => "restart",
            ServiceAction::Reload => "reload",
        }
    }
}

impl fmt::Display for ServiceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.verb())
    }
}

/// A single secret to materialize
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    /// Unique key within the configuration
    pub key: String,
    /// Where the secret lives in the store
    pub vault_ref: VaultRef,
    /// Output file path, relative to the output directory
    pub output_file: String,
    /// Owning user of the materialized file (name or numeric id)
    #[serde(default)]
    pub owner: Option<String>,
    /// Owning group of the materialized file (name or numeric id)
    #[serde(default)]
    pub group: Option<String>,
    /// Octal file mode string, e.g. "0600" (the default)
    #[serde(default)]
    pub mode: Option<String>,
}

impl SecretSpec {
    /// Destination path of this secret under `output_dir`
    #[must_use]
    pub fn resolved_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(&self.output_file)
    }

    /// Parsed file mode bits, defaulting to owner read/write only
    pub fn mode_bits(&self) -> Result<u32, Diagnostic> {
        match &self.mode {
            None => Ok(DEFAULT_FILE_MODE),
            Some(raw) => parse_mode(raw).map_err(|e| {
                Diagnostic::new(Stage::Config, format!("secret {}", self.key), e)
                    .with_suggestions(["Use an octal mode string such as \"0600\" or \"0640\""])
            }),
        }
    }
}

/// Addresses a secret in the store by vault, item, and field
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct VaultRef {
    /// Vault id or name
    pub vault: String,
    /// Item id or title within the vault
    pub item: String,
    /// Field id or label within the item
    pub field: String,
}

impl fmt::Display for VaultRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.vault, self.item, self.field)
    }
}

impl SecretsConfig {
    /// Load and validate a configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, Diagnostic> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))
            .map_err(|e| {
                Diagnostic::new(Stage::Config, path.display().to_string(), e).with_suggestions([
                    "Check that the configuration file exists and is readable",
                    "Pass an explicit path with --config",
                ])
            })?;

        let config: SecretsConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", path.display()))
            .map_err(|e| {
                Diagnostic::new(Stage::Config, path.display().to_string(), e).with_suggestions([
                    "Validate the file with a JSON linter",
                    "Compare the structure against the documented configuration format",
                ])
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Pre-flight validation: runs before any network call or write
    ///
    /// Rejects duplicate keys, duplicate resolved output paths, malformed
    /// specs, and bindings referencing undeclared keys.
    pub fn validate(&self) -> Result<(), Diagnostic> {
        let mut keys: HashSet<&str> = HashSet::new();
        let mut paths: HashMap<PathBuf, &str> = HashMap::new();

        for spec in &self.secrets {
            validate_key(&spec.key)?;

            if !keys.insert(spec.key.as_str()) {
                return Err(config_error(
                    &spec.key,
                    anyhow::anyhow!("duplicate secret key '{}'", spec.key),
                    ["Give every secret in the configuration a unique key"],
                ));
            }

            if spec.vault_ref.vault.is_empty()
                || spec.vault_ref.item.is_empty()
                || spec.vault_ref.field.is_empty()
            {
                return Err(config_error(
                    &spec.key,
                    anyhow::anyhow!("vault reference must set vault, item, and field"),
                    ["Fill in vaultRef.vault, vaultRef.item, and vaultRef.field"],
                ));
            }

            let output = validate_output_file(&spec.key, &spec.output_file)?;
            if let Some(other) = paths.insert(output, spec.key.as_str()) {
                return Err(config_error(
                    &spec.key,
                    anyhow::anyhow!(
                        "output file '{}' is already used by secret '{}'",
                        spec.output_file,
                        other
                    ),
                    ["Give every secret a distinct output file"],
                ));
            }

            // Surface bad mode strings before any fetch
            spec.mode_bits()?;
        }

        for binding in &self.systemd_integration.services {
            if binding.name.is_empty() {
                return Err(config_error(
                    "systemd integration",
                    anyhow::anyhow!("service binding with empty name"),
                    ["Set the unit name on every service binding"],
                ));
            }
            for key in &binding.depends_on_keys {
                if !keys.contains(key.as_str()) {
                    return Err(config_error(
                        &binding.name,
                        anyhow::anyhow!(
                            "service '{}' depends on undeclared secret key '{}'",
                            binding.name,
                            key
                        ),
                        ["List only keys that appear in the secrets section"],
                    ));
                }
            }
        }

        Ok(())
    }
}

fn config_error<const N: usize>(
    resource: &str,
    cause: anyhow::Error,
    suggestions: [&str; N],
) -> Diagnostic {
    Diagnostic::new(Stage::Config, resource, cause).with_suggestions(suggestions)
}

/// Secret keys: alphanumeric plus `.`, `_`, `-`, 1-255 characters
fn validate_key(key: &str) -> Result<(), Diagnostic> {
    if key.is_empty() {
        return Err(config_error(
            "secret",
            anyhow::anyhow!("secret key cannot be empty"),
            ["Set a non-empty key on every secret"],
        ));
    }
    if key.len() > 255 {
        return Err(config_error(
            key,
            anyhow::anyhow!("secret key exceeds maximum length of 255 characters"),
            ["Shorten the secret key"],
        ));
    }
    let key_regex = Regex::new(r"^[a-zA-Z0-9._-]+$").map_err(|e| {
        Diagnostic::new(
            Stage::Config,
            key,
            anyhow::anyhow!("failed to compile regex: {e}"),
        )
    })?;
    if !key_regex.is_match(key) {
        return Err(config_error(
            key,
            anyhow::anyhow!(
                "secret key '{key}' must contain only alphanumeric characters, dots, hyphens, and underscores"
            ),
            ["Rename the key to match [a-zA-Z0-9._-]+"],
        ));
    }
    Ok(())
}

/// Output files stay inside the output directory: relative, no `..`
fn validate_output_file(key: &str, output_file: &str) -> Result<PathBuf, Diagnostic> {
    if output_file.is_empty() {
        return Err(config_error(
            key,
            anyhow::anyhow!("outputFile cannot be empty"),
            ["Set an output file name on every secret"],
        ));
    }
    let path = PathBuf::from(output_file);
    if path.is_absolute() {
        return Err(config_error(
            key,
            anyhow::anyhow!("outputFile '{output_file}' must be relative to the output directory"),
            ["Use a relative path; the output directory is set with --output"],
        ));
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(config_error(
            key,
            anyhow::anyhow!("outputFile '{output_file}' must not contain '..'"),
            ["Use a path that stays inside the output directory"],
        ));
    }
    Ok(path)
}

/// Parse an octal mode string like "0600" or "640"
fn parse_mode(raw: &str) -> anyhow::Result<u32> {
    let trimmed = raw.trim().trim_start_matches("0o");
    let bits = u32::from_str_radix(trimmed, 8)
        .with_context(|| format!("'{raw}' is not a valid octal file mode"))?;
    if bits > 0o7777 {
        anyhow::bail!("mode '{raw}' is out of range");
    }
    Ok(bits)
}
