//! # Secret Processor
//!
//! Fetches every configured secret, detects content changes against the
//! files currently on disk, and materializes changed secrets atomically.
//!
//! Processing is two-phase so that any fetch failure aborts the run before
//! a single destination file has been modified:
//!
//! 1. **Fetch**: a bounded worker pool fetches all secrets; results are
//!    aggregated in key order so the outcome is deterministic regardless of
//!    completion order.
//! 2. **Write**: per secret, the new content hash is compared against the
//!    current file; unchanged files are left alone (metadata re-asserted),
//!    changed files are written to a temp file, synced, and renamed into
//!    place. A destination is never observable partially written.

use crate::config::{SecretSpec, SecretsConfig};
use crate::constants::DEFAULT_FETCH_CONCURRENCY;
use crate::error::{Diagnostic, Stage};
use crate::store::{FetchError, Session};
use anyhow::Context;
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs::Permissions;
use std::io::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// A secret fetched from the store, alive only until it is written
struct FetchedSecret {
    key: String,
    content: Zeroizing<Vec<u8>>,
    digest: String,
}

/// Outcome of a processing run; immutable once produced
///
/// Both maps are keyed and iterated in secret-key order.
#[derive(Debug, Clone)]
pub struct ProcessResult {
    /// Number of secrets processed
    pub processed_count: usize,
    /// Destination path per secret key
    pub secret_paths: BTreeMap<String, PathBuf>,
    /// Whether each secret's on-disk content changed this run
    pub changed: BTreeMap<String, bool>,
}

impl ProcessResult {
    /// Keys whose content changed this run
    #[must_use]
    pub fn changed_keys(&self) -> BTreeSet<&str> {
        self.changed
            .iter()
            .filter(|(_, changed)| **changed)
            .map(|(key, _)| key.as_str())
            .collect()
    }
}

/// Orchestrates fetch, change detection, and atomic materialization
#[derive(Debug)]
pub struct Processor<'a> {
    session: &'a Session,
    output_dir: PathBuf,
    concurrency: usize,
}

impl<'a> Processor<'a> {
    /// Create a processor writing into `output_dir`
    #[must_use]
    pub fn new(session: &'a Session, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            session,
            output_dir: output_dir.into(),
            concurrency: DEFAULT_FETCH_CONCURRENCY,
        }
    }

    /// Override the fetch worker pool size
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Process all secrets in `config`
    ///
    /// Fail-fast: any fetch failure (including retry exhaustion) aborts
    /// before any destination file is modified. Config problems are
    /// rejected before any network call.
    pub async fn process(&self, config: &SecretsConfig) -> Result<ProcessResult, Diagnostic> {
        config.validate()?;

        let fetched = self.fetch_all(&config.secrets).await?;

        let mut secret_paths = BTreeMap::new();
        let mut changed = BTreeMap::new();
        for secret in &fetched {
            // Preflight guarantees exactly one spec per key
            let spec = config
                .secrets
                .iter()
                .find(|s| s.key == secret.key)
                .ok_or_else(|| {
                    Diagnostic::new(
                        Stage::Write,
                        secret.key.clone(),
                        anyhow::anyhow!("fetched secret has no matching spec"),
                    )
                })?;
            let destination = spec.resolved_path(&self.output_dir);
            let did_change = self.write_secret(spec, secret, &destination)?;
            if did_change {
                info!("Materialized secret '{}' to {}", secret.key, destination.display());
            } else {
                debug!("Secret '{}' unchanged, skipping write", secret.key);
            }
            secret_paths.insert(secret.key.clone(), destination);
            changed.insert(secret.key.clone(), did_change);
        }

        Ok(ProcessResult {
            processed_count: fetched.len(),
            secret_paths,
            changed,
        })
    }

    /// Fetch every secret with bounded concurrency, aggregating in key order
    async fn fetch_all(&self, specs: &[SecretSpec]) -> Result<Vec<FetchedSecret>, Diagnostic> {
        let mut fetched: Vec<FetchedSecret> = stream::iter(specs.iter().map(|spec| async move {
            let content = self
                .session
                .fetch_secret(&spec.vault_ref)
                .await
                .map_err(|err| fetch_diagnostic(spec, &err))?;
            let digest = hex_digest(&content);
            Ok::<FetchedSecret, Diagnostic>(FetchedSecret {
                key: spec.key.clone(),
                digest,
                content,
            })
        }))
        .buffer_unordered(self.concurrency)
        .try_collect()
        .await?;

        fetched.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(fetched)
    }

    /// Compare against the current file and write atomically when changed
    ///
    /// Returns whether the destination content changed. First-ever
    /// materialization of a path counts as changed.
    fn write_secret(
        &self,
        spec: &SecretSpec,
        secret: &FetchedSecret,
        destination: &Path,
    ) -> Result<bool, Diagnostic> {
        let parent = destination
            .parent()
            .unwrap_or(&self.output_dir)
            .to_path_buf();
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("cannot create directory {}", parent.display()))
            .map_err(|e| write_error(&secret.key, e))?;

        let previous_digest = match std::fs::read(destination) {
            Ok(bytes) => Some(hex_digest(&bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(write_error(
                    &secret.key,
                    anyhow::Error::from(e)
                        .context(format!("cannot read {}", destination.display())),
                ))
            }
        };
        let changed = previous_digest.as_deref() != Some(secret.digest.as_str());

        let mode = spec.mode_bits()?;
        if changed {
            let mut tmp = tempfile::Builder::new()
                .prefix(".opsync-")
                .tempfile_in(&parent)
                .with_context(|| format!("cannot create temp file in {}", parent.display()))
                .map_err(|e| write_error(&secret.key, e))?;

            tmp.write_all(&secret.content)
                .and_then(|()| tmp.as_file().sync_all())
                .with_context(|| format!("cannot write temp file for {}", secret.key))
                .map_err(|e| write_error(&secret.key, e))?;

            // Restrict permissions before the file becomes visible at its
            // destination path
            std::fs::set_permissions(tmp.path(), Permissions::from_mode(mode))
                .with_context(|| format!("cannot set mode on temp file for {}", secret.key))
                .map_err(|e| write_error(&secret.key, e))?;

            tmp.persist(destination)
                .with_context(|| format!("cannot move secret into {}", destination.display()))
                .map_err(|e| write_error(&secret.key, e))?;
        } else {
            // Config stays authoritative over metadata even without a
            // content change
            std::fs::set_permissions(destination, Permissions::from_mode(mode))
                .with_context(|| format!("cannot set mode on {}", destination.display()))
                .map_err(|e| write_error(&secret.key, e))?;
        }

        apply_ownership(spec, destination)?;
        Ok(changed)
    }
}

/// Lowercase hex SHA-256 of `data`
#[must_use]
pub fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Apply the requested owner/group, resolving names or numeric ids
fn apply_ownership(spec: &SecretSpec, destination: &Path) -> Result<(), Diagnostic> {
    if spec.owner.is_none() && spec.group.is_none() {
        return Ok(());
    }

    let uid = spec
        .owner
        .as_deref()
        .map(resolve_uid)
        .transpose()
        .map_err(|e| ownership_error(&spec.key, e))?;
    let gid = spec
        .group
        .as_deref()
        .map(resolve_gid)
        .transpose()
        .map_err(|e| ownership_error(&spec.key, e))?;

    nix::unistd::chown(destination, uid, gid)
        .with_context(|| format!("cannot change ownership of {}", destination.display()))
        .map_err(|e| ownership_error(&spec.key, e))
}

fn resolve_uid(owner: &str) -> anyhow::Result<nix::unistd::Uid> {
    if let Some(user) = nix::unistd::User::from_name(owner)
        .with_context(|| format!("cannot look up user '{owner}'"))?
    {
        return Ok(user.uid);
    }
    owner
        .parse::<u32>()
        .map(nix::unistd::Uid::from_raw)
        .with_context(|| format!("unknown user '{owner}'"))
}

fn resolve_gid(group: &str) -> anyhow::Result<nix::unistd::Gid> {
    if let Some(entry) = nix::unistd::Group::from_name(group)
        .with_context(|| format!("cannot look up group '{group}'"))?
    {
        return Ok(entry.gid);
    }
    group
        .parse::<u32>()
        .map(nix::unistd::Gid::from_raw)
        .with_context(|| format!("unknown group '{group}'"))
}

fn write_error(key: &str, cause: anyhow::Error) -> Diagnostic {
    Diagnostic::new(Stage::Write, format!("secret '{key}'"), cause).with_suggestions([
        "Check free space and permissions on the output directory",
    ])
}

fn ownership_error(key: &str, cause: anyhow::Error) -> Diagnostic {
    Diagnostic::new(Stage::Write, format!("secret '{key}'"), cause).with_suggestions([
        "Verify the configured owner and group exist on this host",
        "Changing file ownership requires running as root",
    ])
}

/// Map a fetch failure to a structured diagnostic naming the secret
fn fetch_diagnostic(spec: &SecretSpec, err: &FetchError) -> Diagnostic {
    let resource = format!("secret '{}' ({})", spec.key, spec.vault_ref);
    match err {
        FetchError::NotFound { .. } => Diagnostic::new(
            Stage::Fetch,
            resource,
            anyhow::anyhow!("{err}"),
        )
        .with_suggestions([
            "Verify the vault, item, and field names in the configuration",
            "Confirm the secret exists in the store",
        ]),
        FetchError::PermissionDenied { .. } => Diagnostic::new(
            Stage::Fetch,
            resource,
            anyhow::anyhow!("{err}"),
        )
        .with_suggestions([
            "Grant the service account read access to the vault",
            "Check that the credential has not been revoked",
        ]),
        FetchError::Unavailable { .. } => Diagnostic::new(
            Stage::Fetch,
            resource,
            anyhow::anyhow!("{err}"),
        )
        .with_suggestions([
            "Check network connectivity to the secret store",
            "Re-run once the store is reachable; retries were already exhausted",
        ]),
    }
}
