//! # Desktop Agent Client
//!
//! Delegated authentication through the locally signed-in 1Password desktop
//! application, driven via the `op` CLI. No token file is consulted; the
//! account is addressed by name and must already be signed in.

use crate::config::VaultRef;
use crate::store::{AuthError, FetchError, SecretStore};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Secret store client backed by the `op` CLI and the desktop app agent
#[derive(Debug)]
pub struct DesktopAgentClient {
    op_binary: PathBuf,
    account: String,
}

impl DesktopAgentClient {
    /// Locate the `op` binary and verify the account is signed in
    pub async fn connect(account: &str) -> Result<Self, AuthError> {
        let op_binary = which::which("op").map_err(AuthError::AgentBinaryMissing)?;
        debug!("Using op binary at: {:?}", op_binary);

        let client = Self {
            op_binary,
            account: account.to_string(),
        };
        client.verify_signed_in().await?;
        Ok(client)
    }

    /// `op whoami` fails when the desktop agent has no session for the account
    async fn verify_signed_in(&self) -> Result<(), AuthError> {
        let output = Command::new(&self.op_binary)
            .arg("--account")
            .arg(&self.account)
            .arg("whoami")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| AuthError::AgentUnavailable {
                account: self.account.clone(),
                reason: format!("failed to invoke op: {e}"),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(AuthError::AgentUnavailable {
                account: self.account.clone(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl SecretStore for DesktopAgentClient {
    async fn fetch(&self, reference: &VaultRef) -> Result<Vec<u8>, FetchError> {
        let uri = format!(
            "op://{}/{}/{}",
            reference.vault, reference.item, reference.field
        );
        let output = Command::new(&self.op_binary)
            .arg("--account")
            .arg(&self.account)
            .arg("read")
            .arg(&uri)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| FetchError::Unavailable {
                reference: reference.to_string(),
                source: anyhow::Error::from(e).context("failed to invoke op"),
            })?;

        if output.status.success() {
            let mut bytes = output.stdout;
            // op read appends a trailing newline to the value
            if bytes.last() == Some(&b'\n') {
                bytes.pop();
            }
            Ok(bytes)
        } else {
            Err(classify_agent_failure(
                reference,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }
}

/// Classify an `op read` failure from its stderr output
fn classify_agent_failure(reference: &VaultRef, stderr: &str) -> FetchError {
    let lower = stderr.to_lowercase();
    if lower.contains("isn't a vault")
        || lower.contains("isn't an item")
        || lower.contains("isn't a field")
        || lower.contains("not found")
        || lower.contains("no such")
    {
        FetchError::NotFound {
            reference: reference.to_string(),
        }
    } else if lower.contains("not authorized")
        || lower.contains("access denied")
        || lower.contains("permission")
    {
        FetchError::PermissionDenied {
            reference: reference.to_string(),
        }
    } else {
        FetchError::Unavailable {
            reference: reference.to_string(),
            source: anyhow::anyhow!("op read failed: {}", stderr.trim()),
        }
    }
}
