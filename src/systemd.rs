//! # Service Control
//!
//! Boundary to the host's service manager. The [`ServiceManager`] trait is
//! the only surface the reconciler talks to; [`Systemctl`] is the real
//! implementation, shelling out to `systemctl` with piped stdio.

use crate::config::ServiceAction;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Errors from a single service control action
#[derive(Debug, Error)]
pub enum ServiceControlError {
    #[error("systemctl binary not found in PATH")]
    BinaryMissing(#[source] which::Error),
    #[error("failed to invoke systemctl for unit '{unit}': {source}")]
    Spawn {
        unit: String,
        #[source]
        source: std::io::Error,
    },
    #[error("systemctl {verb} {unit} exited with {status}: {stderr}")]
    CommandFailed {
        unit: String,
        verb: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

/// Abstraction over the host's service manager
#[async_trait]
pub trait ServiceManager: Send + Sync {
    /// Perform `action` on `unit`
    async fn perform(&self, unit: &str, action: ServiceAction) -> Result<(), ServiceControlError>;
}

/// Service manager backed by the `systemctl` binary
#[derive(Debug)]
pub struct Systemctl {
    binary: PathBuf,
}

impl Systemctl {
    /// Locate `systemctl` in PATH
    pub fn discover() -> Result<Self, ServiceControlError> {
        let binary = which::which("systemctl").map_err(ServiceControlError::BinaryMissing)?;
        debug!("Using systemctl binary at: {:?}", binary);
        Ok(Self { binary })
    }
}

#[async_trait]
impl ServiceManager for Systemctl {
    async fn perform(&self, unit: &str, action: ServiceAction) -> Result<(), ServiceControlError> {
        let verb = action.verb();
        let output = Command::new(&self.binary)
            .arg(verb)
            .arg(unit)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| ServiceControlError::Spawn {
                unit: unit.to_string(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ServiceControlError::CommandFailed {
                unit: unit.to_string(),
                verb,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}
