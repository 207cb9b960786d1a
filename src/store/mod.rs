//! # Secret Store Access
//!
//! Client-side access to the 1Password secret store.
//!
//! Two credential sources are supported, modeled as a tagged variant with a
//! single authentication entry point:
//!
//! - [`Credentials::ServiceAccountToken`]: a service account token read from
//!   a local file, used against a Connect-style REST API.
//! - [`Credentials::DesktopAgent`]: delegated authentication through the
//!   locally signed-in desktop application, addressed by account name.
//!
//! Transient store failures are retried with bounded exponential backoff
//! expressed as a data-only [`RetryPolicy`]; lookup and authorization
//! failures are never retried.

pub mod agent;
pub mod connect;

use crate::config::VaultRef;
use crate::constants::{
    CONNECT_HOST_ENV, DEFAULT_CONNECT_HOST, DEFAULT_FETCH_ATTEMPTS, DEFAULT_RETRY_BASE_MS,
    DEFAULT_RETRY_MAX_MS,
};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

/// Errors establishing a session with the secret store
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("cannot read token file {path}: {source}")]
    TokenUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("token file {path} is empty or malformed")]
    TokenMalformed { path: PathBuf },
    #[error("desktop agent binary 'op' not found in PATH")]
    AgentBinaryMissing(#[source] which::Error),
    #[error("desktop agent account '{account}' is not usable: {reason}")]
    AgentUnavailable { account: String, reason: String },
    #[error("failed to initialize secret store client")]
    ClientInit(#[source] anyhow::Error),
}

/// Errors fetching a single secret
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("secret '{reference}' not found in the secret store")]
    NotFound { reference: String },
    #[error("access to secret '{reference}' was denied")]
    PermissionDenied { reference: String },
    #[error("secret store unavailable while fetching '{reference}': {source}")]
    Unavailable {
        reference: String,
        #[source]
        source: anyhow::Error,
    },
}

impl FetchError {
    /// Whether retrying could succeed
    ///
    /// Only IPC/network-layer failures are transient; `NotFound` and
    /// `PermissionDenied` indicate a configuration or authorization problem.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Unavailable { .. })
    }

    /// The vault reference the failure occurred on
    #[must_use]
    pub fn reference(&self) -> &str {
        match self {
            FetchError::NotFound { reference }
            | FetchError::PermissionDenied { reference }
            | FetchError::Unavailable { reference, .. } => reference,
        }
    }
}

/// A client capable of fetching individual secret values
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch the raw content of the secret at `reference`
    async fn fetch(&self, reference: &VaultRef) -> Result<Vec<u8>, FetchError>;
}

/// Credential source for a run; exactly one variant is active per run
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Service account token read from a local file
    ServiceAccountToken { path: PathBuf },
    /// Delegated authentication via the signed-in desktop application
    DesktopAgent { account: String },
}

impl Credentials {
    /// Authenticate against the secret store and return a usable session
    pub async fn authenticate(&self) -> Result<Session, AuthError> {
        match self {
            Credentials::ServiceAccountToken { path } => {
                let token = read_token(path)?;
                let host = std::env::var(CONNECT_HOST_ENV)
                    .unwrap_or_else(|_| DEFAULT_CONNECT_HOST.to_string());
                info!("Authenticating with service account token against {host}");
                let client = connect::ConnectClient::new(&host, token)
                    .map_err(AuthError::ClientInit)?;
                Ok(Session::new(Box::new(client), RetryPolicy::default()))
            }
            Credentials::DesktopAgent { account } => {
                info!("Authenticating via desktop app integration for account '{account}'");
                let client = agent::DesktopAgentClient::connect(account).await?;
                Ok(Session::new(Box::new(client), RetryPolicy::default()))
            }
        }
    }
}

/// Read and sanity-check a service account token file
fn read_token(path: &std::path::Path) -> Result<String, AuthError> {
    let raw = std::fs::read_to_string(path).map_err(|source| AuthError::TokenUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let token = raw.trim();
    if token.is_empty() || token.lines().count() > 1 {
        return Err(AuthError::TokenMalformed {
            path: path.to_path_buf(),
        });
    }
    Ok(token.to_string())
}

/// An authenticated session: a store client plus the run's retry policy
pub struct Session {
    store: Box<dyn SecretStore>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap a store client with a retry policy
    #[must_use]
    pub fn new(store: Box<dyn SecretStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Fetch a secret, retrying transient failures per the session policy
    ///
    /// The returned buffer is zeroed on drop.
    pub async fn fetch_secret(
        &self,
        reference: &VaultRef,
    ) -> Result<Zeroizing<Vec<u8>>, FetchError> {
        let bytes = fetch_with_retry(self.store.as_ref(), reference, &self.retry).await?;
        Ok(Zeroizing::new(bytes))
    }
}

/// Bounded exponential backoff for transient fetch failures
///
/// A data-only policy: the delay schedule is a pure function of the attempt
/// number, so the retry behavior is testable without a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts (first try included)
    pub max_attempts: u32,
    /// Delay before the first retry; doubles for each subsequent retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_FETCH_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_MS),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following completed attempt number `attempt`
    /// (zero-based): `base * 2^attempt`, capped at `max_delay`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        // Cap the shift so a large attempt count cannot overflow
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Fetch with uniform retry handling for transient failures
pub async fn fetch_with_retry(
    store: &dyn SecretStore,
    reference: &VaultRef,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, FetchError> {
    let mut attempt = 0;
    loop {
        match store.fetch(reference).await {
            Ok(bytes) => return Ok(bytes),
            Err(err) if err.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "Secret store unavailable for '{}' (attempt {}/{}), retrying in {:?}: {}",
                    reference,
                    attempt + 1,
                    policy.max_attempts,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
