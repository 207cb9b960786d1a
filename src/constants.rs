//! # Constants
//!
//! Shared defaults used throughout opsync.
//!
//! These values represent reasonable defaults and can be overridden via
//! command-line flags or environment variables where applicable.

/// Default path of the file holding the 1Password service account token
pub const DEFAULT_TOKEN_PATH: &str = "/etc/opsync-token";

/// Default secrets configuration file
pub const DEFAULT_CONFIG_PATH: &str = "secrets.json";

/// Default output directory for materialized secrets
pub const DEFAULT_OUTPUT_DIR: &str = "secrets";

/// Default 1Password Connect endpoint, overridable via [`CONNECT_HOST_ENV`]
pub const DEFAULT_CONNECT_HOST: &str = "http://localhost:8080";

/// Environment variable overriding the Connect endpoint
pub const CONNECT_HOST_ENV: &str = "OP_CONNECT_HOST";

/// Default mode for materialized secret files (owner read/write only)
pub const DEFAULT_FILE_MODE: u32 = 0o600;

/// Default number of concurrent secret fetches
pub const DEFAULT_FETCH_CONCURRENCY: usize = 4;

/// Default number of fetch attempts for transient secret store failures
pub const DEFAULT_FETCH_ATTEMPTS: u32 = 3;

/// Default starting delay between fetch retries (milliseconds, doubles per attempt)
pub const DEFAULT_RETRY_BASE_MS: u64 = 500;

/// Default cap on the delay between fetch retries (milliseconds)
pub const DEFAULT_RETRY_MAX_MS: u64 = 5_000;

/// Default per-call timeout for service control actions (seconds)
pub const DEFAULT_SERVICE_ACTION_TIMEOUT_SECS: u64 = 30;

/// Name of the run-scoped lock file inside the output directory
pub const RUN_LOCK_FILE: &str = ".opsync.lock";
