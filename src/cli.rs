//! # opsync CLI
//!
//! Command-line interface for materializing secrets and reconciling
//! dependent services.
//!
//! ## Usage
//!
//! ```bash
//! # Fetch secrets with a service account token and reconcile services
//! opsync secret --config secrets.json --output /var/lib/opsync/secrets
//!
//! # Authenticate through the signed-in desktop app instead of a token file
//! opsync secret --desktop-integration my-team.1password.com
//!
//! # Validate a configuration without contacting the secret store
//! opsync check --config secrets.json
//! ```

use crate::config::SecretsConfig;
use crate::constants::{
    DEFAULT_CONFIG_PATH, DEFAULT_OUTPUT_DIR, DEFAULT_SERVICE_ACTION_TIMEOUT_SECS,
    DEFAULT_TOKEN_PATH,
};
use crate::error::{Diagnostic, Stage};
use crate::processor::Processor;
use crate::runlock::RunLock;
use crate::store::Credentials;
use crate::systemd::Systemctl;
use crate::{reconciler, validation};
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Materialize 1Password secrets and reconcile dependent systemd units
#[derive(Debug, Parser)]
#[command(name = "opsync", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Retrieve secrets and restart/reload services whose secrets changed
    Secret(SecretArgs),
    /// Validate the configuration without contacting the secret store
    Check(CheckArgs),
}

#[derive(Debug, Args)]
struct SecretArgs {
    /// Path to the secrets configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Directory to store retrieved secrets
    #[arg(long, default_value = DEFAULT_OUTPUT_DIR)]
    output: PathBuf,

    /// Path to the file containing the 1Password service account token
    #[arg(long, default_value = DEFAULT_TOKEN_PATH)]
    token_file: PathBuf,

    /// Account name for 1Password desktop app integration; overrides
    /// --token-file and authenticates through the desktop app
    #[arg(long, value_name = "ACCOUNT")]
    desktop_integration: Option<String>,
}

#[derive(Debug, Args)]
struct CheckArgs {
    /// Path to the secrets configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

/// Run the parsed command; a returned error means a non-zero exit
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Secret(args) => run_secret(args).await,
        Commands::Check(args) => run_check(&args),
    }
}

async fn run_secret(args: SecretArgs) -> Result<()> {
    // Pre-flight: config file present, output directory usable, token hygiene
    if !args.config.exists() {
        return Err(Diagnostic::new(
            Stage::Preflight,
            args.config.display().to_string(),
            anyhow::anyhow!("configuration file does not exist"),
        )
        .with_suggestions([
            "Create the configuration file or pass its location with --config",
        ])
        .into());
    }
    validation::ensure_output_dir(&args.output)?;

    let credentials = match &args.desktop_integration {
        Some(account) => Credentials::DesktopAgent {
            account: account.clone(),
        },
        None => {
            validation::warn_token_hygiene(&args.token_file);
            Credentials::ServiceAccountToken {
                path: args.token_file.clone(),
            }
        }
    };

    let config = SecretsConfig::load(&args.config)?;
    info!("Loaded configuration with {} secrets", config.secrets.len());

    // The lock covers the whole run so overlapping invocations cannot
    // interleave writes; the guard releases it on every exit path.
    let _lock = RunLock::acquire(&args.output)?;

    let session = credentials.authenticate().await.map_err(|err| {
        Diagnostic::new(Stage::Auth, credential_resource(&args), err).with_suggestions([
            "Check that the service account token is valid and not expired",
            "For desktop integration, sign in to the desktop app first",
        ])
    })?;
    info!("Authenticated against the secret store");

    let result = Processor::new(&session, args.output.clone())
        .process(&config)
        .await?;
    info!(
        "Successfully processed {} secrets to {}",
        result.processed_count,
        args.output.display()
    );

    if config.systemd_integration.enable {
        let plan = reconciler::build_plan(&result, &config.systemd_integration);
        if plan.is_empty() {
            info!("No secrets changed for bound services; nothing to reconcile");
        } else {
            info!("Reconciling {} service(s)", plan.len());
            let manager = Systemctl::discover().map_err(|err| {
                Diagnostic::new(Stage::Reconcile, "systemd integration", err).with_suggestions([
                    "Ensure systemctl is available in PATH",
                    "Check if running on a systemd-enabled system",
                    "Consider disabling systemd integration if not needed",
                ])
            })?;
            let timeout = Duration::from_secs(DEFAULT_SERVICE_ACTION_TIMEOUT_SECS);
            let report = reconciler::reconcile(&manager, &plan, timeout).await;
            for action in &report.succeeded {
                info!("Service {} handled ({})", action.unit, action.action);
            }
            report.into_result()?;
        }
    }

    Ok(())
}

fn run_check(args: &CheckArgs) -> Result<()> {
    let config = SecretsConfig::load(&args.config)?;
    info!(
        "Configuration OK: {} secrets, {} service binding(s)",
        config.secrets.len(),
        config.systemd_integration.services.len()
    );
    Ok(())
}

fn credential_resource(args: &SecretArgs) -> String {
    match &args.desktop_integration {
        Some(account) => format!("desktop account '{account}'"),
        None => format!("token file {}", args.token_file.display()),
    }
}
