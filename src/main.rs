use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opsync=info".into()),
        )
        .init();

    let cli = opsync::cli::Cli::parse();
    opsync::cli::run(cli).await
}
