use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay_config::{apply_env_overrides, load_config, validate_config, RelayConfig};

#[derive(Debug, Parser)]
#[command(name = "relay-server")]
struct Args {
    /// Path to the YAML configuration file. Defaults apply when absent.
    #[arg(long, default_value = "config/relay.yaml")]
    config: PathBuf,
    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = if args.config.exists() {
        load_config(&args.config)
            .with_context(|| format!("load config {}", args.config.display()))?
    } else {
        tracing::warn!(
            config = %args.config.display(),
            "config file not found; using defaults"
        );
        let mut config = RelayConfig::default();
        apply_env_overrides(&mut config);
        validate_config(&config).context("default config invalid")?;
        config
    };

    let listen = match args.listen {
        Some(listen) => listen,
        None => config
            .http
            .listen
            .parse()
            .with_context(|| format!("parse listen address '{}'", config.http.listen))?,
    };

    relay_server::run_server(config, listen).await
}
