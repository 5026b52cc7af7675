//! Bench probe: open every configured instrument, print its identity and
//! drain its error queue. A quick sanity pass before a measurement run.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rust_scpi::scpi::ScpiSession;
use rust_scpi::transport::open_resource;
use rust_scpi::Settings;

#[derive(Parser, Debug)]
#[command(name = "scpi_probe", about = "Identify and check configured instruments")]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Probe a single resource string instead of the configuration.
    #[arg(short, long)]
    resource: Option<String>,

    /// Per-instrument timeout in seconds.
    #[arg(short, long, default_value_t = 3)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Some(resource) = &args.resource {
        probe(resource, Duration::from_secs(args.timeout)).await?;
        return Ok(());
    }

    let settings = Settings::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(config = %args.config.display(), "probing configured instruments");

    let mut failures = 0usize;
    for def in settings.enabled_instruments() {
        println!("{} ({}) @ {}", def.id, def.instrument_type, def.resource);
        match probe(&def.resource, settings.timeout_for(def)).await {
            Ok(()) => {}
            Err(e) => {
                failures += 1;
                error!(id = %def.id, error = %format!("{e:#}"), "probe failed");
                println!("  UNREACHABLE: {e:#}");
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} instrument(s) unreachable");
    }
    Ok(())
}

async fn probe(resource: &str, timeout: Duration) -> Result<()> {
    let transport = open_resource(resource, timeout).await?;
    let session = ScpiSession::new(transport);

    let identity = session.idn().await.context("*IDN? failed")?;
    println!(
        "  {} {} (serial {}, firmware {})",
        identity.vendor, identity.model, identity.serial, identity.firmware
    );

    let errors = session.drain_errors().await.unwrap_or_default();
    if errors.is_empty() {
        println!("  error queue: clean");
    } else {
        for (code, message) in errors {
            println!("  error queue: {code} {message}");
        }
    }
    session.close().await?;
    Ok(())
}
