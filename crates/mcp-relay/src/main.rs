use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};
use relay_server::{RuntimeOptions, run};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            config,
            http_host,
            http_port,
            stdio,
            token,
            watch,
        } => {
            let metrics = match relay_server::run::install_metrics_recorder() {
                Ok(handle) => Some(handle),
                Err(error) => {
                    tracing::warn!(error = %error, "metrics recorder unavailable");
                    None
                }
            };
            run(
                RuntimeOptions {
                    config_path: config,
                    http_host,
                    http_port,
                    stdio,
                    token,
                    watch,
                },
                metrics,
            )
            .await?;
        }
        Commands::CheckConfig { config } => {
            let normalized = relay_config::load_config(&config)?;
            println!("configuration OK: {}", config.display());
            println!("  upstreams: {}", normalized.upstreams.len());
            for (name, upstream) in &normalized.upstreams {
                println!(
                    "    {name} ({}, {})",
                    upstream.transport.label(),
                    if upstream.enabled { "enabled" } else { "disabled" }
                );
            }
            println!("  projects: {}", normalized.projects.len());
            println!("  tokens: {}", normalized.auth.tokens.len());
            println!(
                "  auth: {}",
                if normalized.auth.enabled() {
                    "enabled"
                } else {
                    "disabled (anonymous)"
                }
            );
        }
    }

    Ok(())
}
