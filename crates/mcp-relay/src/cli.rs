use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mcp-relay", version, about = "Request router for MCP tool servers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay.
    Serve {
        /// Path to the configuration file (strict JSON).
        #[arg(long, default_value = "relay.json")]
        config: PathBuf,
        /// Override the HTTP listen host.
        #[arg(long)]
        http_host: Option<String>,
        /// Override the HTTP listen port.
        #[arg(long)]
        http_port: Option<u16>,
        /// Also serve a single session over this process's stdio.
        #[arg(long)]
        stdio: bool,
        /// Token binding the stdio session's principal.
        #[arg(long)]
        token: Option<String>,
        /// Watch the config file and hot-reload on change.
        #[arg(long)]
        watch: bool,
    },
    /// Validate a configuration file and print a summary.
    CheckConfig {
        /// Path to the configuration file.
        config: PathBuf,
    },
}
