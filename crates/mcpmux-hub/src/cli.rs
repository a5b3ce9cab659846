//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Multiplexing MCP hub: many upstream servers, one endpoint.
#[derive(Debug, Parser)]
#[command(name = "mcpmux", version, about)]
pub struct Cli {
    /// Subcommand.
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the hub.
    Serve {
        /// Path to the JSON config file.
        #[arg(long, value_name = "FILE")]
        config: PathBuf,

        /// Serve MCP over stdio (the default when --http is not given).
        #[arg(long)]
        stdio: bool,

        /// Serve MCP over streamable HTTP on this address (e.g.
        /// 127.0.0.1:3000). May be combined with --stdio.
        #[arg(long, value_name = "ADDR")]
        http: Option<String>,

        /// Log filter override (otherwise MCPMUX_LOG, default "info").
        #[arg(long, value_name = "FILTER")]
        log_level: Option<String>,
    },
}
