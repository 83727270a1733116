//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// TLS Guard - mTLS identity and IP/header allowlisting in front of an HTTP upstream
#[derive(Parser, Debug)]
#[command(name = "tls-guard")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML or JSON)
    #[arg(short, long, env = "TLS_GUARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Address to listen on (overrides `server.listen`)
    #[arg(short, long, env = "TLS_GUARD_LISTEN")]
    pub listen: Option<String>,

    /// Upstream base URL (overrides `server.upstream`)
    #[arg(short, long, env = "TLS_GUARD_UPSTREAM")]
    pub upstream: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TLS_GUARD_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TLS_GUARD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the guard server (default)
    Serve,

    /// Build the identity directory and rule snapshot once, print a summary and exit
    Check,
}
