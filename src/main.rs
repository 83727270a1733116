//! TLS Guard - mTLS identity and IP/header allowlisting proxy

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use tls_guard::{
    Result,
    cli::{Cli, Command},
    config::{Config, format_duration},
    external_data::HttpDataSource,
    guard::Guard,
    interfaces::ProcNetInterfaces,
    server, setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(ref listen) = cli.listen {
                config.server.listen.clone_from(listen);
            }
            if let Some(ref upstream) = cli.upstream {
                config.server.upstream.clone_from(upstream);
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Check) => run_check(&config).await,
        Some(Command::Serve) | None => run_server(&config).await,
    }
}

async fn build_guard(config: &Config) -> Result<Guard> {
    let data_source = HttpDataSource::new(config.guard.refresh_timeout)?;
    Guard::from_config(
        &config.guard,
        Arc::new(data_source),
        Arc::new(ProcNetInterfaces::default()),
    )
    .await
}

/// Build everything once and print what was built.
async fn run_check(config: &Config) -> ExitCode {
    let guard = match build_guard(config).await {
        Ok(g) => g,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("✅ Configuration is valid\n");
    println!("Users:            {}", guard.directory().len());
    println!(
        "Refresh interval: {}",
        config
            .guard
            .refresh_interval
            .map_or_else(|| "never".to_string(), format_duration)
    );
    println!("Request headers:  {}", config.guard.request_headers.len());

    match guard.snapshots() {
        Some(store) => {
            let snapshot = store.current();
            println!("Rules:            {}\n", snapshot.roots().len());
            for root in snapshot.roots() {
                print!("{}", root.outline());
            }
        }
        None => println!("Rules:            none (client certificate required)"),
    }

    ExitCode::SUCCESS
}

async fn run_server(config: &Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.server.listen,
        upstream = %config.server.upstream,
        tls = config.server.tls.is_some(),
        users = config.guard.users.len(),
        rules = config.guard.rules.len(),
        "Starting TLS Guard"
    );

    let guard = match build_guard(config).await {
        Ok(g) => Arc::new(g),
        Err(e) => {
            error!("Failed to build guard: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server::run(&config.server, guard).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
