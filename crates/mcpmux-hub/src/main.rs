//! The `mcpmux` binary.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use mcpmux_hub::cli::{Cli, Command};
use mcpmux_hub::config::HubConfig;
use mcpmux_hub::hub::Hub;
use mcpmux_hub::{http, stdio};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            config,
            stdio,
            http,
            log_level,
        } => serve(config, stdio, http, log_level).await,
    }
}

async fn serve(
    config_path: std::path::PathBuf,
    stdio_flag: bool,
    http_addr: Option<String>,
    log_level: Option<String>,
) -> ExitCode {
    init_logging(log_level.as_deref());

    let config = match HubConfig::load(&config_path) {
        Ok(config) => config,
        Err(error) => {
            // Startup config errors are fatal: exit code 1.
            eprintln!("mcpmux: {error}");
            return ExitCode::FAILURE;
        }
    };

    let serve_stdio = stdio_flag || http_addr.is_none();
    let hub = Hub::new(config);
    hub.start().await;

    let mut http_task = None;
    if let Some(addr) = &http_addr {
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(bind_error) => {
                error!(%addr, error = %bind_error, "cannot bind HTTP endpoint");
                hub.shutdown().await;
                return ExitCode::FAILURE;
            }
        };
        info!(%addr, "serving streamable HTTP");
        let app = http::app(Arc::clone(&hub));
        let shutdown = hub.shutdown_token();
        http_task = Some(tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(error) = result {
                error!(%error, "HTTP endpoint stopped with error");
            }
        }));
    }

    // The hub runs until the stdio peer goes away (stdio mode) or a signal
    // arrives.
    let stdio_hub = Arc::clone(&hub);
    let stdio_task = serve_stdio.then(|| {
        info!("serving MCP over stdio");
        tokio::spawn(async move {
            if let Err(error) = stdio::serve(stdio_hub).await {
                error!(%error, "stdio endpoint failed");
            }
        })
    });

    wait_for_exit_signal(stdio_task).await;

    hub.shutdown().await;
    if let Some(task) = http_task {
        let _ = task.await;
    }
    ExitCode::SUCCESS
}

async fn wait_for_exit_signal(stdio_task: Option<tokio::task::JoinHandle<()>>) {
    let stdio_done = async {
        match stdio_task {
            Some(task) => {
                let _ = task.await;
            }
            None => std::future::pending().await,
        }
    };

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                error!(%error, "cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
            () = stdio_done => info!("stdio peer disconnected"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received"),
            () = stdio_done => info!("stdio peer disconnected"),
        }
    }
}

fn init_logging(override_filter: Option<&str>) {
    let filter = match override_filter {
        Some(filter) => EnvFilter::new(filter),
        None => EnvFilter::try_from_env("MCPMUX_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // Stdout is reserved for protocol frames in stdio mode; everything
    // observable goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
