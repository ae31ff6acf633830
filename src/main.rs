use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use conductor_config::models::AppConfig;
use conductor_config::ConfigValidator;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod app;
mod shutdown;

use app::{AppMode, Application};
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("conductor")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Distributed execution coordination for workflow orchestration")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to the TOML configuration file"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("Which services to run")
                .value_parser(["dispatcher", "worker", "standalone"])
                .default_value("standalone"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .help("Worker identity, overrides the configured worker_id"),
        )
        .arg(
            Arg::new("worker-group")
                .long("worker-group")
                .value_name("GROUP")
                .help("Worker-group affinity, overrides the configured worker_group"),
        )
        .arg(
            Arg::new("tenant")
                .long("tenant")
                .value_name("TENANT")
                .help("Tenant id; only the canonical tenant is accepted"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let mode_str = matches.get_one::<String>("mode").expect("has default");
    let log_level = matches.get_one::<String>("log-level").expect("has default");
    let log_format = matches.get_one::<String>("log-format").expect("has default");

    init_logging(log_level, log_format)?;

    let mut config = AppConfig::load(config_path.map(String::as_str))
        .context("failed to load configuration")?;
    apply_worker_overrides(
        &mut config,
        matches.get_one::<String>("worker-id").map(String::as_str),
        matches.get_one::<String>("worker-group").map(String::as_str),
    )?;
    let tenant = matches.get_one::<String>("tenant").cloned();

    let mode = match mode_str.as_str() {
        "dispatcher" => AppMode::Dispatcher,
        "worker" => AppMode::Worker,
        _ => AppMode::Standalone,
    };

    info!(mode = mode_str, "conductor starting");

    let app = Arc::new(Application::new(config, mode, tenant));
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!(error = %e, "application stopped with error");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Err(e)) => error!(error = %e, "application task failed"),
        Ok(Ok(())) => info!("conductor stopped"),
        Err(_) => warn!("graceful shutdown timed out, exiting anyway"),
    }

    Ok(())
}

/// Applies command-line worker identity overrides and re-runs config
/// validation, so a malformed flag value is rejected at startup just
/// like a malformed file value.
fn apply_worker_overrides(
    config: &mut AppConfig,
    worker_id: Option<&str>,
    worker_group: Option<&str>,
) -> Result<()> {
    if let Some(id) = worker_id {
        config.worker.worker_id = id.to_string();
    }
    if let Some(group) = worker_group {
        config.worker.worker_group = Some(group.to_string());
    }
    config
        .validate()
        .context("configuration rejected after command-line overrides")?;
    Ok(())
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("failed to initialize json logging")?,
        _ => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("failed to initialize pretty logging")?,
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "could not install ctrl-c handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => error!(error = %e, "could not install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
