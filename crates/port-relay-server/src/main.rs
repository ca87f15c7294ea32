//! # Port-Relay Server
//!
//! Main entry point for the port-relay forwarding server.

use anyhow::{Context, Result};
use port_relay_api::{create_router, AppState};
use port_relay_core::{Config, LoggingConfig, Registry, RuleStore, Stats};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let (config, config_path) = load_config()?;

    // Initialize logging; the guard flushes the log file on exit
    let _log_guard = init_logging(&config.logging)?;

    info!(
        "Starting port-relay server v{}",
        env!("CARGO_PKG_VERSION")
    );
    match &config_path {
        Some(path) => info!("Loaded configuration from {}", path),
        None => info!("No config file found, using defaults"),
    }

    let store = Arc::new(
        RuleStore::open(&config.storage.data_file)
            .await
            .context("Failed to open rule store")?,
    );

    let stats = Arc::new(Stats::new(config.limits.max_history));
    let registry = Registry::new(config.limits.clone(), stats);

    if let Some(name) = config
        .startup
        .autostart_template
        .as_deref()
        .filter(|name| !name.is_empty())
    {
        autostart(&registry, &store, name).await;
    }

    // Start API server
    let api_addr: SocketAddr = format!("{}:{}", config.server.host, config.server.api_port)
        .parse()
        .context("Invalid API bind address")?;

    let state = AppState {
        registry: registry.clone(),
        store,
        log_file: config.logging.file.as_ref().map(PathBuf::from),
    };
    let router = create_router(state, find_static_dir());

    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("Failed to bind API server on {}", api_addr))?;
    info!("Control API listening on http://{}", api_addr);

    let api_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!("API server error: {}", e);
        }
    });

    // Wait for the API server or a shutdown signal
    tokio::select! {
        _ = api_handle => error!("API server stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    let stopped = registry.stop_all().await;
    info!("Port-relay shutting down ({} forwards stopped)", stopped);
    Ok(())
}

/// Load configuration from file or use defaults.
/// Returns (Config, Option<config_path>)
fn load_config() -> Result<(Config, Option<String>)> {
    let config_paths = ["config.toml", "/etc/port-relay/config.toml"];

    for path in config_paths {
        if Path::new(path).exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path))?;
            let config = Config::from_toml(&content)
                .with_context(|| format!("Failed to parse config file: {}", path))?;
            return Ok((config, Some(path.to_string())));
        }
    }

    Ok((Config::default(), None))
}

/// Initialize logging to stdout and, if configured, to a log file.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let (file_layer, guard) = match &logging.file {
        Some(file) => {
            let path = Path::new(file);
            let dir = path
                .parent()
                .filter(|d| !d.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", file))?;
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;

            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Start every rule of the configured boot template.
async fn autostart(registry: &Registry, store: &RuleStore, name: &str) {
    let rules = match store.template_rules(name).await {
        Ok(rules) => rules,
        Err(e) => {
            warn!("Autostart template {:?} unavailable: {}", name, e);
            return;
        }
    };

    let failures = registry.start_rules(&rules).await;
    for failure in &failures {
        warn!(
            "Autostart of rule {} ({}) failed: {}",
            failure.rule_id, failure.protocol, failure.error
        );
    }
    info!(
        "Autostarted template {:?}: {} rules, {} failures",
        name,
        rules.len(),
        failures.len()
    );
}

/// Find the static files directory for the frontend.
fn find_static_dir() -> Option<PathBuf> {
    let paths = [
        "frontend",
        "../frontend",
        "../../frontend",
        "/usr/share/port-relay/frontend",
    ];

    for path in paths {
        let p = PathBuf::from(path);
        if p.exists() && p.is_dir() {
            info!("Serving static files from {:?}", p);
            return Some(p);
        }
    }

    None
}
