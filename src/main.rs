//! Application entry point for the `sentinel-audit` service.
//!
//! This binary orchestrates the startup sequence for the gas-detector
//! audit API, including:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging to the console and to a log file
//! - Loading the site registry from the data directory
//! - Mounting all API routes via the `routes` gateway (EMBP pattern)
//! - Binding the Axum HTTP server and serving requests
//!
//! # Environment Variables
//! - `SENTINEL_DATA_DIR` (optional) – registry, site databases and log file (default: `.`)
//! - `SENTINEL_BIND_ADDR` (optional) – listen address (default: `0.0.0.0:8080`)
//! - `DB_POOL_MAX` (optional) – connections per site database (default: 1)
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! Database access lives in `store`, aggregation in `collapse`, `pivot`,
//! `metrics` and `reports`, and everything is composed by `service`.
use std::{env, fs::OpenOptions, sync::Mutex};

use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

use anyhow::Result;

mod cache;
mod collapse;
mod config;
mod error;
mod export;
mod import;
mod metrics;
mod models;
mod pivot;
mod registry;
mod reports;
mod routes;
mod schema;
mod service;
mod store;
mod tasks;

pub use config::Config;

// Imported here so routes/*.rs only know their parent module.
pub use service::AuditService;

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();

    let cfg = config::load_from_env()?;
    init_tracing(&cfg)?;
    cfg.log_config();

    let service = AuditService::new(cfg.clone()).await;
    tracing::info!("Registry holds {} site(s)", service.sites().await.len());

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(service);

    tracing::info!("Listening on {}", cfg.bind_addr);
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// Two layers share one filter:
/// - a console layer with target, file and line number output, whose
///   color is controlled by TTY detection and the `FORCE_COLOR` env var
///   (`1|true|yes` forces colors on, `0|false|no` forces them off)
/// - a plain-text layer appending to [`Config::log_path`]
///
/// Span event emission is controlled by `AXUM_SPAN_EVENTS`:
/// - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
/// - `"enter_exit"` : emit ENTER and EXIT only
/// - unset or other values: emit CLOSE events only (default)
///
/// The level comes from `RUST_LOG` when set, else `AXUM_LOG_LEVEL`.
fn init_tracing(cfg: &Config) -> Result<()> {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    // Determine if we should use colors
    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    // Use RUST_LOG if available, otherwise fall back to AXUM_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,calamine=warn"))
    };

    let console = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_ansi(use_color)
        .compact();

    let log_path = cfg.log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| anyhow::anyhow!("Failed to open log file '{}': {}", log_path.display(), e))?;

    let file = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(false)
        .with_writer(Mutex::new(log_file));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console)
        .with(file)
        .init();

    Ok(())
}
