//! Application entry point for the `icewatch-sensorflow` pipeline.
//!
//! This binary orchestrates the full startup and shutdown sequence:
//! - Loading configuration from environment variables or `.env`
//! - Initializing structured logging/tracing
//! - Building the filesystem aggregate sink and the alert collaborator
//! - Starting the pipeline (producers, aggregator, alert delivery, sink workers)
//! - Mounting the ingestion and health routes via the `routes` gateway (EMBP pattern)
//! - Serving HTTP until Ctrl-C / SIGTERM or an aggregator fault, then
//!   draining the pipeline in order
//!
//! # Environment Variables
//! All optional; see `config.rs` for the full list and defaults. Logging:
//! - `ICEWATCH_LOG_LEVEL` (optional) – log verbosity (default: `info`)
//! - `ICEWATCH_SPAN_EVENTS` (optional) – span event mode for tracing
//! - `FORCE_COLOR` (optional) – force ANSI colors on or off
use std::{env, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use icewatch::config;
use icewatch::routes;
use icewatch::safety::{AlertSink, LogAlertSink, WebhookAlertSink};
use icewatch::sink::FileSystemSink;
use icewatch::Pipeline;

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let sink = Arc::new(FileSystemSink::new(cfg.output_root.clone()));
    let alerts: Arc<dyn AlertSink> = match &cfg.alert_webhook_url {
        Some(url) => Arc::new(WebhookAlertSink::new(url.clone())?),
        None => Arc::new(LogAlertSink),
    };

    let pipeline = Pipeline::start(cfg.clone(), sink, Some(alerts));
    let fatal = pipeline.fatal_token();

    // Build app from routes gateway (EMBP)
    let app: Router = routes::router(pipeline.ingest_handle());

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .with_context(|| format!("Failed to bind ingestion endpoint on {}", cfg.listen_addr))?;
    tracing::info!("Listening on {}", cfg.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(fatal.clone()))
        .await?;

    let report = pipeline.shutdown().await?;
    tracing::info!(
        aggregates = report.stats.aggregates_emitted,
        written = report.stats.writes_succeeded,
        failed = report.stats.writes_failed,
        abandoned = report.writes_abandoned,
        late = report.stats.readings_late,
        malformed = report.stats.readings_malformed,
        "shutdown complete"
    );
    Ok(())
}

/// Resolve on Ctrl-C, SIGTERM (unix) or an aggregator fault.
async fn shutdown_signal(fatal: CancellationToken) {
    // ---
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("shutdown signal received"),
        _ = terminate => tracing::info!("SIGTERM received"),
        _ = fatal.cancelled() => tracing::error!("aggregator fault, shutting down"),
    }
}

// ---

/// Initialize the global tracing subscriber for structured logging.
///
/// This function configures the [`tracing_subscriber`] with:
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `ICEWATCH_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level controlled by `RUST_LOG`, falling back to `ICEWATCH_LOG_LEVEL`
///
/// This should be called once at application startup before any logging
/// or tracing macros are invoked. It installs the subscriber globally
/// for the lifetime of the process.
fn init_tracing() {
    // ---
    let span_events = match env::var("ICEWATCH_SPAN_EVENTS").as_deref() {
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

    // Use RUST_LOG if available, otherwise fall back to ICEWATCH_LOG_LEVEL
    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("ICEWATCH_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},hyper=warn,reqwest=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
