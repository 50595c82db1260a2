use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use attachment_intake::api::{ApiState, api_routes};
use attachment_intake::config::ServiceConfig;
use attachment_intake::service::IntakeService;

/// How long in-flight tasks get to finish on Ctrl-C.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Create `dir` for the log file. Runs before the subscriber exists, so a
/// failure goes straight to stderr.
fn log_dir_usable(dir: &Path) -> bool {
    match std::fs::create_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            eprintln!(
                "warning: LOG_DIR {} unusable ({e}), logging to stderr only",
                dir.display()
            );
            false
        }
    }
}

/// Set up tracing with stderr output and an optional daily-rolled file.
fn setup_logging(config: &ServiceConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let file_layer = config.log_dir.as_deref().filter(|dir| log_dir_usable(dir)).map(|dir| {
        let appender = tracing_appender::rolling::daily(dir, "attachment-intake.log");
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(appender)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env().context("invalid configuration")?;
    setup_logging(&config);

    eprintln!("📎 Attachment intake v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Queue: {} (capacity {})", config.queue_name, config.max_queue_size);
    eprintln!("   Workers: {}", config.max_concurrent_workers);
    eprintln!("   Database: {}", config.db_path.display());
    match &config.graph {
        Some(graph) => eprintln!(
            "   Source: Graph mailbox '{}' every {}s",
            graph.mailbox,
            config.source_poll_interval.as_secs()
        ),
        None => eprintln!("   Source: none (uploads only)"),
    }

    let api_port = config.api_port;
    let service = Arc::new(
        IntakeService::open(config)
            .await
            .context("failed to build service")?,
    );
    service.start().await.context("failed to start service")?;

    // ── Control API ─────────────────────────────────────────────────────
    if let Some(port) = api_port {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
            .await
            .with_context(|| format!("failed to bind control API port {port}"))?;
        let app = api_routes(ApiState {
            service: Arc::clone(&service),
        });
        eprintln!("   API: http://0.0.0.0:{port}/api/status\n");
        tokio::spawn(async move {
            tracing::info!(port, "Control API started");
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Control API stopped");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    service
        .shutdown(SHUTDOWN_GRACE)
        .await
        .context("shutdown failed")?;
    Ok(())
}
