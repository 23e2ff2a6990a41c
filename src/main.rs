use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use nabi_handover::api::{create_router, AppState};
use nabi_handover::config::{Config, LoggingConfig};
use nabi_handover::font::TrueTypeFont;
use nabi_handover::image_store::ImageStore;
use nabi_handover::pdf::PdfExporter;
use nabi_handover::registry::Registry;
use nabi_handover::signature_store::SignatureStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config.logging);

    info!(
        service = %config.service.name,
        host = %config.http.host,
        port = config.http.port,
        "Starting handover service"
    );
    if config.using_default_secret() {
        warn!("SECRET_KEY not set; running with the built-in default secret");
    }

    init_metrics(config.service.metrics_port)?;

    let registry = Arc::new(Registry::new());
    let images =
        Arc::new(ImageStore::new(&config.storage).context("failed to initialize image store")?);
    let signatures = Arc::new(
        SignatureStore::new(&config.storage).context("failed to initialize signature store")?,
    );

    // The export font is loaded once, up front; a bad font path should fail
    // the deployment rather than the first export request
    let font = TrueTypeFont::load(&config.pdf.font_path).with_context(|| {
        format!("failed to load PDF font {}", config.pdf.font_path.display())
    })?;
    let pdf = Arc::new(PdfExporter::new(font, config.storage.upload_dir.clone()));

    let state = AppState {
        registry,
        images,
        signatures,
        pdf,
    };
    let router = create_router(state, &config.http);

    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(config: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.level));

    if config.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn init_metrics(port: u16) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("failed to install Prometheus metrics exporter")?;
    info!(port = port, "Metrics exporter listening");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
