use std::path::PathBuf;

use notify_engine::EngineConfig;
use notify_engine::logging::init_logging;
use notify_engine::metrics::PrometheusExporter;
use notify_engine::notification::{NotificationPriority, NotificationRequest, NotificationService};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Logging options live in the configuration, so it is loaded first and
    // reported once the subscriber is installed.
    let config_path = std::env::var("NOTIFY_CONFIG").ok().map(PathBuf::from);
    let mut config = EngineConfig::load(config_path.as_deref())?;
    let default_console = config.ensure_channel();

    // Initialize logging
    let (_logging, _guard) = init_logging(&config.logging)?;

    match &config_path {
        Some(path) => info!(path = %path.display(), "Loaded configuration file"),
        None => info!("No configuration file set, using defaults and environment"),
    }
    if default_console {
        warn!("No channels configured, falling back to the console channel");
    }
    info!(
        channels = config.channels.len(),
        default_channel = %config.routing.default_channel,
        log_format = ?config.logging.format,
        "Configuration ready"
    );

    let service = NotificationService::from_config(&config)?;
    let mut summaries = service.subscribe();

    let request = NotificationRequest::builder(
        "notify-engine started",
        format!("version {}", env!("CARGO_PKG_VERSION")),
    )
    .priority(NotificationPriority::Low)
    .label("source", "notify-engine")
    .build();

    let record = service.notify(request).await;
    info!(phase = %record.phase(), "Startup notification processed");
    if let Ok(summary) = summaries.try_recv() {
        info!(summary = %serde_json::to_string(&summary)?, "Delivery summary");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        _ = tokio::time::sleep(std::time::Duration::from_millis(500)) => {}
    }

    service.shutdown().await;

    let stats = service.stats();
    if stats.audit.dropped > 0 {
        warn!(dropped = stats.audit.dropped, "Audit events were dropped");
    }
    tracing::debug!("{}", PrometheusExporter::new(service.metrics()).export());

    Ok(())
}
