//! # Event Intake - Main Entry Point
//!
//! Wires the pipeline together for a local run: observability, configuration,
//! component construction, prewarm, and graceful shutdown. Events arrive as
//! JSON lines on stdin — the narrowest possible stand-in for the messaging
//! platform's webhook — and replies go to the log.
//!
//! The demo collaborators at the bottom of this file (an in-process
//! connection factory and echo processors) exist so the pipeline can be
//! driven end to end without a database or AI backend attached; production
//! deployments supply their own implementations of the same traits.

use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use event_intake::caching::{CacheMonitor, CacheRegistry, DedupStore};
use event_intake::core::connection_pool::{ConnectionFactory, ConnectionPool};
use event_intake::pipeline::{
    LoggingReplyChannel, PipelineCoordinator, Prewarmer, Processor, ProcessorKind, ProcessorSet,
};
use event_intake::tasks::TaskRunner;
use event_intake::{
    InboundEvent, PipelineConfig, PipelineResult, ProcessorOutput, RetryPolicy,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_observability()?;

    info!("🚀 Starting event intake pipeline");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config().await?;

    // Shared components: constructed once, injected everywhere.
    let dedup = Arc::new(DedupStore::new(config.dedup.clone()));
    let caches = Arc::new(CacheRegistry::new(&config.caches));
    let pool = Arc::new(ConnectionPool::new(LocalStoreFactory, config.pool.clone()));
    let tasks = TaskRunner::new(config.tasks.clone());
    let monitor = Arc::new(CacheMonitor::new(
        caches.clone(),
        dedup.clone(),
        config.monitor.clone(),
    ));

    let processors = ProcessorSet::new(
        Arc::new(EchoProcessor::new(ProcessorKind::Nlp)),
        Arc::new(EchoProcessor::new(ProcessorKind::Image)),
        Arc::new(EchoProcessor::new(ProcessorKind::Chat)),
    );

    let coordinator = Arc::new(PipelineCoordinator::new(
        dedup,
        caches,
        pool.clone(),
        tasks.clone(),
        processors,
        Arc::new(LoggingReplyChannel),
        RetryPolicy::new(&config.retry),
    ));

    // Warm connections and start background sweeping before taking traffic.
    Prewarmer::new().start(&pool, &tasks, Vec::new());
    let monitor_handle = monitor.clone().start();
    info!("✅ Pipeline ready, reading events from stdin");

    run_intake_loop(coordinator).await;

    info!("Shutting down...");
    monitor.stop();
    if let Err(e) = tasks.drain(Duration::from_secs(5)).await {
        warn!(error = %e, "background tasks still pending at shutdown");
    }
    tasks.shutdown().await;
    let _ = monitor_handle.await;

    info!("✅ Event intake shutdown complete");
    Ok(())
}

/// Initialize logging and the metrics exporter
fn init_observability() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true).json())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "event_intake=info".into()),
        )
        .init();

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install()
        .context("failed to install metrics exporter")?;

    info!("📊 Observability initialized");
    Ok(())
}

/// Load configuration from `INTAKE_CONFIG_PATH`, falling back to defaults
/// when no file is configured or present
async fn load_config() -> anyhow::Result<PipelineConfig> {
    let path = std::env::var("INTAKE_CONFIG_PATH").unwrap_or_else(|_| "config/intake.yaml".into());

    match PipelineConfig::load_from_file(&path).await {
        Ok(config) => {
            info!(path = %path, "configuration loaded");
            Ok(config)
        }
        Err(e) if !std::path::Path::new(&path).exists() => {
            info!(path = %path, "no config file, using defaults ({})", e);
            Ok(PipelineConfig::default())
        }
        Err(e) => Err(e).with_context(|| format!("invalid configuration in {}", path)),
    }
}

/// Read JSON-line events from stdin until EOF or ctrl-c, handing each to the
/// coordinator on its own task — deliveries are concurrent, just as they
/// would be behind a webhook.
async fn run_intake_loop(coordinator: Arc<PipelineCoordinator<LocalStoreFactory>>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<InboundEvent>(&line) {
                        Ok(event) => {
                            let coordinator = coordinator.clone();
                            tokio::spawn(async move {
                                if let Err(e) = coordinator.handle_event(event).await {
                                    error!(error = %e, "pipeline returned an error");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "unparseable event line skipped"),
                    },
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
        }
    }
}

/// In-process stand-in for the persistent store connection
pub struct LocalStoreConn;

/// Factory producing [`LocalStoreConn`] handles
pub struct LocalStoreFactory;

#[async_trait::async_trait]
impl ConnectionFactory for LocalStoreFactory {
    type Conn = LocalStoreConn;

    async fn connect(&self) -> PipelineResult<LocalStoreConn> {
        Ok(LocalStoreConn)
    }

    async fn validate(&self, _conn: &mut LocalStoreConn) -> bool {
        true
    }
}

/// Processor that answers with a formatted echo of the payload
struct EchoProcessor {
    kind: ProcessorKind,
}

impl EchoProcessor {
    fn new(kind: ProcessorKind) -> Self {
        Self { kind }
    }
}

#[async_trait::async_trait]
impl Processor<LocalStoreConn> for EchoProcessor {
    fn kind(&self) -> ProcessorKind {
        self.kind
    }

    async fn process(
        &self,
        event: &InboundEvent,
        _conn: &mut LocalStoreConn,
    ) -> PipelineResult<ProcessorOutput> {
        let text = match &event.payload {
            event_intake::EventPayload::Text { text, .. } => {
                format!("[{}] processed: {}", self.kind.as_str(), text)
            }
            event_intake::EventPayload::Image { content, .. } => {
                format!("[{}] analyzed {} image bytes", self.kind.as_str(), content.len())
            }
            event_intake::EventPayload::Follow { user_id } => {
                format!("[{}] welcome, {}", self.kind.as_str(), user_id)
            }
            event_intake::EventPayload::Unknown { kind } => {
                format!("[{}] unsupported: {}", self.kind.as_str(), kind)
            }
        };
        Ok(ProcessorOutput::text_only(text))
    }
}
