//! Configuration, alert evaluation and ingestion orchestration for Pokemon Scout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use scout_storage::{open_stores, AlertStore, Catalog, HttpClientConfig, HttpFetcher};

mod config;
mod evaluate;
mod ingest;
mod notify;
mod registry;
mod schedule;
mod smtp;

pub use config::{normalize_cron, ScoutConfig};
pub use evaluate::{
    decide, format_price, render, AlertEvaluator, DispatchedNotification, EvaluateError, Trigger,
};
pub use ingest::{Ingestor, RunPhase, RunSummary, RunTarget, SourceReport, SyncError};
pub use notify::{LogSink, NotificationSink, NotifyError, OutboundMessage};
pub use registry::{SourceEntry, SourceRegistry};
pub use schedule::{build_scheduler, spawn_initial_run};
pub use smtp::{sink_from_config, SmtpSettings, SmtpSink, DEFAULT_SMTP_PORT, IMPLICIT_TLS_PORT};

pub const CRATE_NAME: &str = "scout-sync";

/// Everything a running instance needs, wired from configuration.
pub struct ScoutApp {
    pub config: ScoutConfig,
    pub catalog: Catalog,
    pub alerts: AlertStore,
    pub ingestor: Arc<Ingestor>,
}

impl ScoutApp {
    /// Open the data file, load the source registry and wire the engine with
    /// the given notification sink. Needs a tokio runtime.
    pub fn bootstrap(config: ScoutConfig, sink: Arc<dyn NotificationSink>) -> Result<Self> {
        let (catalog, alerts) = open_stores(
            &config.data_file,
            config.persist_debounce,
            &config.base_currency,
        )
        .with_context(|| format!("opening data file {}", config.data_file.display()))?;

        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let registry = SourceRegistry::load(&config.sources_file)?;
        let sources = registry.build_sources(&config, http)?;

        let evaluator = AlertEvaluator::new(catalog.clone(), alerts.clone(), sink)
            .with_send_timeout(config.notify_timeout);
        let ingestor = Arc::new(Ingestor::new(catalog.clone(), evaluator, sources));

        Ok(Self {
            config,
            catalog,
            alerts,
            ingestor,
        })
    }

    /// Final flush of the data file, once the run in flight has recorded
    /// its dedup state.
    pub async fn shutdown(&self) -> Result<()> {
        let _idle = self.ingestor.drain().await;
        self.catalog
            .database()
            .close()
            .context("closing data file")
    }
}
