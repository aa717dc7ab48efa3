//! Ingestion runs: pull each listing source, reconcile every record into the
//! catalog and evaluate the alerts of the touched products.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use scout_adapters::ListingSource;
use scout_storage::Catalog;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::evaluate::{AlertEvaluator, DispatchedNotification, EvaluateError};

const PROGRESS_EVERY: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    EnsureStore,
    FetchInventory,
    ApplyItems,
    Flush,
    Sweep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    All,
    Source(String),
}

impl RunTarget {
    pub fn from_slug(slug: Option<String>) -> Self {
        match slug.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
            Some(slug) => Self::Source(slug),
            None => Self::All,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown store slug: {0}")]
    UnknownSource(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub slug: String,
    pub display_name: String,
    pub total: usize,
    pub created: usize,
    pub price_changes: usize,
    pub stock_changes: usize,
    pub failed_items: usize,
    pub notifications_sent: usize,
    /// Set when the source as a whole failed.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
}

impl RunSummary {
    pub fn notifications_sent(&self) -> usize {
        self.sources.iter().map(|s| s.notifications_sent).sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.sources.iter().filter(|s| s.error.is_some()).count()
    }
}

pub struct Ingestor {
    catalog: Catalog,
    evaluator: AlertEvaluator,
    sources: Vec<Arc<dyn ListingSource>>,
    run_guard: Mutex<()>,
    phase: watch::Sender<RunPhase>,
}

impl Ingestor {
    pub fn new(
        catalog: Catalog,
        evaluator: AlertEvaluator,
        sources: Vec<Arc<dyn ListingSource>>,
    ) -> Self {
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            catalog,
            evaluator,
            sources,
            run_guard: Mutex::new(()),
            phase,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn source_slugs(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.slug()).collect()
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.run_guard.try_lock().is_err()
    }

    /// Wait for the run in flight, if any. No new run or sweep starts while
    /// the returned guard is held.
    pub async fn drain(&self) -> MutexGuard<'_, ()> {
        if self.is_running() {
            info!(phase = ?self.phase(), "waiting for the ingestion run in flight");
        }
        self.run_guard.lock().await
    }

    fn set_phase(&self, phase: RunPhase) {
        self.phase.send_replace(phase);
    }

    /// Run the selected sources one after another. Overlapping calls wait
    /// for the run in flight to finish. Source and item failures are logged
    /// and counted; only an unknown slug fails the call.
    pub async fn run(&self, target: RunTarget) -> Result<RunSummary, SyncError> {
        let selected: Vec<Arc<dyn ListingSource>> = match &target {
            RunTarget::All => self.sources.clone(),
            RunTarget::Source(slug) => {
                let source = self
                    .sources
                    .iter()
                    .find(|s| s.slug() == slug)
                    .ok_or_else(|| SyncError::UnknownSource(slug.clone()))?;
                vec![source.clone()]
            }
        };

        let _guard = self.run_guard.lock().await;
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let slugs: Vec<&str> = selected.iter().map(|s| s.slug()).collect();
        info!(%run_id, sources = ?slugs, "ingestion run started");

        let mut reports = Vec::with_capacity(selected.len());
        for source in &selected {
            let span = info_span!("source_run", %run_id, source = source.slug());
            let report = self.run_source(source.as_ref()).instrument(span).await;
            reports.push(report);
        }
        self.set_phase(RunPhase::Idle);

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: reports,
        };
        info!(
            %run_id,
            sources = summary.sources.len(),
            failed_sources = summary.failed_sources(),
            notifications = summary.notifications_sent(),
            "ingestion run finished"
        );
        Ok(summary)
    }

    async fn run_source(&self, source: &dyn ListingSource) -> SourceReport {
        let mut report = SourceReport {
            slug: source.slug().to_string(),
            display_name: source.display_name().to_string(),
            ..Default::default()
        };

        self.set_phase(RunPhase::EnsureStore);
        let store = match self
            .catalog
            .ensure_store(source.slug(), source.display_name(), source.base_url())
        {
            Ok(store) => store,
            Err(err) => {
                error!(error = %err, "could not ensure store record");
                report.error = Some(err.to_string());
                return report;
            }
        };

        self.set_phase(RunPhase::FetchInventory);
        let inventory = match source.scrape_all().await {
            Ok(items) => items,
            Err(err) => {
                error!(error = %err, "inventory fetch failed");
                report.error = Some(err.to_string());
                return report;
            }
        };
        report.total = inventory.len();
        info!(items = inventory.len(), store = %store.id, "inventory fetched");

        self.set_phase(RunPhase::ApplyItems);
        for (i, record) in inventory.iter().enumerate() {
            if i % PROGRESS_EVERY == 0 {
                info!(processed = i, total = inventory.len(), "applying items");
            }
            let change = match self.catalog.reconcile(store.id, record) {
                Ok(change) => change,
                Err(err) => {
                    warn!(item = %record.name, url = %record.url, error = %err, "reconcile failed");
                    report.failed_items += 1;
                    continue;
                }
            };
            if change.is_new() {
                report.created += 1;
            }
            if change.price_changed {
                report.price_changes += 1;
            }
            if change.stock_changed {
                report.stock_changes += 1;
            }

            match self.evaluator.evaluate(&change).await {
                Ok(sent) => report.notifications_sent += sent.len(),
                Err(EvaluateError::Notify {
                    delivered, source, alert_id,
                }) => {
                    warn!(item = %record.name, alert = %alert_id, error = %source, "alert delivery failed");
                    report.notifications_sent += delivered;
                    report.failed_items += 1;
                }
                Err(err) => {
                    warn!(item = %record.name, error = %err, "alert evaluation failed");
                    report.failed_items += 1;
                }
            }
        }

        self.set_phase(RunPhase::Flush);
        if let Err(err) = self.catalog.database().flush() {
            error!(error = %err, "flush after source failed");
            report.error = Some(err.to_string());
        }

        info!(
            total = report.total,
            created = report.created,
            price_changes = report.price_changes,
            stock_changes = report.stock_changes,
            failed_items = report.failed_items,
            notifications = report.notifications_sent,
            "source finished"
        );
        report
    }

    /// Evaluate every active alert against current catalog state, under the
    /// same guard as ingestion runs.
    pub async fn sweep(&self) -> Result<Vec<DispatchedNotification>, EvaluateError> {
        let _guard = self.run_guard.lock().await;
        self.set_phase(RunPhase::Sweep);
        let result = self.evaluator.evaluate_bulk().await;
        self.set_phase(RunPhase::Idle);
        if let Err(err) = self.catalog.database().flush() {
            warn!(error = %err, "flush after sweep failed");
        }
        result
    }
}
