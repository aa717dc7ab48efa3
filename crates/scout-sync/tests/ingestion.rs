use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use scout_adapters::{AdapterError, ListingSource};
use scout_core::{NewAlert, Product, ProductFilter, ScrapedRecord};
use scout_storage::{open_stores, AlertStore, Catalog, DEFAULT_DEBOUNCE};
use scout_sync::{
    AlertEvaluator, Ingestor, NotificationSink, NotifyError, OutboundMessage, RunPhase, RunTarget,
    ScoutApp, ScoutConfig, SyncError, Trigger,
};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

/// Returns one scripted inventory per call; an exhausted script yields nothing.
struct ScriptedSource {
    slug: &'static str,
    batches: Mutex<VecDeque<Result<Vec<ScrapedRecord>, String>>>,
}

impl ScriptedSource {
    fn new(
        slug: &'static str,
        batches: Vec<Result<Vec<ScrapedRecord>, String>>,
    ) -> Arc<dyn ListingSource> {
        Arc::new(Self {
            slug,
            batches: Mutex::new(batches.into()),
        })
    }
}

#[async_trait]
impl ListingSource for ScriptedSource {
    fn slug(&self) -> &str {
        self.slug
    }

    fn display_name(&self) -> &str {
        "Acme Cards"
    }

    fn base_url(&self) -> &str {
        "https://acme.test"
    }

    async fn scrape_all(&self) -> Result<Vec<ScrapedRecord>, AdapterError> {
        let next = self.batches.lock().unwrap().pop_front();
        match next {
            Some(Ok(items)) => Ok(items),
            Some(Err(message)) => Err(AdapterError::Message(message)),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<OutboundMessage>>,
    fail_for: Option<String>,
}

impl RecordingSink {
    fn failing_for(email: &str) -> Self {
        Self {
            fail_for: Some(email.to_string()),
            ..Default::default()
        }
    }

    fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|m| m.to.clone()).collect()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, message: &OutboundMessage) -> Result<(), NotifyError> {
        if self.fail_for.as_deref() == Some(message.to.as_str()) {
            return Err(NotifyError::Transport("smtp 554".into()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

struct Harness {
    _dir: TempDir,
    catalog: Catalog,
    alerts: AlertStore,
    sink: Arc<RecordingSink>,
    ingestor: Arc<Ingestor>,
}

fn harness(sources: Vec<Arc<dyn ListingSource>>, sink: RecordingSink) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let (catalog, alerts) =
        open_stores(dir.path().join("scout.json"), DEFAULT_DEBOUNCE, "HUF").unwrap();
    let sink = Arc::new(sink);
    let evaluator = AlertEvaluator::new(catalog.clone(), alerts.clone(), sink.clone());
    let ingestor = Arc::new(Ingestor::new(catalog.clone(), evaluator, sources));
    Harness {
        _dir: dir,
        catalog,
        alerts,
        sink,
        ingestor,
    }
}

fn item(url: &str, price: Option<i64>, in_stock: bool) -> ScrapedRecord {
    ScrapedRecord {
        name: format!("Item {url}"),
        url: url.to_string(),
        price,
        raw_price: price.map(|p| format!("{p} Ft")),
        in_stock,
        ..Default::default()
    }
}

fn product_by_url(catalog: &Catalog, url: &str) -> Product {
    catalog
        .list_products(&ProductFilter::default())
        .into_iter()
        .find(|p| p.product_url == url)
        .unwrap()
}

fn alert_on(product_id: uuid::Uuid, target: Option<i64>, in_stock: bool, restock: bool) -> NewAlert {
    NewAlert {
        product_id,
        target_price: target,
        notify_on_in_stock: Some(in_stock),
        notify_on_restock: Some(restock),
    }
}

const P: &str = "https://acme.test/p/etb";
const Q: &str = "https://acme.test/p/tin";

#[tokio::test]
async fn acme_price_drop_notifies_once() {
    let source = ScriptedSource::new(
        "acme",
        vec![
            Ok(vec![item(P, Some(10_000), true)]),
            Ok(vec![item(P, Some(9_500), true)]),
            Ok(vec![item(P, Some(9_500), true)]),
        ],
    );
    let h = harness(vec![source], RecordingSink::default());

    let first = h.ingestor.run(RunTarget::All).await.unwrap();
    assert_eq!(first.sources[0].created, 1);
    let product = product_by_url(&h.catalog, P);
    let user = h.alerts.create_user("ash@example.com", false).unwrap();
    let alert = h
        .alerts
        .create_alert(user.id, &alert_on(product.id, Some(9_500), true, true))
        .unwrap();

    let second = h.ingestor.run(RunTarget::Source("acme".into())).await.unwrap();
    assert_eq!(second.sources[0].price_changes, 1);
    assert_eq!(second.notifications_sent(), 1);
    let notified = h.alerts.get_alert(user.id, alert.id).unwrap();
    assert_eq!(notified.last_notified_price, Some(9_500));
    assert_eq!(notified.last_notified_in_stock, Some(true));

    let third = h.ingestor.run(RunTarget::All).await.unwrap();
    assert_eq!(third.sources[0].price_changes, 0);
    assert_eq!(third.notifications_sent(), 0);
    assert_eq!(h.catalog.snapshots(product.id).unwrap().len(), 2);
    assert_eq!(h.sink.recipients(), vec!["ash@example.com".to_string()]);
}

#[tokio::test]
async fn target_price_fires_on_each_new_low_only() {
    let prices = [10_000, 8_000, 8_000, 7_000, 7_000];
    let mut batches = vec![Ok(vec![item(P, Some(12_000), true)])];
    batches.extend(prices.iter().map(|p| Ok(vec![item(P, Some(*p), true)])));
    let h = harness(vec![ScriptedSource::new("acme", batches)], RecordingSink::default());

    h.ingestor.run(RunTarget::All).await.unwrap();
    let product = product_by_url(&h.catalog, P);
    let user = h.alerts.create_user("ash@example.com", false).unwrap();
    h.alerts
        .create_alert(user.id, &alert_on(product.id, Some(9_000), false, false))
        .unwrap();

    let mut fired = Vec::new();
    for price in prices {
        let summary = h.ingestor.run(RunTarget::All).await.unwrap();
        if summary.notifications_sent() > 0 {
            fired.push(price);
        }
    }
    assert_eq!(fired, vec![8_000, 7_000]);
}

#[tokio::test]
async fn restock_fires_without_in_stock_rule() {
    let source = ScriptedSource::new(
        "acme",
        vec![
            Ok(vec![item(P, Some(5_000), false)]),
            Ok(vec![item(P, Some(5_000), true)]),
        ],
    );
    let h = harness(vec![source], RecordingSink::default());
    h.ingestor.run(RunTarget::All).await.unwrap();
    let product = product_by_url(&h.catalog, P);
    let user = h.alerts.create_user("misty@example.com", false).unwrap();
    h.alerts
        .create_alert(user.id, &alert_on(product.id, None, false, true))
        .unwrap();

    let summary = h.ingestor.run(RunTarget::All).await.unwrap();
    assert_eq!(summary.sources[0].stock_changes, 1);
    assert_eq!(summary.notifications_sent(), 1);
}

#[tokio::test]
async fn sink_failure_is_isolated_to_its_product() {
    let source = ScriptedSource::new(
        "acme",
        vec![
            Ok(vec![item(P, Some(10_000), true), item(Q, Some(4_000), true)]),
            Ok(vec![item(P, Some(8_000), true), item(Q, Some(3_000), true)]),
        ],
    );
    let h = harness(vec![source], RecordingSink::failing_for("broken@example.com"));
    h.ingestor.run(RunTarget::All).await.unwrap();
    let p = product_by_url(&h.catalog, P);
    let q = product_by_url(&h.catalog, Q);

    let broken = h.alerts.create_user("broken@example.com", false).unwrap();
    let skipped = h.alerts.create_user("skipped@example.com", false).unwrap();
    let other = h.alerts.create_user("other@example.com", false).unwrap();
    h.alerts
        .create_alert(broken.id, &alert_on(p.id, Some(9_000), false, false))
        .unwrap();
    let skipped_alert = h
        .alerts
        .create_alert(skipped.id, &alert_on(p.id, Some(9_000), false, false))
        .unwrap();
    h.alerts
        .create_alert(other.id, &alert_on(q.id, Some(3_500), false, false))
        .unwrap();

    let summary = h.ingestor.run(RunTarget::All).await.unwrap();
    let report = &summary.sources[0];
    assert_eq!(report.failed_items, 1);
    assert_eq!(report.notifications_sent, 1);
    assert!(report.error.is_none());
    assert_eq!(h.sink.recipients(), vec!["other@example.com".to_string()]);
    assert!(h
        .alerts
        .get_alert(skipped.id, skipped_alert.id)
        .unwrap()
        .last_notified_at
        .is_none());
}

#[tokio::test]
async fn unknown_slug_is_rejected() {
    let h = harness(
        vec![ScriptedSource::new("acme", vec![])],
        RecordingSink::default(),
    );
    let err = h
        .ingestor
        .run(RunTarget::Source("nope".into()))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownSource(slug) if slug == "nope"));
}

#[tokio::test]
async fn failing_source_does_not_stop_the_run() {
    let broken = ScriptedSource::new("broken", vec![Err("connection reset".into())]);
    let acme = ScriptedSource::new("acme", vec![Ok(vec![item(P, None, true)])]);
    let h = harness(vec![broken, acme], RecordingSink::default());

    let summary = h.ingestor.run(RunTarget::All).await.unwrap();
    assert_eq!(summary.sources.len(), 2);
    assert_eq!(summary.failed_sources(), 1);
    assert!(summary.sources[0]
        .error
        .as_deref()
        .unwrap()
        .contains("connection reset"));
    assert_eq!(summary.sources[1].created, 1);
    assert_eq!(h.ingestor.phase(), RunPhase::Idle);
    assert_eq!(h.catalog.list_stores().len(), 2);
}

/// Blocks inside `scrape_all` until a permit is released and tracks how
/// many fetches overlap.
struct GatedSource {
    gate: Semaphore,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl ListingSource for GatedSource {
    fn slug(&self) -> &str {
        "gated"
    }

    fn display_name(&self) -> &str {
        "Gated"
    }

    fn base_url(&self) -> &str {
        "https://gated.test"
    }

    async fn scrape_all(&self) -> Result<Vec<ScrapedRecord>, AdapterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let permit = self.gate.acquire().await.unwrap();
        permit.forget();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![item("https://gated.test/p", Some(1), true)])
    }
}

#[tokio::test]
async fn overlapping_runs_are_serialized() {
    let gated = Arc::new(GatedSource {
        gate: Semaphore::new(0),
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    });
    let h = harness(vec![gated.clone() as Arc<dyn ListingSource>], RecordingSink::default());

    let mut phases = h.ingestor.subscribe_phase();
    let first = tokio::spawn({
        let ingestor = h.ingestor.clone();
        async move { ingestor.run(RunTarget::All).await }
    });
    phases
        .wait_for(|p| *p == RunPhase::FetchInventory)
        .await
        .unwrap();
    assert!(h.ingestor.is_running());

    let second = tokio::spawn({
        let ingestor = h.ingestor.clone();
        async move { ingestor.run(RunTarget::All).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(gated.in_flight.load(Ordering::SeqCst), 1);

    gated.gate.add_permits(2);
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(gated.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(second.started_at >= first.finished_at);
    assert_eq!(first.sources[0].created, 1);
    assert_eq!(second.sources[0].created, 0);
    assert!(!h.ingestor.is_running());
}

#[tokio::test]
async fn sweep_treats_every_alert_as_freshly_changed() {
    let source = ScriptedSource::new("acme", vec![Ok(vec![item(P, Some(8_000), true)])]);
    let h = harness(vec![source], RecordingSink::default());
    h.ingestor.run(RunTarget::All).await.unwrap();
    let product = product_by_url(&h.catalog, P);
    let bargain = h.alerts.create_user("ash@example.com", false).unwrap();
    let stock = h.alerts.create_user("brock@example.com", false).unwrap();
    h.alerts
        .create_alert(bargain.id, &alert_on(product.id, Some(9_000), false, false))
        .unwrap();
    h.alerts
        .create_alert(stock.id, &alert_on(product.id, None, true, true))
        .unwrap();

    let first = h.ingestor.sweep().await.unwrap();
    let triggers: Vec<_> = first.iter().map(|n| n.trigger).collect();
    assert_eq!(triggers.len(), 2);
    assert!(triggers.contains(&Trigger::TargetPrice));
    assert!(triggers.contains(&Trigger::BackInStock));

    // A sweep has no previous state: the price rule fires again, while the
    // stock rule is held back by the recorded in-stock notification.
    let second = h.ingestor.sweep().await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].trigger, Trigger::TargetPrice);
    assert_eq!(second[0].user_id, bargain.id);
    assert_eq!(h.ingestor.phase(), RunPhase::Idle);
}

/// Parks every send until a permit is released.
struct ParkedSink {
    entered: Notify,
    release: Semaphore,
    sent: AtomicUsize,
}

impl ParkedSink {
    fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Semaphore::new(0),
            sent: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NotificationSink for ParkedSink {
    async fn send(&self, _message: &OutboundMessage) -> Result<(), NotifyError> {
        self.entered.notify_one();
        self.release.acquire().await.unwrap().forget();
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn shutdown_waits_for_the_send_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("scout.json");
    let (catalog, alerts) = open_stores(&path, DEFAULT_DEBOUNCE, "HUF").unwrap();
    let sink = Arc::new(ParkedSink::new());
    let source = ScriptedSource::new(
        "acme",
        vec![
            Ok(vec![item(P, Some(10_000), true)]),
            Ok(vec![item(P, Some(8_000), true)]),
        ],
    );
    let evaluator = AlertEvaluator::new(catalog.clone(), alerts.clone(), sink.clone());
    let ingestor = Arc::new(Ingestor::new(catalog.clone(), evaluator, vec![source]));

    ingestor.run(RunTarget::All).await.unwrap();
    let product = product_by_url(&catalog, P);
    let user = alerts.create_user("ash@example.com", false).unwrap();
    let alert = alerts
        .create_alert(user.id, &alert_on(product.id, Some(9_000), false, false))
        .unwrap();

    let run = tokio::spawn({
        let ingestor = ingestor.clone();
        async move { ingestor.run(RunTarget::All).await }
    });
    sink.entered.notified().await;

    let app = ScoutApp {
        config: ScoutConfig::from_lookup(|_| None),
        catalog: catalog.clone(),
        alerts: alerts.clone(),
        ingestor: ingestor.clone(),
    };
    let shutdown = tokio::spawn(async move { app.shutdown().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!catalog.database().is_closed());

    sink.release.add_permits(1);
    let summary = run.await.unwrap().unwrap();
    shutdown.await.unwrap().unwrap();
    assert_eq!(summary.notifications_sent(), 1);
    assert_eq!(summary.sources[0].failed_items, 0);
    assert_eq!(sink.sent.load(Ordering::SeqCst), 1);
    assert!(catalog.database().is_closed());

    // After a restart the same price must not notify again.
    let (catalog, alerts) = open_stores(&path, DEFAULT_DEBOUNCE, "HUF").unwrap();
    let stored = alerts.get_alert(user.id, alert.id).unwrap();
    assert_eq!(stored.last_notified_price, Some(8_000));
    assert!(stored.last_notified_at.is_some());

    let replay = ScriptedSource::new("acme", vec![Ok(vec![item(P, Some(8_000), true)])]);
    let recording = Arc::new(RecordingSink::default());
    let evaluator = AlertEvaluator::new(catalog.clone(), alerts.clone(), recording.clone());
    let ingestor = Ingestor::new(catalog.clone(), evaluator, vec![replay]);
    let summary = ingestor.run(RunTarget::All).await.unwrap();
    assert_eq!(summary.notifications_sent(), 0);
    assert!(recording.recipients().is_empty());
}
