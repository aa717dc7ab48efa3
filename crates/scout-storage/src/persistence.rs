//! In-memory tables with debounced write-back to a single JSON file.
//!
//! Every successful mutation arms a coalescing timer owned by a dedicated
//! background task. When the timer fires the whole state is serialized and
//! written once, however many mutations landed inside the window. Callers
//! that need a durability checkpoint call [`Database::flush`].

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use scout_core::{Alert, PriceSnapshot, Product, Store, User};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::migrate::{self, MigrationReport, SCHEMA_VERSION};
use crate::StorageError;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(50);

/// The five logical tables plus their secondary indexes.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tables {
    pub(crate) schema_version: u32,
    #[serde(default)]
    pub(crate) users: BTreeMap<Uuid, User>,
    #[serde(default)]
    pub(crate) stores: BTreeMap<Uuid, Store>,
    #[serde(default)]
    pub(crate) products: BTreeMap<Uuid, Product>,
    /// Per product, in insertion (= collection) order.
    #[serde(default)]
    pub(crate) snapshots: BTreeMap<Uuid, Vec<PriceSnapshot>>,
    #[serde(default)]
    pub(crate) alerts: BTreeMap<Uuid, Alert>,
    #[serde(skip)]
    indexes: Indexes,
}

#[derive(Debug, Default)]
struct Indexes {
    store_by_slug: HashMap<String, Uuid>,
    product_by_url: HashMap<(Uuid, String), Uuid>,
    alert_by_owner: HashMap<(Uuid, Uuid), Uuid>,
    user_by_email: HashMap<String, Uuid>,
}

impl Default for Tables {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            users: BTreeMap::new(),
            stores: BTreeMap::new(),
            products: BTreeMap::new(),
            snapshots: BTreeMap::new(),
            alerts: BTreeMap::new(),
            indexes: Indexes::default(),
        }
    }
}

impl Tables {
    pub(crate) fn rebuild_indexes(&mut self) {
        let mut indexes = Indexes::default();
        for store in self.stores.values() {
            indexes.store_by_slug.insert(store.slug.clone(), store.id);
        }
        for product in self.products.values() {
            indexes
                .product_by_url
                .insert((product.store_id, product.product_url.clone()), product.id);
        }
        for alert in self.alerts.values() {
            indexes
                .alert_by_owner
                .insert((alert.product_id, alert.user_id), alert.id);
        }
        for user in self.users.values() {
            indexes.user_by_email.insert(user.email.clone(), user.id);
        }
        self.indexes = indexes;
    }

    pub(crate) fn store_id_by_slug(&self, slug: &str) -> Option<Uuid> {
        self.indexes.store_by_slug.get(slug).copied()
    }

    pub(crate) fn product_id_by_url(&self, store_id: Uuid, url: &str) -> Option<Uuid> {
        self.indexes
            .product_by_url
            .get(&(store_id, url.to_string()))
            .copied()
    }

    pub(crate) fn alert_id_by_owner(&self, product_id: Uuid, user_id: Uuid) -> Option<Uuid> {
        self.indexes
            .alert_by_owner
            .get(&(product_id, user_id))
            .copied()
    }

    pub(crate) fn user_id_by_email(&self, email: &str) -> Option<Uuid> {
        self.indexes.user_by_email.get(email).copied()
    }

    pub(crate) fn insert_store(&mut self, store: Store) {
        self.indexes.store_by_slug.insert(store.slug.clone(), store.id);
        self.stores.insert(store.id, store);
    }

    pub(crate) fn insert_product(&mut self, product: Product) {
        self.indexes
            .product_by_url
            .insert((product.store_id, product.product_url.clone()), product.id);
        self.products.insert(product.id, product);
    }

    pub(crate) fn append_snapshot(&mut self, snapshot: PriceSnapshot) {
        self.snapshots
            .entry(snapshot.product_id)
            .or_default()
            .push(snapshot);
    }

    pub(crate) fn insert_alert(&mut self, alert: Alert) {
        self.indexes
            .alert_by_owner
            .insert((alert.product_id, alert.user_id), alert.id);
        self.alerts.insert(alert.id, alert);
    }

    pub(crate) fn remove_alert(&mut self, alert_id: Uuid) -> Option<Alert> {
        let alert = self.alerts.remove(&alert_id)?;
        self.indexes
            .alert_by_owner
            .remove(&(alert.product_id, alert.user_id));
        Some(alert)
    }

    pub(crate) fn insert_user(&mut self, user: User) {
        self.indexes.user_by_email.insert(user.email.clone(), user.id);
        self.users.insert(user.id, user);
    }
}

struct Shared {
    path: PathBuf,
    debounce: Duration,
    tables: Mutex<Tables>,
    /// Serializes durable writes so an older state never lands after a newer one.
    write_lock: Mutex<()>,
    armed: AtomicBool,
    closed: AtomicBool,
    durable_writes: AtomicU64,
    upgrade: Option<MigrationReport>,
    /// Shared with the write-back task, which only holds a weak handle to
    /// the rest of the state.
    wake: Arc<Notify>,
}

/// Handle to the in-memory store. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.shared.path)
            .field("debounce", &self.shared.debounce)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Database {
    /// Load `path` (upgrading older layouts) or start empty, and spawn the
    /// write-back task. Must be called from within a tokio runtime.
    pub fn open(path: impl Into<PathBuf>, debounce: Duration) -> Result<Self, StorageError> {
        let path = path.into();
        let (tables, upgrade) = load_tables(&path)?;
        let upgraded = upgrade.is_some();

        let shared = Arc::new(Shared {
            path,
            debounce,
            tables: Mutex::new(tables),
            write_lock: Mutex::new(()),
            armed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            durable_writes: AtomicU64::new(0),
            upgrade,
            wake: Arc::new(Notify::new()),
        });

        if upgraded {
            shared.persist()?;
        }

        tokio::spawn(write_back_loop(Arc::downgrade(&shared), shared.wake.clone()));
        Ok(Self { shared })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let tables = lock(&self.shared.tables);
        f(&tables)
    }

    /// Apply a mutation synchronously and arm the write-back timer. A closure
    /// that returns `Err` must leave the tables untouched; nothing is scheduled.
    pub fn write<R>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<R, StorageError>,
    ) -> Result<R, StorageError> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        let out = {
            let mut tables = lock(&self.shared.tables);
            f(&mut tables)?
        };
        self.shared.schedule();
        Ok(out)
    }

    /// Cancel any armed timer and write the full state now.
    pub fn flush(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Ok(());
        }
        self.shared.armed.store(false, Ordering::SeqCst);
        self.shared.persist()
    }

    /// Final flush; later mutations are rejected. Safe to call repeatedly.
    pub fn close(&self) -> Result<(), StorageError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.armed.store(false, Ordering::SeqCst);
        let result = self.shared.persist();
        self.shared.wake.notify_one();
        info!(path = %self.shared.path.display(), "database closed");
        result
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Number of completed durable writes since open.
    pub fn durable_writes(&self) -> u64 {
        self.shared.durable_writes.load(Ordering::SeqCst)
    }

    /// What the layout upgrade on open did, if one ran.
    pub fn migration_report(&self) -> Option<&MigrationReport> {
        self.shared.upgrade.as_ref()
    }

    pub fn write_pending(&self) -> bool {
        self.shared.armed.load(Ordering::SeqCst)
    }
}

impl Shared {
    fn schedule(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.armed.swap(true, Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    fn persist(&self) -> Result<(), StorageError> {
        let _writer = lock(&self.write_lock);
        let bytes = {
            let tables = lock(&self.tables);
            serde_json::to_vec(&*tables)?
        };
        write_atomically(&self.path, &bytes)?;
        let count = self.durable_writes.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(path = %self.path.display(), bytes = bytes.len(), count, "state persisted");
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.armed.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst) {
            debug!(path = %self.path.display(), "database dropped with an unsaved change");
        }
        // Lets the write-back task observe that the state is gone.
        self.wake.notify_one();
    }
}

/// Exits once the database is closed or every handle to it is dropped.
async fn write_back_loop(shared: Weak<Shared>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        let debounce = match shared.upgrade() {
            Some(db) if !db.closed.load(Ordering::SeqCst) => db.debounce,
            _ => break,
        };
        tokio::time::sleep(debounce).await;

        let Some(db) = shared.upgrade() else { break };
        // A flush inside the window already wrote everything.
        if !db.armed.swap(false, Ordering::SeqCst) {
            continue;
        }
        match tokio::task::spawn_blocking(move || db.persist()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "debounced write-back failed"),
            Err(err) => warn!(error = %err, "debounced write-back task aborted"),
        }
    }
    debug!("write-back task stopped");
}

fn load_tables(path: &Path) -> Result<(Tables, Option<MigrationReport>), StorageError> {
    if !path.exists() {
        info!(path = %path.display(), "no data file yet; starting empty");
        return Ok((Tables::default(), None));
    }
    let text = fs::read_to_string(path).map_err(|source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let document: serde_json::Value = serde_json::from_str(&text)?;
    let (mut tables, report) = migrate::upgrade(document)?;
    tables.rebuild_indexes();
    if let Some(report) = &report {
        info!(
            from_version = report.from_version,
            alerts_rehomed = report.alerts_rehomed,
            users_created = report.users_created,
            duplicates_merged = report.duplicates_merged,
            "upgraded data file layout"
        );
    }
    Ok((tables, report))
}

/// Write to a sibling temp file, fsync, then rename over the target.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(io_err)?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let written = (|| {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    })();

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(io_err(err));
    }
    Ok(())
}
