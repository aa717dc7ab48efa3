//! Stores, products and their price/stock history.

use chrono::Utc;
use scout_core::{
    non_blank, PriceSnapshot, Product, ProductChange, ProductFilter, ScrapedRecord, Store,
    DEFAULT_BASE_CURRENCY,
};
use tracing::debug;
use uuid::Uuid;

use crate::persistence::Database;
use crate::StorageError;

#[derive(Debug, Clone)]
pub struct Catalog {
    db: Database,
    base_currency: String,
}

impl Catalog {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            base_currency: DEFAULT_BASE_CURRENCY.to_string(),
        }
    }

    pub fn with_base_currency(mut self, currency: impl Into<String>) -> Self {
        self.base_currency = currency.into();
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn base_currency(&self) -> &str {
        &self.base_currency
    }

    /// Find the store by slug or create it. Name and base URL follow the
    /// caller when they drifted; the slug never changes.
    pub fn ensure_store(
        &self,
        slug: &str,
        name: &str,
        base_url: &str,
    ) -> Result<Store, StorageError> {
        self.db.write(|t| {
            let now = Utc::now();
            if let Some(id) = t.store_id_by_slug(slug) {
                let store = t
                    .stores
                    .get_mut(&id)
                    .ok_or_else(|| StorageError::Integrity(format!("slug index points at missing store {id}")))?;
                if store.name != name || store.base_url != base_url {
                    debug!(slug, "store name or base url drifted");
                    store.name = name.to_string();
                    store.base_url = base_url.to_string();
                    store.updated_at = now;
                }
                return Ok(store.clone());
            }

            let store = Store {
                id: Uuid::new_v4(),
                slug: slug.to_string(),
                name: name.to_string(),
                base_url: base_url.to_string(),
                created_at: now,
                updated_at: now,
            };
            t.insert_store(store.clone());
            Ok(store)
        })
    }

    pub fn list_stores(&self) -> Vec<Store> {
        self.db.read(|t| {
            let mut stores: Vec<Store> = t.stores.values().cloned().collect();
            stores.sort_by(|a, b| a.name.cmp(&b.name));
            stores
        })
    }

    pub fn get_store(&self, id: Uuid) -> Result<Store, StorageError> {
        self.db
            .read(|t| t.stores.get(&id).cloned())
            .ok_or_else(|| StorageError::not_found("store", id))
    }

    pub fn store_by_slug(&self, slug: &str) -> Option<Store> {
        self.db.read(|t| {
            t.store_id_by_slug(slug)
                .and_then(|id| t.stores.get(&id).cloned())
        })
    }

    /// Merge one scraped record into the catalog.
    ///
    /// A new product always counts as changed and gets its first snapshot.
    /// An existing product gets every descriptive field refreshed and
    /// `last_seen_at` bumped; a snapshot is appended and `last_change_at`
    /// moved only when the price or the stock flag differs.
    pub fn reconcile(
        &self,
        store_id: Uuid,
        record: &ScrapedRecord,
    ) -> Result<ProductChange, StorageError> {
        let base_currency = self.base_currency.as_str();
        let outcome = self.db.write(|t| {
            if !t.stores.contains_key(&store_id) {
                return Err(StorageError::not_found("store", store_id));
            }
            let now = Utc::now();
            let currency = record_currency(record, base_currency);
            let status = non_blank(record.status_text.as_deref());

            let existing = t
                .product_id_by_url(store_id, &record.url)
                .and_then(|id| t.products.get(&id).cloned());

            let Some(previous) = existing else {
                let product = Product {
                    id: Uuid::new_v4(),
                    store_id,
                    remote_id: non_blank(record.remote_id.as_deref()),
                    slug: non_blank(record.slug.as_deref()),
                    name: record.name.trim().to_string(),
                    product_url: record.url.clone(),
                    image_url: non_blank(record.image_url.as_deref()),
                    category: non_blank(record.category.as_deref()),
                    current_price: record.price,
                    current_currency: currency,
                    status,
                    in_stock: record.in_stock,
                    last_seen_at: now,
                    last_change_at: None,
                    created_at: now,
                    updated_at: now,
                };
                t.append_snapshot(snapshot_of(&product, record, now));
                let id = product.id;
                t.insert_product(product);
                return Ok((id, None, true, true));
            };

            let price_changed = previous.current_price != record.price;
            let stock_changed = previous.in_stock != record.in_stock;

            let product = t
                .products
                .get_mut(&previous.id)
                .ok_or_else(|| StorageError::Integrity(format!("url index points at missing product {}", previous.id)))?;
            product.remote_id = non_blank(record.remote_id.as_deref());
            product.slug = non_blank(record.slug.as_deref());
            product.name = record.name.trim().to_string();
            product.image_url = non_blank(record.image_url.as_deref());
            product.category = non_blank(record.category.as_deref());
            product.current_price = record.price;
            product.current_currency = currency;
            product.status = status;
            product.in_stock = record.in_stock;
            product.last_seen_at = now;
            product.updated_at = now;
            if price_changed || stock_changed {
                product.last_change_at = Some(now);
                let snapshot = snapshot_of(product, record, now);
                t.append_snapshot(snapshot);
            }
            Ok((previous.id, Some(previous), price_changed, stock_changed))
        });

        let (id, previous, price_changed, stock_changed) = outcome?;
        let product = self
            .db
            .read(|t| t.products.get(&id).cloned())
            .ok_or_else(|| StorageError::Integrity(format!("product {id} missing after reconcile")))?;

        Ok(ProductChange {
            product,
            previous,
            price_changed,
            stock_changed,
        })
    }

    /// Filtered page of products: in-stock first, then most recently updated.
    pub fn list_products(&self, filter: &ProductFilter) -> Vec<Product> {
        let needle = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase);

        self.db.read(|t| {
            let mut products: Vec<&Product> = t
                .products
                .values()
                .filter(|p| filter.store_id.map_or(true, |id| p.store_id == id))
                .filter(|p| filter.in_stock.map_or(true, |s| p.in_stock == s))
                .filter(|p| {
                    needle
                        .as_ref()
                        .map_or(true, |n| p.name.to_lowercase().contains(n))
                })
                .collect();
            products.sort_by(|a, b| {
                b.in_stock
                    .cmp(&a.in_stock)
                    .then(b.updated_at.cmp(&a.updated_at))
            });
            products
                .into_iter()
                .skip(filter.effective_offset())
                .take(filter.effective_limit())
                .cloned()
                .collect()
        })
    }

    pub fn get_product(&self, id: Uuid) -> Result<Product, StorageError> {
        self.db
            .read(|t| t.products.get(&id).cloned())
            .ok_or_else(|| StorageError::not_found("product", id))
    }

    pub fn product_count(&self) -> usize {
        self.db.read(|t| t.products.len())
    }

    /// History of one product, newest first.
    pub fn snapshots(&self, product_id: Uuid) -> Result<Vec<PriceSnapshot>, StorageError> {
        self.db.read(|t| {
            if !t.products.contains_key(&product_id) {
                return Err(StorageError::not_found("product", product_id));
            }
            let mut history = t.snapshots.get(&product_id).cloned().unwrap_or_default();
            history.reverse();
            Ok(history)
        })
    }
}

fn record_currency(record: &ScrapedRecord, base_currency: &str) -> Option<String> {
    non_blank(record.currency.as_deref())
        .or_else(|| record.price.map(|_| base_currency.to_string()))
}

fn snapshot_of(
    product: &Product,
    record: &ScrapedRecord,
    collected_at: chrono::DateTime<Utc>,
) -> PriceSnapshot {
    PriceSnapshot {
        id: Uuid::new_v4(),
        product_id: product.id,
        price: product.current_price,
        currency: product.current_currency.clone(),
        in_stock: product.in_stock,
        status: product.status.clone(),
        raw_price: non_blank(record.raw_price.as_deref()),
        collected_at,
    }
}
