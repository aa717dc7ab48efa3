//! Core catalog and alert domain model for Pokemon Scout.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "scout-core";

/// Currency assumed for a priced listing that does not name one.
pub const DEFAULT_BASE_CURRENCY: &str = "HUF";

/// A retailer whose inventory is scraped into the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub base_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Current catalog state of one listing, keyed by `(store_id, product_url)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub store_id: Uuid,
    pub remote_id: Option<String>,
    pub slug: Option<String>,
    pub name: String,
    pub product_url: String,
    pub image_url: Option<String>,
    pub category: Option<String>,
    /// Whole currency units.
    pub current_price: Option<i64>,
    pub current_currency: Option<String>,
    pub status: Option<String>,
    pub in_stock: bool,
    pub last_seen_at: DateTime<Utc>,
    /// Null until the first price or stock change observed after insert.
    pub last_change_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only price/stock history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub id: Uuid,
    pub product_id: Uuid,
    pub price: Option<i64>,
    pub currency: Option<String>,
    pub in_stock: bool,
    pub status: Option<String>,
    pub raw_price: Option<String>,
    pub collected_at: DateTime<Utc>,
}

/// Alert owner. Credentials live with the external auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-user alert rule on one product, plus its notification dedup state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub product_id: Uuid,
    pub user_id: Uuid,
    pub target_price: Option<i64>,
    pub notify_on_in_stock: bool,
    pub notify_on_restock: bool,
    pub active: bool,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub last_notified_price: Option<i64>,
    pub last_notified_in_stock: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Normalized listing handed over by a listing source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScrapedRecord {
    pub name: String,
    /// Absolute product URL. Together with the store it identifies the product.
    pub url: String,
    pub image_url: Option<String>,
    pub remote_id: Option<String>,
    pub slug: Option<String>,
    pub category: Option<String>,
    pub price: Option<i64>,
    pub currency: Option<String>,
    pub raw_price: Option<String>,
    pub status_text: Option<String>,
    pub in_stock: bool,
}

/// Outcome of reconciling one scraped record; also the input of alert evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductChange {
    pub product: Product,
    /// Pre-update state. `None` when the product was just inserted or when the
    /// change comes from a bulk sweep without history.
    pub previous: Option<Product>,
    pub price_changed: bool,
    pub stock_changed: bool,
}

impl ProductChange {
    pub fn is_new(&self) -> bool {
        self.previous.is_none()
    }

    pub fn changed(&self) -> bool {
        self.price_changed || self.stock_changed
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductFilter {
    pub store_id: Option<Uuid>,
    /// Case-insensitive substring of the product name.
    pub search: Option<String>,
    pub in_stock: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ProductFilter {
    pub const DEFAULT_LIMIT: usize = 100;
    pub const MAX_LIMIT: usize = 500;

    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .min(Self::MAX_LIMIT)
    }

    pub fn effective_offset(&self) -> usize {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAlert {
    pub product_id: Uuid,
    pub target_price: Option<i64>,
    pub notify_on_in_stock: Option<bool>,
    pub notify_on_restock: Option<bool>,
}

/// Partial update of an alert. `target_price: null` clears the target, an
/// absent field leaves it untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPatch {
    #[serde(default, deserialize_with = "double_option")]
    pub target_price: Option<Option<i64>>,
    pub notify_on_in_stock: Option<bool>,
    pub notify_on_restock: Option<bool>,
    pub active: Option<bool>,
}

impl AlertPatch {
    pub fn is_empty(&self) -> bool {
        self.target_price.is_none()
            && self.notify_on_in_stock.is_none()
            && self.notify_on_restock.is_none()
            && self.active.is_none()
    }
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

pub fn normalize_email(input: &str) -> String {
    input.trim().to_lowercase()
}

/// Trimmed value, or `None` for missing/blank text.
pub fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}
