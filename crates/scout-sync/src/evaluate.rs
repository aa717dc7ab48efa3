//! Alert evaluation: decide which alerts a product change triggers, deliver
//! the notification and record the dedup state.

use std::sync::Arc;
use std::time::Duration;

use scout_core::{Alert, Product, ProductChange};
use scout_storage::{absolute_url, AlertStore, Catalog, StorageError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::notify::{NotificationSink, NotifyError, OutboundMessage};

/// Why an alert fired. Variants are listed in precedence order: when several
/// rules hold for the same event the first one wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    TargetPrice,
    Restock,
    BackInStock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchedNotification {
    pub alert_id: Uuid,
    pub user_id: Uuid,
    pub product_id: Uuid,
    pub trigger: Trigger,
    pub message: OutboundMessage,
}

#[derive(Debug, Error)]
pub enum EvaluateError {
    /// Delivery failed; alerts after this one for the same product were not
    /// evaluated. `delivered` counts the ones that went out before it.
    #[error("notifying alert {alert_id} failed: {source}")]
    Notify {
        alert_id: Uuid,
        delivered: usize,
        #[source]
        source: NotifyError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Pick the trigger for one alert against one change event, if any.
pub fn decide(alert: &Alert, change: &ProductChange) -> Option<Trigger> {
    let product = &change.product;
    let previously_out = change.previous.as_ref().map(|p| !p.in_stock);
    let notified_in_stock = alert.last_notified_in_stock == Some(true);

    if let (Some(target), Some(price)) = (alert.target_price, product.current_price) {
        let fresh = change.price_changed
            || alert
                .last_notified_price
                .map_or(true, |last| price < last);
        if price <= target && fresh {
            return Some(Trigger::TargetPrice);
        }
    }

    if alert.notify_on_restock
        && change.stock_changed
        && product.in_stock
        && previously_out == Some(true)
    {
        return Some(Trigger::Restock);
    }

    if alert.notify_on_in_stock && product.in_stock {
        let was_out = previously_out.unwrap_or(!notified_in_stock);
        if was_out && (change.stock_changed || !notified_in_stock) {
            return Some(Trigger::BackInStock);
        }
    }

    None
}

pub struct AlertEvaluator {
    catalog: Catalog,
    alerts: AlertStore,
    sink: Arc<dyn NotificationSink>,
    send_timeout: Duration,
}

impl AlertEvaluator {
    pub fn new(catalog: Catalog, alerts: AlertStore, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            catalog,
            alerts,
            sink,
            send_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Evaluate the active alerts of `change.product` in creation order.
    pub async fn evaluate(
        &self,
        change: &ProductChange,
    ) -> Result<Vec<DispatchedNotification>, EvaluateError> {
        let alerts = self.alerts.active_alerts_for_product(change.product.id);
        let mut dispatched = Vec::new();
        for alert in alerts {
            let Some(trigger) = decide(&alert, change) else {
                continue;
            };
            match self.dispatch(&alert, &change.product, trigger).await {
                Ok(sent) => dispatched.push(sent),
                Err(EvaluateError::Notify {
                    alert_id, source, ..
                }) => {
                    return Err(EvaluateError::Notify {
                        alert_id,
                        delivered: dispatched.len(),
                        source,
                    })
                }
                Err(err) => return Err(err),
            }
        }
        Ok(dispatched)
    }

    /// Sweep every active alert against its product's current state as if
    /// price and stock had both just changed. No previous state is known, so
    /// stock rules fall back to the alert's own dedup state.
    pub async fn evaluate_bulk(&self) -> Result<Vec<DispatchedNotification>, EvaluateError> {
        let targets = self.alerts.active_alert_targets();
        info!(alerts = targets.len(), "bulk alert sweep");
        let mut dispatched = Vec::new();
        for (product, alert) in targets {
            let change = ProductChange {
                product,
                previous: None,
                price_changed: true,
                stock_changed: true,
            };
            let Some(trigger) = decide(&alert, &change) else {
                continue;
            };
            match self.dispatch(&alert, &change.product, trigger).await {
                Ok(sent) => dispatched.push(sent),
                Err(EvaluateError::Notify {
                    alert_id, source, ..
                }) => {
                    return Err(EvaluateError::Notify {
                        alert_id,
                        delivered: dispatched.len(),
                        source,
                    })
                }
                Err(err) => return Err(err),
            }
        }
        Ok(dispatched)
    }

    async fn dispatch(
        &self,
        alert: &Alert,
        product: &Product,
        trigger: Trigger,
    ) -> Result<DispatchedNotification, EvaluateError> {
        let user = self.alerts.get_user(alert.user_id)?;
        let store = self.catalog.get_store(product.store_id).ok();
        let message = render(
            &user.email,
            product,
            store.as_ref().map(|s| s.name.as_str()),
            store.as_ref().map(|s| s.base_url.as_str()),
        );

        let delivery = tokio::time::timeout(self.send_timeout, self.sink.send(&message))
            .await
            .unwrap_or(Err(NotifyError::Timeout(self.send_timeout)));
        if let Err(source) = delivery {
            warn!(alert = %alert.id, product = %product.id, error = %source, "alert notification failed");
            return Err(EvaluateError::Notify {
                alert_id: alert.id,
                delivered: 0,
                source,
            });
        }

        self.alerts
            .mark_notified(alert.id, product.current_price, product.in_stock)?;
        debug!(alert = %alert.id, ?trigger, "alert notified");
        Ok(DispatchedNotification {
            alert_id: alert.id,
            user_id: alert.user_id,
            product_id: product.id,
            trigger,
            message,
        })
    }
}

/// Whole forint amount with space-grouped thousands: 12990 → "12 990 Ft".
pub fn format_price(amount: i64) -> String {
    let digits = amount.unsigned_abs().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }
    if amount < 0 {
        grouped.insert(0, '-');
    }
    format!("{grouped} Ft")
}

pub fn render(
    to: &str,
    product: &Product,
    store_name: Option<&str>,
    store_base_url: Option<&str>,
) -> OutboundMessage {
    let price_text = product
        .current_price
        .map(format_price)
        .unwrap_or_else(|| "Ismeretlen ár".to_string());
    let url = store_base_url
        .and_then(|base| absolute_url(base, &product.product_url))
        .unwrap_or_else(|| product.product_url.clone());
    let subject = if product.in_stock {
        format!("Pokémon árriasztás: {} elérhető", product.name)
    } else {
        format!("Pokémon árriasztás: {}", product.name)
    };
    let store_line = store_name
        .map(|s| format!(" a(z) {s} kínálatában"))
        .unwrap_or_default();
    let html = format!(
        "<p>Szia!</p>\n\
         <p>A(z) <strong>{name}</strong> termék frissült{store_line}.</p>\n\
         <ul>\n\
         <li>Ár: {price_text}</li>\n\
         <li>Rendelhető: {available}</li>\n\
         <li>Állapot: {status}</li>\n\
         </ul>\n\
         <p><a href=\"{url}\">Nézd meg a terméket</a></p>\n\
         <p>Pokémon Scout</p>\n",
        name = product.name,
        available = if product.in_stock { "igen" } else { "nem" },
        status = product.status.as_deref().unwrap_or("ismeretlen"),
    );
    let text = format!("{} | {} | {}", product.name, price_text, url);

    OutboundMessage {
        to: to.to_string(),
        subject,
        html,
        text,
    }
}
