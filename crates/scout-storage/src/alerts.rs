//! Users and their per-product alert rules.

use chrono::Utc;
use scout_core::{normalize_email, Alert, AlertPatch, NewAlert, Product, User};
use uuid::Uuid;

use crate::persistence::Database;
use crate::StorageError;

#[derive(Debug, Clone)]
pub struct AlertStore {
    db: Database,
}

impl AlertStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn create_user(&self, email: &str, is_admin: bool) -> Result<User, StorageError> {
        let email = normalize_email(email);
        if email.is_empty() {
            return Err(StorageError::Conflict("e-mail must not be empty".into()));
        }
        self.db.write(|t| {
            if t.user_id_by_email(&email).is_some() {
                return Err(StorageError::Conflict(format!("user {email} already exists")));
            }
            let now = Utc::now();
            let user = User {
                id: Uuid::new_v4(),
                email: email.clone(),
                is_admin,
                created_at: now,
                updated_at: now,
            };
            t.insert_user(user.clone());
            Ok(user)
        })
    }

    /// Existing user for `email`, or a new non-admin one.
    pub fn ensure_user(&self, email: &str) -> Result<User, StorageError> {
        match self.user_by_email(email) {
            Some(user) => Ok(user),
            None => self.create_user(email, false),
        }
    }

    pub fn get_user(&self, id: Uuid) -> Result<User, StorageError> {
        self.db
            .read(|t| t.users.get(&id).cloned())
            .ok_or_else(|| StorageError::not_found("user", id))
    }

    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let email = normalize_email(email);
        self.db.read(|t| {
            t.user_id_by_email(&email)
                .and_then(|id| t.users.get(&id).cloned())
        })
    }

    pub fn set_admin(&self, id: Uuid, is_admin: bool) -> Result<User, StorageError> {
        self.db.write(|t| {
            let user = t
                .users
                .get_mut(&id)
                .ok_or_else(|| StorageError::not_found("user", id))?;
            user.is_admin = is_admin;
            user.updated_at = Utc::now();
            Ok(user.clone())
        })
    }

    pub fn list_users(&self) -> Vec<User> {
        self.db.read(|t| {
            let mut users: Vec<User> = t.users.values().cloned().collect();
            users.sort_by(|a, b| a.email.cmp(&b.email));
            users
        })
    }

    /// One alert per (product, user); a second one is a conflict.
    pub fn create_alert(&self, user_id: Uuid, input: &NewAlert) -> Result<Alert, StorageError> {
        self.db.write(|t| {
            if !t.users.contains_key(&user_id) {
                return Err(StorageError::not_found("user", user_id));
            }
            if !t.products.contains_key(&input.product_id) {
                return Err(StorageError::not_found("product", input.product_id));
            }
            if t.alert_id_by_owner(input.product_id, user_id).is_some() {
                return Err(StorageError::Conflict(
                    "an alert for this product already exists".into(),
                ));
            }
            let now = Utc::now();
            let alert = Alert {
                id: Uuid::new_v4(),
                product_id: input.product_id,
                user_id,
                target_price: input.target_price,
                notify_on_in_stock: input.notify_on_in_stock.unwrap_or(true),
                notify_on_restock: input.notify_on_restock.unwrap_or(true),
                active: true,
                last_notified_at: None,
                last_notified_price: None,
                last_notified_in_stock: None,
                created_at: now,
                updated_at: now,
            };
            t.insert_alert(alert.clone());
            Ok(alert)
        })
    }

    /// The user's alerts, newest first.
    pub fn list_alerts(&self, user_id: Uuid) -> Vec<Alert> {
        self.db.read(|t| {
            let mut alerts: Vec<Alert> = t
                .alerts
                .values()
                .filter(|a| a.user_id == user_id)
                .cloned()
                .collect();
            alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            alerts
        })
    }

    /// Alerts owned by someone else are reported as missing.
    pub fn get_alert(&self, user_id: Uuid, alert_id: Uuid) -> Result<Alert, StorageError> {
        self.db
            .read(|t| t.alerts.get(&alert_id).filter(|a| a.user_id == user_id).cloned())
            .ok_or_else(|| StorageError::not_found("alert", alert_id))
    }

    pub fn update_alert(
        &self,
        user_id: Uuid,
        alert_id: Uuid,
        patch: &AlertPatch,
    ) -> Result<Alert, StorageError> {
        self.db.write(|t| {
            let alert = t
                .alerts
                .get_mut(&alert_id)
                .filter(|a| a.user_id == user_id)
                .ok_or_else(|| StorageError::not_found("alert", alert_id))?;
            if let Some(target) = patch.target_price {
                alert.target_price = target;
            }
            if let Some(flag) = patch.notify_on_in_stock {
                alert.notify_on_in_stock = flag;
            }
            if let Some(flag) = patch.notify_on_restock {
                alert.notify_on_restock = flag;
            }
            if let Some(active) = patch.active {
                alert.active = active;
            }
            alert.updated_at = Utc::now();
            Ok(alert.clone())
        })
    }

    pub fn delete_alert(&self, user_id: Uuid, alert_id: Uuid) -> Result<(), StorageError> {
        self.db.write(|t| {
            let owned = t
                .alerts
                .get(&alert_id)
                .is_some_and(|a| a.user_id == user_id);
            if !owned {
                return Err(StorageError::not_found("alert", alert_id));
            }
            t.remove_alert(alert_id);
            Ok(())
        })
    }

    /// Active alerts on one product in creation order.
    pub fn active_alerts_for_product(&self, product_id: Uuid) -> Vec<Alert> {
        self.db.read(|t| {
            let mut alerts: Vec<Alert> = t
                .alerts
                .values()
                .filter(|a| a.active && a.product_id == product_id)
                .cloned()
                .collect();
            alerts.sort_by_key(|a| (a.created_at, a.id));
            alerts
        })
    }

    /// Every active alert joined with its product, for a full sweep.
    pub fn active_alert_targets(&self) -> Vec<(Product, Alert)> {
        self.db.read(|t| {
            let mut pairs: Vec<(Product, Alert)> = t
                .alerts
                .values()
                .filter(|a| a.active)
                .filter_map(|a| t.products.get(&a.product_id).map(|p| (p.clone(), a.clone())))
                .collect();
            pairs.sort_by_key(|(_, a)| (a.product_id, a.created_at, a.id));
            pairs
        })
    }

    /// Record that a notification went out for the given state.
    pub fn mark_notified(
        &self,
        alert_id: Uuid,
        price: Option<i64>,
        in_stock: bool,
    ) -> Result<Alert, StorageError> {
        self.db.write(|t| {
            let alert = t
                .alerts
                .get_mut(&alert_id)
                .ok_or_else(|| StorageError::not_found("alert", alert_id))?;
            let now = Utc::now();
            alert.last_notified_at = Some(now);
            alert.last_notified_price = price;
            alert.last_notified_in_stock = Some(in_stock);
            alert.updated_at = now;
            Ok(alert.clone())
        })
    }
}
