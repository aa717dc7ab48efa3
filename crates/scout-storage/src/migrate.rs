//! Upgrades of older data-file layouts.
//!
//! Layout 1 keyed alerts by subscriber e-mail. Layout 2 keys them by user id.
//! The upgrade maps every e-mail to an existing or newly created user and
//! carries the dedup state across, so no alert data is dropped.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use scout_core::{normalize_email, Alert, User};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::persistence::Tables;
use crate::StorageError;

pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub from_version: u32,
    pub alerts_rehomed: usize,
    pub users_created: usize,
    pub duplicates_merged: usize,
}

pub(crate) fn upgrade(mut document: Value) -> Result<(Tables, Option<MigrationReport>), StorageError> {
    let version = document
        .get("schemaVersion")
        .and_then(Value::as_u64)
        .unwrap_or(1) as u32;

    if version > SCHEMA_VERSION {
        return Err(StorageError::Migration(format!(
            "data file layout {version} is newer than supported layout {SCHEMA_VERSION}"
        )));
    }
    if version == SCHEMA_VERSION {
        let tables: Tables = serde_json::from_value(document)?;
        return Ok((tables, None));
    }

    let root = document
        .as_object_mut()
        .ok_or_else(|| StorageError::Migration("data file root is not an object".into()))?;
    let report = rehome_email_alerts(root)?;
    root.insert("schemaVersion".into(), Value::from(SCHEMA_VERSION));

    let tables: Tables = serde_json::from_value(document)?;
    Ok((tables, Some(report)))
}

fn rehome_email_alerts(root: &mut Map<String, Value>) -> Result<MigrationReport, StorageError> {
    let mut report = MigrationReport {
        from_version: 1,
        ..Default::default()
    };

    let mut users: BTreeMap<Uuid, User> = match root.remove("users") {
        Some(value) => serde_json::from_value(value)?,
        None => BTreeMap::new(),
    };
    let mut user_by_email: HashMap<String, Uuid> =
        users.values().map(|u| (u.email.clone(), u.id)).collect();

    let legacy_alerts = match root.remove("alerts") {
        Some(Value::Object(map)) => map,
        Some(Value::Null) | None => Map::new(),
        Some(_) => return Err(StorageError::Migration("alerts table is not a map".into())),
    };

    let mut alerts: Vec<Alert> = Vec::with_capacity(legacy_alerts.len());
    for (key, mut value) in legacy_alerts {
        let object = value
            .as_object_mut()
            .ok_or_else(|| StorageError::Migration(format!("alert {key} is not an object")))?;

        if !object.contains_key("userId") {
            let email = object
                .remove("email")
                .and_then(|v| v.as_str().map(normalize_email))
                .filter(|e| !e.is_empty())
                .ok_or_else(|| {
                    StorageError::Migration(format!("alert {key} has neither userId nor email"))
                })?;
            let created_at = object
                .get("createdAt")
                .cloned()
                .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok())
                .unwrap_or_else(Utc::now);

            let user_id = match user_by_email.get(&email) {
                Some(id) => *id,
                None => {
                    let user = User {
                        id: Uuid::new_v4(),
                        email: email.clone(),
                        is_admin: false,
                        created_at,
                        updated_at: created_at,
                    };
                    user_by_email.insert(email, user.id);
                    let id = user.id;
                    users.insert(id, user);
                    report.users_created += 1;
                    id
                }
            };
            object.insert("userId".into(), Value::String(user_id.to_string()));
            report.alerts_rehomed += 1;
        }

        alerts.push(serde_json::from_value(value)?);
    }

    // Two e-mails differing only in case collapse onto one user; keep the
    // oldest alert for each (product, user) pair.
    alerts.sort_by_key(|a| (a.created_at, a.id));
    let mut kept: BTreeMap<Uuid, Alert> = BTreeMap::new();
    let mut owners: HashMap<(Uuid, Uuid), Uuid> = HashMap::new();
    for alert in alerts {
        if owners.contains_key(&(alert.product_id, alert.user_id)) {
            report.duplicates_merged += 1;
            continue;
        }
        owners.insert((alert.product_id, alert.user_id), alert.id);
        kept.insert(alert.id, alert);
    }

    root.insert("users".into(), serde_json::to_value(users)?);
    root.insert("alerts".into(), serde_json::to_value(kept)?);
    Ok(report)
}
