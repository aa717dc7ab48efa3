//! JSON HTTP surface for Pokemon Scout: catalog queries, per-user alert CRUD,
//! on-demand ingestion and the in-memory log tail.

use std::future::Future;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use scout_core::{AlertPatch, NewAlert, ProductFilter, User};
use scout_storage::{AlertStore, Catalog, StorageError};
use scout_sync::{Ingestor, RunTarget, ScoutApp};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

mod error;
mod log_ring;

pub use error::ApiError;
pub use log_ring::{LogRing, DEFAULT_LOG_CAPACITY};

pub const CRATE_NAME: &str = "scout-web";

/// Header carrying the authenticated caller's user id, set by the auth layer
/// in front of this service.
pub const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub catalog: Catalog,
    pub alerts: AlertStore,
    pub ingestor: Arc<Ingestor>,
    pub logs: LogRing,
    /// Cron line of the scheduled run, when the scheduler is on.
    pub cron: Option<String>,
}

impl AppState {
    pub fn new(catalog: Catalog, alerts: AlertStore, ingestor: Arc<Ingestor>, logs: LogRing) -> Self {
        Self {
            catalog,
            alerts,
            ingestor,
            logs,
            cron: None,
        }
    }

    pub fn with_cron(mut self, cron: Option<String>) -> Self {
        self.cron = cron;
        self
    }

    pub fn from_app(app: &ScoutApp, logs: LogRing) -> Self {
        let cron = app
            .config
            .scheduler_enabled
            .then(|| app.config.scraper_cron.clone());
        Self::new(app.catalog.clone(), app.alerts.clone(), app.ingestor.clone(), logs).with_cron(cron)
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/stores", get(stores_handler))
        .route("/api/products", get(products_handler))
        .route("/api/products/{id}", get(product_handler))
        .route("/api/products/{id}/snapshots", get(snapshots_handler))
        .route("/api/alerts", get(list_alerts_handler).post(create_alert_handler))
        .route(
            "/api/alerts/{id}",
            get(get_alert_handler)
                .patch(update_alert_handler)
                .delete(delete_alert_handler),
        )
        .route("/api/scrape", post(scrape_handler))
        .route("/api/logs", get(logs_handler))
        .route("/api/logs/clear", post(clear_logs_handler))
        .with_state(state)
}

pub async fn serve<F>(state: AppState, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// The caller, resolved from [`USER_HEADER`].
pub struct CurrentUser(pub User);

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized("authentication required"))?;
        let id = Uuid::parse_str(raw.trim()).map_err(|_| ApiError::Unauthorized("invalid user id"))?;
        match state.alerts.get_user(id) {
            Ok(user) => Ok(Self(user)),
            Err(StorageError::NotFound { .. }) => Err(ApiError::Unauthorized("user not found")),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProductsQuery {
    store_id: Option<String>,
    search: Option<String>,
    in_stock: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

impl ProductsQuery {
    fn into_filter(self) -> Result<ProductFilter, ApiError> {
        let store_id = self
            .store_id
            .filter(|s| !s.is_empty())
            .map(|s| Uuid::parse_str(&s).map_err(|_| invalid("storeId", "must be a uuid")))
            .transpose()?;
        let in_stock = match self.in_stock.as_deref() {
            None => None,
            Some("true") => Some(true),
            Some("false") => Some(false),
            Some(_) => return Err(invalid("inStock", "must be true or false")),
        };
        let limit = self
            .limit
            .map(|raw| match raw.parse::<usize>() {
                Ok(n) if (1..=ProductFilter::MAX_LIMIT).contains(&n) => Ok(n),
                _ => Err(invalid(
                    "limit",
                    &format!("must be an integer between 1 and {}", ProductFilter::MAX_LIMIT),
                )),
            })
            .transpose()?;
        let offset = self
            .offset
            .map(|raw| raw.parse::<usize>().map_err(|_| invalid("offset", "must be a non-negative integer")))
            .transpose()?;

        Ok(ProductFilter {
            store_id,
            search: self.search.filter(|s| !s.trim().is_empty()),
            in_stock,
            limit,
            offset,
        })
    }
}

fn invalid(field: &str, message: &str) -> ApiError {
    ApiError::Validation(format!("{field}: {message}"))
}

/// Ids that do not parse cannot name an existing row.
fn parse_id(raw: &str, entity: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(format!("{entity} not found")))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::Validation(rejection.body_text()))
}

fn check_target_price(target: Option<i64>) -> Result<(), ApiError> {
    match target {
        Some(price) if price <= 0 => Err(invalid("targetPrice", "must be a positive integer")),
        _ => Ok(()),
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "ok": true,
        "cron": state.cron,
        "phase": state.ingestor.phase(),
        "running": state.ingestor.is_running(),
    }))
}

async fn stores_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "stores": state.catalog.list_stores() }))
}

async fn products_handler(
    State(state): State<AppState>,
    Query(query): Query<ProductsQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter = query.into_filter()?;
    Ok(Json(json!({ "products": state.catalog.list_products(&filter) })))
}

async fn product_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let product = state.catalog.get_product(parse_id(&id, "product")?)?;
    Ok(Json(json!({ "product": product })))
}

async fn snapshots_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let snapshots = state.catalog.snapshots(parse_id(&id, "product")?)?;
    Ok(Json(json!({ "snapshots": snapshots })))
}

async fn list_alerts_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Json<Value> {
    Json(json!({ "alerts": state.alerts.list_alerts(user.id) }))
}

async fn create_alert_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    payload: Result<Json<NewAlert>, JsonRejection>,
) -> Result<Response, ApiError> {
    let input = json_body(payload)?;
    check_target_price(input.target_price)?;
    let alert = state.alerts.create_alert(user.id, &input)?;
    info!(alert = %alert.id, product = %alert.product_id, user = %user.id, "alert created");
    Ok((StatusCode::CREATED, Json(json!({ "alert": alert }))).into_response())
}

async fn get_alert_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let alert = state.alerts.get_alert(user.id, parse_id(&id, "alert")?)?;
    Ok(Json(json!({ "alert": alert })))
}

async fn update_alert_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
    payload: Result<Json<AlertPatch>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let alert_id = parse_id(&id, "alert")?;
    let patch = json_body(payload)?;
    if patch.is_empty() {
        return Err(ApiError::Validation("no updatable fields given".into()));
    }
    check_target_price(patch.target_price.flatten())?;
    let alert = state.alerts.update_alert(user.id, alert_id, &patch)?;
    Ok(Json(json!({ "alert": alert })))
}

async fn delete_alert_handler(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.alerts.delete_alert(user.id, parse_id(&id, "alert")?)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeRequest {
    store_slug: Option<String>,
}

/// Runs synchronously: the response carries the run summary.
async fn scrape_handler(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let request: ScrapeRequest = if body.iter().all(u8::is_ascii_whitespace) {
        ScrapeRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| ApiError::Validation(err.to_string()))?
    };
    let target = match request.store_slug {
        Some(slug) if slug.trim().is_empty() => {
            return Err(invalid("storeSlug", "must not be empty"));
        }
        slug => RunTarget::from_slug(slug),
    };
    info!(?target, "scrape requested");
    let summary = state.ingestor.run(target).await?;
    Ok(Json(json!({ "ok": true, "summary": summary })))
}

async fn logs_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.logs.read().join("\n"),
    )
}

async fn clear_logs_handler(State(state): State<AppState>) -> Json<Value> {
    state.logs.clear();
    Json(json!({ "ok": true, "message": "Logs cleared" }))
}
