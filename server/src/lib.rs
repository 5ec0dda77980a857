//! HTTP and WebSocket surface of the wheelspin prize engine.

use axum::{
    extract::{
        rejection::JsonRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State as AxumState,
    },
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use prometheus_client::{encoding::text::encode, registry::Registry};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};
use wheelspin_execution::{
    journal::Journal,
    tiered::{Backend, Tiered},
    ClaimError, Engine, Memory, Metrics, SpinError, StoreError, TemplateStore,
};
use wheelspin_types::{
    api::{
        ClaimRequest, ErrorResponse, GrantRequest, Health, SetLimitRequest, SpinRequest,
        SpinResponse, TemplateQuery, Update, ERROR_ALREADY_CLAIMED, ERROR_EMPTY_POOL,
        ERROR_INTERNAL, ERROR_INVALID_CONFIG, ERROR_INVALID_REQUEST, ERROR_IN_PROGRESS,
        ERROR_NOT_FOUND, ERROR_NO_SPINS_REMAINING, ERROR_UNAVAILABLE, ERROR_UNKNOWN_TEMPLATE,
    },
    HistoryEntry, HistoryFilter, PrizeProbability, SpinBudget, SpinPolicyConfig, Stats,
};

pub mod config;

pub use config::{Config, ConfigError, ValidatedConfig};

/// Store the service runs on: the configured backend behind a timeout and an
/// optional in-memory fallback.
pub type Store = Tiered<Backend>;

const UPDATES_CAPACITY: usize = 1024;

pub struct Service {
    engine: Engine<Store>,
    registry: Registry,
    update_tx: broadcast::Sender<Update>,
    history_limit: usize,
}

impl Service {
    /// Open the configured backend and assemble the engine around it.
    pub async fn build(config: ValidatedConfig) -> Result<Self, StoreError> {
        let mut registry = Registry::with_prefix("wheelspin");
        let metrics = Metrics::new(&mut registry);

        let backend = match &config.journal {
            Some(path) => {
                let journal = Journal::open(path).await?;
                info!(path = %path.display(), "opened journal");
                Backend::Journal(journal)
            }
            None => {
                warn!("no journal configured, spins will not survive a restart");
                Backend::Memory(Memory::new())
            }
        };
        let store = Tiered::new(
            backend,
            config.store_timeout,
            config.fallback_to_memory,
            metrics.clone(),
        );
        let engine = Engine::new(Arc::new(store), config.templates, metrics, config.rng_seed);

        let (update_tx, _) = broadcast::channel(UPDATES_CAPACITY);
        Ok(Self {
            engine,
            registry,
            update_tx,
            history_limit: config.history_limit,
        })
    }

    pub fn engine(&self) -> &Engine<Store> {
        &self.engine
    }

    pub fn update_subscriber(&self) -> broadcast::Receiver<Update> {
        self.update_tx.subscribe()
    }

    fn publish(&self, entry: HistoryEntry) {
        // No subscribers is not an error.
        let _ = self.update_tx.send(entry);
    }

    /// Render all metrics in the OpenMetrics text format.
    pub fn encode_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// Errors returned by handlers, rendered as an [ErrorResponse].
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Spin(#[from] SpinError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] wheelspin_types::ConfigError),
    #[error("unknown template: {0}")]
    UnknownTemplate(String),
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

fn unavailable(error: &StoreError) -> (StatusCode, &'static str, String) {
    warn!(?error, "store unavailable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        ERROR_UNAVAILABLE,
        "temporarily unavailable, try again".to_string(),
    )
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            ApiError::Spin(SpinError::UnknownTemplate(_)) | ApiError::UnknownTemplate(_) => {
                (StatusCode::NOT_FOUND, ERROR_UNKNOWN_TEMPLATE, self.to_string())
            }
            ApiError::Spin(SpinError::EmptyPool) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ERROR_EMPTY_POOL,
                self.to_string(),
            ),
            ApiError::Spin(SpinError::LimitExceeded { .. }) => (
                StatusCode::FORBIDDEN,
                ERROR_NO_SPINS_REMAINING,
                self.to_string(),
            ),
            ApiError::Spin(SpinError::InProgress(_)) => {
                (StatusCode::CONFLICT, ERROR_IN_PROGRESS, self.to_string())
            }
            ApiError::Spin(SpinError::Unavailable(error))
            | ApiError::Claim(ClaimError::Unavailable(error))
            | ApiError::Store(error) => unavailable(error),
            ApiError::Spin(SpinError::InvalidSlice(_)) | ApiError::Internal(_) => {
                warn!(error = %self, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ERROR_INTERNAL,
                    "internal error".to_string(),
                )
            }
            ApiError::Claim(ClaimError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, ERROR_NOT_FOUND, self.to_string())
            }
            ApiError::Claim(ClaimError::AlreadyClaimed(_)) => {
                (StatusCode::CONFLICT, ERROR_ALREADY_CLAIMED, self.to_string())
            }
            ApiError::Spin(SpinError::RequestConflict(_))
            | ApiError::Claim(ClaimError::NotASpin(_))
            | ApiError::InvalidRequest(_) => (
                StatusCode::BAD_REQUEST,
                ERROR_INVALID_REQUEST,
                self.to_string(),
            ),
            ApiError::Config(_) => (
                StatusCode::BAD_REQUEST,
                ERROR_INVALID_CONFIG,
                self.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        (status, Json(ErrorResponse::new(code, message))).into_response()
    }
}

pub struct Api {
    service: Arc<Service>,
    rate_limit: Option<(u64, u32)>,
}

impl Api {
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            rate_limit: None,
        }
    }

    /// Limit each client IP to `per_second` requests with bursts of `burst`.
    pub fn with_rate_limit(mut self, per_second: u64, burst: u32) -> Self {
        self.rate_limit = Some((per_second, burst));
        self
    }

    pub fn router(&self) -> Router {
        // Configure CORS
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);

        let mut router = Router::new()
            .route("/spin", post(spin))
            .route("/claim", post(claim))
            .route("/players/:player/limit", get(get_limit).put(set_limit))
            .route("/players/:player/grant", post(grant))
            .route("/history", get(history))
            .route("/stats", get(stats))
            .route("/templates", get(list_templates))
            .route("/templates/:template", get(get_template).put(put_template))
            .route("/templates/:template/probabilities", get(probabilities))
            .route("/health", get(health))
            .route("/metrics", get(metrics))
            .route("/updates", get(updates_ws))
            .layer(cors);

        if let Some((per_second, burst)) = self.rate_limit {
            // The governor refills one token per period.
            let period = (1_000_000_000 / per_second.max(1)).max(1);
            match GovernorConfigBuilder::default()
                .per_nanosecond(period)
                .burst_size(burst)
                .key_extractor(SmartIpKeyExtractor)
                .finish()
            {
                Some(config) => {
                    router = router.layer(GovernorLayer {
                        config: Arc::new(config),
                    });
                }
                None => warn!(per_second, burst, "invalid rate limit, serving without one"),
            }
        }

        router.with_state(self.service.clone())
    }
}

fn required(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::InvalidRequest(format!("{field} is required")));
    }
    Ok(())
}

async fn spin(
    AxumState(service): AxumState<Arc<Service>>,
    payload: Result<Json<SpinRequest>, JsonRejection>,
) -> Result<Json<SpinResponse>, ApiError> {
    let Json(request) = payload?;
    required("sessionId", &request.session_id)?;
    required("template", &request.template)?;

    let receipt = service.engine.spin(request).await?;
    if !receipt.replayed {
        service.publish(receipt.entry.clone());
    }
    Ok(Json(receipt.response()))
}

async fn claim(
    AxumState(service): AxumState<Arc<Service>>,
    payload: Result<Json<ClaimRequest>, JsonRejection>,
) -> Result<Json<HistoryEntry>, ApiError> {
    let Json(request) = payload?;
    required("sessionId", &request.session_id)?;

    let receipt = service
        .engine
        .claim(request.entry_id, &request.session_id)
        .await?;
    service.publish(receipt.claim);
    Ok(Json(receipt.spin))
}

async fn get_limit(
    AxumState(service): AxumState<Arc<Service>>,
    Path(player): Path<String>,
    Query(query): Query<TemplateQuery>,
) -> Result<Json<SpinBudget>, ApiError> {
    let budget = service
        .engine
        .status(&player, query.template.as_deref())
        .await?;
    Ok(Json(budget))
}

async fn set_limit(
    AxumState(service): AxumState<Arc<Service>>,
    Path(player): Path<String>,
    payload: Result<Json<SetLimitRequest>, JsonRejection>,
) -> Result<Json<SpinBudget>, ApiError> {
    let Json(request) = payload?;
    let budget = service
        .engine
        .set_limit(&player, request.max_spins, request.template.as_deref())
        .await?;
    Ok(Json(budget))
}

async fn grant(
    AxumState(service): AxumState<Arc<Service>>,
    Path(player): Path<String>,
    payload: Result<Json<GrantRequest>, JsonRejection>,
) -> Result<Json<SpinBudget>, ApiError> {
    let Json(request) = payload?;
    let budget = service
        .engine
        .grant(&player, request.additional, request.template.as_deref())
        .await?;
    Ok(Json(budget))
}

async fn history(
    AxumState(service): AxumState<Arc<Service>>,
    Query(mut filter): Query<HistoryFilter>,
) -> Result<Json<Vec<HistoryEntry>>, ApiError> {
    filter.limit = Some(filter.limit.unwrap_or(service.history_limit));
    Ok(Json(service.engine.history(&filter).await?))
}

async fn stats(
    AxumState(service): AxumState<Arc<Service>>,
    Query(query): Query<TemplateQuery>,
) -> Result<Json<Stats>, ApiError> {
    Ok(Json(
        service.engine.stats(query.template.as_deref()).await?,
    ))
}

async fn list_templates(AxumState(service): AxumState<Arc<Service>>) -> Json<Vec<String>> {
    Json(service.engine.templates().ids())
}

async fn get_template(
    AxumState(service): AxumState<Arc<Service>>,
    Path(template): Path<String>,
) -> Result<Json<SpinPolicyConfig>, ApiError> {
    let config = service
        .engine
        .templates()
        .get(&template)
        .ok_or(ApiError::UnknownTemplate(template))?;
    Ok(Json(config.as_ref().clone()))
}

async fn put_template(
    AxumState(service): AxumState<Arc<Service>>,
    Path(template): Path<String>,
    payload: Result<Json<SpinPolicyConfig>, JsonRejection>,
) -> Result<Json<SpinPolicyConfig>, ApiError> {
    let Json(config) = payload?;
    required("template", &template)?;
    let stored = service.engine.put_template(&template, config)?;
    info!(%template, prizes = stored.prizes.len(), "stored template");
    Ok(Json(stored.as_ref().clone()))
}

async fn probabilities(
    AxumState(service): AxumState<Arc<Service>>,
    Path(template): Path<String>,
) -> Result<Json<Vec<PrizeProbability>>, ApiError> {
    service
        .engine
        .probabilities(&template)
        .map(Json)
        .ok_or(ApiError::UnknownTemplate(template))
}

async fn health(AxumState(service): AxumState<Arc<Service>>) -> Json<Health> {
    Json(service.engine.health())
}

async fn metrics(AxumState(service): AxumState<Arc<Service>>) -> Result<Response, ApiError> {
    let body = service
        .encode_metrics()
        .map_err(|e| ApiError::Internal(format!("failed to encode metrics: {e}")))?;
    Ok((
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

async fn updates_ws(
    AxumState(service): AxumState<Arc<Service>>,
    Query(filter): Query<HistoryFilter>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_updates_ws(socket, service, filter))
}

async fn handle_updates_ws(socket: WebSocket, service: Arc<Service>, filter: HistoryFilter) {
    info!(?filter, "updates WebSocket connected");
    let (mut sender, mut receiver) = socket.split();
    let mut updates = service.update_subscriber();

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) => {
                        debug!("client closed WebSocket connection");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            debug!("failed to send pong, client disconnected");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(?e, "WebSocket error");
                        break;
                    }
                    None => break,
                    _ => {}
                }
            }
            update = updates.recv() => {
                match update {
                    Ok(entry) => {
                        if !filter.matches(&entry) {
                            continue;
                        }
                        let text = match serde_json::to_string(&entry) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(?e, id = entry.id, "failed to serialize update");
                                continue;
                            }
                        };
                        if sender.send(Message::Text(text)).await.is_err() {
                            debug!("failed to send update, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // The client can recover the gap from /history.
                        warn!(skipped, "WebSocket client lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    info!("updates WebSocket handler exiting");
    let _ = sender.close().await;
}

#[cfg(test)]
mod tests;
