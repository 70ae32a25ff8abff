use crate::error::InventoryError;
use crate::events::EventSink;
use crate::metrics::Metrics;
use crate::repository::{Repository, ReservationFilter};
use crate::service::InventoryService;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        MatchedPath, Path, Query, Request, State,
    },
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use shared::{Product, ProductInventory, ProductionRequest, Reservation, ReservationRequest, ReserveState};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

pub const DEFAULT_PAGE_LIMIT: i64 = 50;
pub const MAX_PAGE_LIMIT: i64 = 1000;

pub struct AppState<R, E> {
    pub service: Arc<InventoryService<R, E>>,
    /// Per-subscriber buffer for websocket streams.
    pub subscriber_queue: usize,
    pub metrics: Metrics,
}

impl<R, E> Clone for AppState<R, E> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            subscriber_queue: self.subscriber_queue,
            metrics: self.metrics.clone(),
        }
    }
}

impl<R, E> AppState<R, E> {
    pub fn new(service: Arc<InventoryService<R, E>>, subscriber_queue: usize, metrics: Metrics) -> Self {
        Self {
            service,
            subscriber_queue: subscriber_queue.max(1),
            metrics,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageParams {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_PAGE_LIMIT).min(MAX_PAGE_LIMIT)
    }

    fn offset(&self) -> i64 {
        self.offset.unwrap_or(0)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReservationParams {
    pub sku: Option<String>,
    pub state: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Maps engine errors onto status codes. Storage and publish failures are
/// reported without detail.
#[derive(Debug)]
pub struct ApiError(InventoryError);

impl From<InventoryError> for ApiError {
    fn from(err: InventoryError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self.0 {
            InventoryError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse {
                    status: "Invalid request.".to_string(),
                    error: Some(msg.clone()),
                },
            ),
            InventoryError::NotFound { .. } => (
                StatusCode::NOT_FOUND,
                ErrorResponse {
                    status: "Resource not found.".to_string(),
                    error: None,
                },
            ),
            err => {
                error!(error = ?err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse {
                        status: "Internal server error.".to_string(),
                        error: Some("An internal server error has occurred.".to_string()),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_router<R, E>(state: AppState<R, E>) -> Router
where
    R: Repository,
    E: EventSink,
{
    let metrics = state.metrics.clone();
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(export_metrics::<R, E>))
        .route(
            "/api/v1/inventory",
            get(list_inventory::<R, E>).put(create_product::<R, E>),
        )
        .route("/api/v1/inventory/:sku", get(get_product_inventory::<R, E>))
        .route(
            "/api/v1/inventory/:sku/productionEvent",
            axum::routing::put(create_production_event::<R, E>),
        )
        .route(
            "/api/v1/reservation",
            get(list_reservations::<R, E>).put(create_reservation::<R, E>),
        )
        .route("/api/v1/reservation/:id", get(get_reservation::<R, E>))
        .route("/api/v1/subscriptions/inventory", get(subscribe_inventory::<R, E>))
        .route("/api/v1/subscriptions/reservations", get(subscribe_reservations::<R, E>))
        .route_layer(middleware::from_fn_with_state(metrics, track_requests))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

/// Records the hit and latency of every request that matched a route,
/// labelled by the route pattern rather than the raw path.
async fn track_requests(State(metrics): State<Metrics>, request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let route = request.extensions().get::<MatchedPath>().map(|path| path.as_str().to_owned());

    let response = next.run(request).await;
    if let Some(route) = route {
        metrics.observe_request(method.as_str(), &route, response.status().as_u16(), start.elapsed());
    }
    response
}

async fn export_metrics<R: Repository, E: EventSink>(State(state): State<AppState<R, E>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn list_inventory<R: Repository, E: EventSink>(
    State(state): State<AppState<R, E>>,
    Query(page): Query<PageParams>,
) -> ApiResult<Json<Vec<ProductInventory>>> {
    let inventory = state
        .service
        .get_all_product_inventory(page.limit(), page.offset())
        .await?;
    Ok(Json(inventory))
}

async fn create_product<R: Repository, E: EventSink>(
    State(state): State<AppState<R, E>>,
    Json(product): Json<Product>,
) -> ApiResult<(StatusCode, Json<Product>)> {
    if product.sku.is_empty() || product.upc.is_empty() || product.name.is_empty() {
        return Err(InventoryError::validation("missing required field(s)").into());
    }
    info!(sku = %product.sku, "creating product");
    state.service.create_product(product.clone()).await?;
    Ok((StatusCode::CREATED, Json(product)))
}

async fn get_product_inventory<R: Repository, E: EventSink>(
    State(state): State<AppState<R, E>>,
    Path(sku): Path<String>,
) -> ApiResult<Json<ProductInventory>> {
    Ok(Json(state.service.get_product_inventory(&sku).await?))
}

async fn create_production_event<R: Repository, E: EventSink>(
    State(state): State<AppState<R, E>>,
    Path(sku): Path<String>,
    Json(request): Json<ProductionRequest>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let product = state.service.get_product(&sku).await?;
    state.service.produce(&product, request).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({}))))
}

async fn list_reservations<R: Repository, E: EventSink>(
    State(state): State<AppState<R, E>>,
    Query(params): Query<ReservationParams>,
) -> ApiResult<Json<Vec<Reservation>>> {
    let reservation_state = match params.state.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<ReserveState>()
                .map_err(|_| InventoryError::validation("invalid state"))?,
        ),
    };
    let filter = ReservationFilter {
        sku: params.sku.filter(|sku| !sku.is_empty()),
        state: reservation_state,
    };
    let page = PageParams {
        limit: params.limit,
        offset: params.offset,
    };
    let reservations = state
        .service
        .get_reservations(&filter, page.limit(), page.offset())
        .await?;
    Ok(Json(reservations))
}

async fn create_reservation<R: Repository, E: EventSink>(
    State(state): State<AppState<R, E>>,
    Json(request): Json<ReservationRequest>,
) -> ApiResult<(StatusCode, Json<Reservation>)> {
    let reservation = state.service.reserve(request).await?;
    Ok((StatusCode::CREATED, Json(reservation)))
}

async fn get_reservation<R: Repository, E: EventSink>(
    State(state): State<AppState<R, E>>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Reservation>> {
    Ok(Json(state.service.get_reservation(id).await?))
}

async fn subscribe_inventory<R: Repository, E: EventSink>(
    State(state): State<AppState<R, E>>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("client requesting inventory subscription");
    ws.on_upgrade(move |socket| async move {
        let (sender, updates) = mpsc::channel(state.subscriber_queue);
        let id = state.service.subscribe_inventory(sender).await;
        stream_updates(socket, updates, &id.to_string()).await;
        state.service.unsubscribe_inventory(id).await;
    })
}

async fn subscribe_reservations<R: Repository, E: EventSink>(
    State(state): State<AppState<R, E>>,
    ws: WebSocketUpgrade,
) -> Response {
    info!("client requesting reservation subscription");
    ws.on_upgrade(move |socket| async move {
        let (sender, updates) = mpsc::channel(state.subscriber_queue);
        let id = state.service.subscribe_reservations(sender).await;
        stream_updates(socket, updates, &id.to_string()).await;
        state.service.unsubscribe_reservations(id).await;
    })
}

/// Forwards updates to the socket until either side goes away.
async fn stream_updates<T: Serialize>(socket: WebSocket, mut updates: mpsc::Receiver<T>, client: &str) {
    let (mut outgoing, mut incoming) = socket.split();
    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else {
                    debug!(client, "subscription closed by server");
                    break;
                };
                let body = match serde_json::to_string(&update) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(client, error = %e, "failed to serialize update");
                        continue;
                    }
                };
                debug!(client, "sending update to client");
                if let Err(e) = outgoing.send(Message::Text(body)).await {
                    warn!(client, error = %e, "failed to write update, disconnecting client");
                    break;
                }
            }
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None => {
                    debug!(client, "client disconnected");
                    break;
                }
                Some(Err(e)) => {
                    debug!(client, error = %e, "websocket error, disconnecting client");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }
    let _ = outgoing.close().await;
}
