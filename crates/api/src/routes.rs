use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use marketstream_models::{wall_clock_now, Snapshot, SymbolUniverse};
use marketstream_services::{PipelineMetrics, PipelineStats, SnapshotStore};
use marketstream_stream::Broadcaster;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::websocket::live_feed;

pub const HEALTH_MESSAGE: &str = "MarketStream is running";

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<dyn SnapshotStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub universe: Arc<SymbolUniverse>,
    pub metrics: Arc<PipelineMetrics>,
}

pub fn create_routes() -> Router<AppState> {
    Router::new()
        // Snapshots
        .route("/api/market-data/snapshot/:symbol", get(get_snapshot))
        .route("/api/market-data/snapshots", get(get_all_snapshots))
        .route("/api/market-data/symbols", get(get_symbols))

        // Health and status
        .route("/api/market-data/health", get(health_check))
        .route("/api/market-data/stats", get(get_stats))
        .route("/metrics", get(get_metrics))

        // Live feed
        .route("/ws", get(live_feed))
}

/// Full application: routes, state, request tracing and CORS for `allowed_origins`.
pub fn create_app(state: AppState, allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("⚠️ Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET])
        .allow_headers(Any);

    create_routes()
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

async fn health_check() -> &'static str {
    HEALTH_MESSAGE
}

// Latest snapshot for one symbol
async fn get_snapshot(
    Path(symbol): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Snapshot>, StatusCode> {
    let symbol = symbol.to_uppercase();

    match state.cache.get(&symbol).await {
        Ok(Some(snapshot)) => Ok(Json(snapshot)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            warn!("⚠️ Cache read failed for {}: {}", symbol, e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

// One snapshot per symbol; symbols with nothing cached are seeded at their base price
async fn get_all_snapshots(State(state): State<AppState>) -> Json<Vec<Snapshot>> {
    let mut snapshots = Vec::with_capacity(state.universe.len());

    for spec in state.universe.specs() {
        let cached = match state.cache.get(&spec.symbol).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!("⚠️ Cache read failed for {}: {}", spec.symbol, e);
                None
            }
        };

        let snapshot = match cached {
            Some(snapshot) => snapshot,
            None => {
                let baseline = Snapshot::baseline(spec.symbol.clone(), spec.base_price, wall_clock_now());
                if let Err(e) = state.cache.put(&baseline).await {
                    warn!("⚠️ Failed to seed cache for {}: {}", spec.symbol, e);
                }
                debug!("Seeded baseline snapshot for {}", spec.symbol);
                baseline
            }
        };
        snapshots.push(snapshot);
    }

    Json(snapshots)
}

async fn get_symbols(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.universe.symbols().map(str::to_string).collect())
}

async fn get_stats(State(state): State<AppState>) -> Json<PipelineStats> {
    Json(state.metrics.stats())
}

async fn get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
