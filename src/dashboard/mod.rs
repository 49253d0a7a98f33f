use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::db::{BalanceSnapshot, Database};
use crate::ledger::{BetFilter, ClvSummary, Diagnosis, Performance};
use crate::models::{Market, Order, OrderStatus};

const DEFAULT_BET_LIMIT: usize = 50;
const CLV_WINDOW: usize = 100;
const DIAGNOSIS_MIN_SAMPLE: usize = 30;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    /// Bankroll reported before anything has been persisted
    pub initial_bankroll: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub performance: Performance,
    pub clv: ClvSummary,
    pub clv_by_market: BTreeMap<Market, ClvSummary>,
    pub diagnosis: Diagnosis,
}

/// GET /api/bets query string
#[derive(Debug, Default, Deserialize)]
pub struct BetsQuery {
    pub event_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub limit: Option<usize>,
}

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

fn internal(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

/// Build the read-only reporting router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/performance", get(performance_handler))
        .route("/api/bets", get(bets_handler))
        .route("/api/balance-history", get(balance_history_handler))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Reporting API listening on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// GET /api/performance
async fn performance_handler(State(state): State<Arc<AppState>>) -> ApiResult<PerformanceReport> {
    let ledger = state.db.load_ledger(state.initial_bankroll).map_err(internal)?;
    Ok(Json(PerformanceReport {
        performance: ledger.get_performance(),
        clv: ledger.rolling_clv(CLV_WINDOW),
        clv_by_market: ledger.clv_by_market(),
        diagnosis: ledger.diagnose(DIAGNOSIS_MIN_SAMPLE),
    }))
}

/// GET /api/bets?event_id=&status=&limit=
async fn bets_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BetsQuery>,
) -> ApiResult<Vec<Order>> {
    let ledger = state.db.load_ledger(state.initial_bankroll).map_err(internal)?;
    let filter = BetFilter {
        event_id: query.event_id,
        status: query.status,
        limit: Some(query.limit.unwrap_or(DEFAULT_BET_LIMIT)),
        ..BetFilter::default()
    };
    Ok(Json(ledger.get_bet_history(&filter)))
}

/// GET /api/balance-history
async fn balance_history_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<BalanceSnapshot>> {
    state
        .db
        .get_balance_history(200)
        .map(Json)
        .map_err(internal)
}
