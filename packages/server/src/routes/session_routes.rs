use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use joda_session::{
    state::now_ms,
    units::{format_countdown, format_units, referral_link, short_address, DECIMALS},
    ConnectionState, RefreshReport, SessionSnapshot,
};
use serde::Serialize;

use super::session_error;
use crate::state::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    #[serde(flatten)]
    snapshot: SessionSnapshot,
    display: DisplayView,
}

/// Preformatted strings so the UI does not need fixed-point math.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DisplayView {
    #[serde(skip_serializing_if = "Option::is_none")]
    short_address: Option<String>,
    referral_link: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    native_balance: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_balance: Option<String>,
    stakes: Vec<StakeView>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StakeView {
    index: u64,
    amount: String,
    duration_days: u64,
    countdown: String,
    can_withdraw: bool,
}

fn display(snapshot: &SessionSnapshot, site_url: &str) -> DisplayView {
    let address = snapshot.state.address.as_ref();
    let balances = snapshot.cache.balances.as_ref().map(|b| &b.value);
    let now_secs = now_ms() / 1000;

    let stakes = snapshot
        .cache
        .stakes
        .as_ref()
        .map(|s| s.value.as_slice())
        .unwrap_or_default()
        .iter()
        .map(|stake| StakeView {
            index: stake.index,
            amount: format_units(stake.amount_wei, DECIMALS),
            duration_days: stake.duration_days,
            countdown: format_countdown(stake.seconds_left(now_secs)),
            can_withdraw: stake.can_withdraw,
        })
        .collect();

    DisplayView {
        short_address: address.map(short_address),
        referral_link: referral_link(site_url, address),
        native_balance: balances.map(|b| format_units(b.native_wei, DECIMALS)),
        token_balance: balances.map(|b| format_units(b.token_wei, DECIMALS)),
        stakes,
    }
}

/// `GET /api/session`: connection state, cached reads and pending transactions.
async fn get_session(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    let snapshot = state.session.snapshot();
    let display = display(&snapshot, &state.site_url);
    Json(SessionResponse { snapshot, display })
}

/// `POST /api/connect`: ask the wallet for authorization.
async fn connect(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ConnectionState>, (StatusCode, String)> {
    let connected = state.session.connect().await.map_err(session_error)?;
    Ok(Json(connected))
}

/// `POST /api/disconnect`: forget the account and fall back to read-only.
async fn disconnect(State(state): State<Arc<AppState>>) -> Json<ConnectionState> {
    Json(state.session.disconnect())
}

/// `POST /api/refresh`: refresh the cache now instead of waiting for the loop.
async fn refresh(State(state): State<Arc<AppState>>) -> Json<RefreshReport> {
    Json(state.session.refresh().await)
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/session", get(get_session))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/refresh", post(refresh))
}
