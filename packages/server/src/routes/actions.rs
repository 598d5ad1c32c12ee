use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use joda_session::{
    units::{parse_units, DECIMALS},
    TxReceipt, U256,
};
use serde::Deserialize;

use super::session_error;
use crate::state::AppState;

type ActionResult = Result<Json<TxReceipt>, (StatusCode, String)>;

/// Amounts are decimal strings in whole tokens (or BNB for `buy`), e.g. `"0.25"`.
#[derive(Debug, Deserialize)]
struct BuyRequest {
    amount: String,
}

#[derive(Debug, Deserialize)]
struct ApproveRequest {
    amount: String,
}

#[derive(Debug, Deserialize)]
struct StakeRequest {
    amount: String,
    months: u32,
}

fn amount(text: &str) -> Result<U256, (StatusCode, String)> {
    parse_units(text, DECIMALS).map_err(session_error)
}

/// `POST /api/buy`: buy tokens with native coin.
async fn buy(State(state): State<Arc<AppState>>, Json(req): Json<BuyRequest>) -> ActionResult {
    let value = amount(&req.amount)?;
    let receipt = state.session.buy(value).await.map_err(session_error)?;
    Ok(Json(receipt))
}

/// `POST /api/approve`: let the staking contract spend tokens.
async fn approve(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApproveRequest>,
) -> ActionResult {
    let value = amount(&req.amount)?;
    let receipt = state.session.approve(value).await.map_err(session_error)?;
    Ok(Json(receipt))
}

/// `POST /api/stake`: lock tokens for a number of months.
async fn stake(State(state): State<Arc<AppState>>, Json(req): Json<StakeRequest>) -> ActionResult {
    let value = amount(&req.amount)?;
    let receipt = state
        .session
        .stake(value, req.months)
        .await
        .map_err(session_error)?;
    Ok(Json(receipt))
}

/// `POST /api/stakes/:index/withdraw`
async fn withdraw(State(state): State<Arc<AppState>>, Path(index): Path<u64>) -> ActionResult {
    let receipt = state.session.withdraw(index).await.map_err(session_error)?;
    Ok(Json(receipt))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/buy", post(buy))
        .route("/approve", post(approve))
        .route("/stake", post(stake))
        .route("/stakes/{index}/withdraw", post(withdraw))
}
