use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use joda_session::{ChainParams, ContractAddresses};
use serde::Serialize;

use crate::state::AppState;

/// `GET /api/config`: deployment the session is bound to.
async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    let config = state.session.config();
    Json(ConfigResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        chain_id: config.chain_id,
        rpc_endpoint: config.rpc_endpoint.clone(),
        contracts: config.contracts.clone(),
        chain: config.chain.clone(),
        refresh_interval_ms: config.refresh_interval_ms,
        has_wallet: state.session.has_wallet(),
        site_url: state.site_url.clone(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfigResponse {
    version: String,
    chain_id: u64,
    rpc_endpoint: String,
    contracts: ContractAddresses,
    chain: ChainParams,
    refresh_interval_ms: u64,
    has_wallet: bool,
    site_url: String,
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/config", get(get_config))
}
