mod actions;
mod config_routes;
mod health;
mod session_routes;
pub mod ws;

use std::sync::Arc;

use axum::{http::StatusCode, Router};
use joda_session::SessionError;

use crate::state::AppState;

/// Build the `/api` sub-router with all API routes.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(config_routes::router())
        .merge(session_routes::router())
        .merge(actions::router())
        .with_state(state)
}

/// Map a session error onto an HTTP status and message body.
pub(crate) fn session_error(e: SessionError) -> (StatusCode, String) {
    let status = match &e {
        SessionError::AlreadyPending(_) => StatusCode::CONFLICT,
        SessionError::InvalidAmount(_)
        | SessionError::NotConnected
        | SessionError::NoWallet
        | SessionError::WrongNetwork { .. } => StatusCode::BAD_REQUEST,
        SessionError::UserRejected => StatusCode::UNAUTHORIZED,
        SessionError::Initialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SessionError::TransactionFailed(_)
        | SessionError::ReadFailure(_)
        | SessionError::Rpc { .. }
        | SessionError::Transport(_) => StatusCode::BAD_GATEWAY,
    };
    tracing::debug!(status = %status, error = %e, "request failed");
    (status, e.to_string())
}
