//! Connection state and the events the session broadcasts to its UI layer.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::{
    cache::CacheGroup,
    pending::TxKind,
    types::{Address, TxHash},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionMode {
    /// A wallet is present but has not authorized us yet.
    Disconnected,
    /// Reads go through the public RPC endpoint; writes are unavailable.
    ReadOnly,
    /// Reads and writes go through the wallet's signer.
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    pub mode: ConnectionMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    pub chain_id: u64,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.mode == ConnectionMode::Connected
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum SessionEvent {
    #[serde(rename = "session:state")]
    StateChanged { state: ConnectionState },
    #[serde(rename = "session:cache")]
    CacheUpdated { group: CacheGroup, stale: bool },
    /// The wallet signed and broadcast the transaction.
    #[serde(rename = "tx:submitted")]
    TxSubmitted { kind: TxKind, hash: TxHash },
    #[serde(rename = "tx:confirmed")]
    TxConfirmed { kind: TxKind },
    /// Mined, but the session was rebound meanwhile; nothing was refreshed.
    #[serde(rename = "tx:superseded")]
    TxSuperseded { kind: TxKind },
    #[serde(rename = "tx:failed")]
    TxFailed { kind: TxKind, error: String },
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
