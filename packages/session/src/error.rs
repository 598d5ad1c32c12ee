use thiserror::Error;

use crate::pending::TxKind;

/// EIP-1193 code for a request the user declined in the wallet.
pub const USER_REJECTED_CODE: i64 = 4001;
/// EIP-1193 code returned by `wallet_switchEthereumChain` for an unknown chain.
pub const UNRECOGNIZED_CHAIN_CODE: i64 = 4902;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// ABI or configuration could not be loaded. The only fatal kind.
    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("request rejected in wallet")]
    UserRejected,

    #[error("wrong network: expected chain {expected}, wallet is on chain {actual}")]
    WrongNetwork { expected: u64, actual: u64 },

    #[error("a {0} transaction is already pending")]
    AlreadyPending(TxKind),

    #[error("transaction failed: {0}")]
    TransactionFailed(String),

    #[error("read failed: {0}")]
    ReadFailure(String),

    #[error("no wallet available")]
    NoWallet,

    #[error("wallet not connected")]
    NotConnected,

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("RPC error ({code}): {message}")]
    Rpc { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    /// Map a JSON-RPC error object, folding wallet rejections into `UserRejected`.
    pub fn from_rpc(code: i64, message: impl Into<String>) -> Self {
        if code == USER_REJECTED_CODE {
            SessionError::UserRejected
        } else {
            SessionError::Rpc {
                code,
                message: message.into(),
            }
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Initialization(_))
    }

    /// Reason string without the kind prefix, used when re-wrapping.
    pub fn reason(&self) -> String {
        match self {
            SessionError::TransactionFailed(r)
            | SessionError::ReadFailure(r)
            | SessionError::Transport(r)
            | SessionError::InvalidAmount(r)
            | SessionError::Initialization(r) => r.clone(),
            SessionError::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        SessionError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_rejection_maps_to_user_rejected() {
        assert_eq!(
            SessionError::from_rpc(4001, "User denied"),
            SessionError::UserRejected
        );
        assert_eq!(
            SessionError::from_rpc(-32000, "execution reverted"),
            SessionError::Rpc {
                code: -32000,
                message: "execution reverted".into()
            }
        );
    }

    #[test]
    fn only_initialization_is_fatal() {
        assert!(SessionError::Initialization("abi".into()).is_fatal());
        assert!(!SessionError::UserRejected.is_fatal());
        assert!(!SessionError::AlreadyPending(TxKind::Buy).is_fatal());
    }
}
