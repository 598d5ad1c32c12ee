//! Wallet session and on-chain state synchronization for the JODA token sale
//! and staking contracts.
//!
//! [`SessionSync`] tracks the wallet connection, keeps contract bindings in
//! step with it, caches contract reads and serializes transactions per kind.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod abi;
pub mod cache;
pub mod config;
pub mod contracts;
pub mod error;
pub mod pending;
pub mod rpc;
pub mod session;
pub mod state;
pub mod types;
pub mod units;
pub mod wallet;

pub use abi::AbiSet;
pub use primitive_types::U256;
pub use cache::{Balances, CacheGroup, ReadCache, SaleParams, StakePosition, Timestamped};
pub use config::{ChainParams, ContractAddresses, SessionConfig};
pub use error::{Result, SessionError};
pub use pending::{PendingTransaction, TxKind};
pub use rpc::{HttpRpc, ReadProvider};
pub use session::{GroupOutcome, RefreshReport, SessionSnapshot, SessionSync};
pub use state::{ConnectionMode, ConnectionState, SessionEvent};
pub use types::{Address, TxHash};
pub use wallet::{RpcWallet, TxReceipt, TxRequest, WalletEvent, WalletProvider, WalletWatcher};

/// Lock a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
