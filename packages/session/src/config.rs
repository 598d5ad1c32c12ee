//! Session configuration.
//!
//! Defaults describe the BSC testnet deployment of the JODA contracts. A JSON
//! file (camelCase keys) may override any subset of fields.

use std::{path::Path, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::types::Address;

const DEFAULT_RPC: &str = "https://data-seed-prebsc-1-s1.binance.org:8545";
const DEFAULT_CHAIN_ID: u64 = 97;
const DEFAULT_TOKEN: &str = "0xB2EFA488040B036E50a18C9d2D8110AF743c5504";
const DEFAULT_SALE: &str = "0x9146aEE05EbCFD30950D4E964cE256e32E1CbcfD";
const DEFAULT_STAKING: &str = "0xee5ef7b0140a061032613F157c8366D5a29ABB95";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// JSON-RPC endpoint used when no wallet is connected.
    pub rpc_endpoint: String,
    /// Chain the contracts are deployed on.
    pub chain_id: u64,
    pub contracts: ContractAddresses,
    /// Period of the background refresh task.
    pub refresh_interval_ms: u64,
    /// How long to wait for a transaction receipt before giving up.
    pub tx_timeout_secs: u64,
    /// Receipt polling period while waiting for confirmation.
    pub receipt_poll_ms: u64,
    /// Longest a single cache group may take to load before it counts as failed.
    pub read_timeout_ms: u64,
    /// Directory holding `JODA.json`, `JODASale.json` and `JODAStaking.json`.
    pub abi_dir: PathBuf,
    /// Parameters for `wallet_addEthereumChain` when the wallet lacks the chain.
    pub chain: ChainParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractAddresses {
    pub token: Address,
    pub sale: Address,
    pub staking: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainParams {
    pub chain_name: String,
    pub native_currency: NativeCurrency,
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub block_explorer_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeCurrency {
    pub name: String,
    pub symbol: String,
    pub decimals: u8,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rpc_endpoint: DEFAULT_RPC.to_string(),
            chain_id: DEFAULT_CHAIN_ID,
            contracts: ContractAddresses::default(),
            refresh_interval_ms: 20_000,
            tx_timeout_secs: 180,
            receipt_poll_ms: 1_500,
            read_timeout_ms: 15_000,
            abi_dir: PathBuf::from("abi"),
            chain: ChainParams::default(),
        }
    }
}

impl Default for ContractAddresses {
    fn default() -> Self {
        Self {
            token: known_address(DEFAULT_TOKEN),
            sale: known_address(DEFAULT_SALE),
            staking: known_address(DEFAULT_STAKING),
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            chain_name: "BSC Testnet".to_string(),
            native_currency: NativeCurrency {
                name: "BNB".to_string(),
                symbol: "tBNB".to_string(),
                decimals: 18,
            },
            rpc_urls: vec![DEFAULT_RPC.to_string()],
            block_explorer_urls: vec!["https://testnet.bscscan.com".to_string()],
        }
    }
}

/// Compile-time constant addresses; covered by `default_addresses_parse`.
fn known_address(s: &str) -> Address {
    s.parse().unwrap_or_default()
}

impl SessionConfig {
    /// Load a config file, filling missing fields with defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        let config: SessionConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_secs)
    }

    pub fn receipt_poll(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_ms.max(1))
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}
