//! Wallet capability: authorization, chain switching and transaction signing.
//!
//! `RpcWallet` talks EIP-1193 methods over JSON-RPC, which is what desktop
//! wallets expose on their local RPC port. `WalletWatcher` turns account and
//! chain changes into `WalletEvent` messages by polling.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use primitive_types::U256;
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
    config::ChainParams,
    error::{Result, SessionError},
    rpc::{self, JsonRpcClient, ReadProvider},
    types::{Address, TxHash},
};

/// A transaction for the wallet to sign and broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxRequest {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
    /// Native value attached, in wei.
    pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub hash: TxHash,
    pub block_number: u64,
    pub success: bool,
}

/// Notifications a wallet pushes when the user changes something outside the app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
}

#[async_trait]
pub trait WalletProvider: ReadProvider {
    /// Prompt the user to authorize accounts (`eth_requestAccounts`).
    async fn request_accounts(&self) -> Result<Vec<Address>>;

    /// Currently authorized accounts, without prompting.
    async fn accounts(&self) -> Result<Vec<Address>>;

    async fn switch_chain(&self, chain_id: u64) -> Result<()>;

    async fn add_chain(&self, chain_id: u64, params: &ChainParams) -> Result<()>;

    async fn send_transaction(&self, tx: TxRequest) -> Result<TxHash>;

    /// `None` while the transaction is not yet mined.
    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>>;
}

/// Wallet reached through an EIP-1193 JSON-RPC endpoint.
pub struct RpcWallet {
    client: JsonRpcClient,
}

impl RpcWallet {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: JsonRpcClient::new(url),
        }
    }

    pub fn url(&self) -> &str {
        self.client.url()
    }

    async fn address_list(&self, method: &str) -> Result<Vec<Address>> {
        let result = self.client.request(method, serde_json::json!([])).await?;
        let list = result.as_array().ok_or_else(|| {
            SessionError::Transport(format!("{}: expected an array of accounts", method))
        })?;

        let mut out = Vec::with_capacity(list.len());
        for entry in list {
            let s = rpc::expect_str(entry, method)?;
            let address = s
                .parse()
                .map_err(|e| SessionError::Transport(format!("{}: {:#}", method, e)))?;
            out.push(address);
        }
        Ok(out)
    }
}

#[async_trait]
impl ReadProvider for RpcWallet {
    async fn chain_id(&self) -> Result<u64> {
        self.client.eth_chain_id().await
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        self.client.eth_get_balance(address).await
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        self.client.eth_call(to, &data).await
    }
}

#[async_trait]
impl WalletProvider for RpcWallet {
    async fn request_accounts(&self) -> Result<Vec<Address>> {
        self.address_list("eth_requestAccounts").await
    }

    async fn accounts(&self) -> Result<Vec<Address>> {
        self.address_list("eth_accounts").await
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<()> {
        self.client
            .request(
                "wallet_switchEthereumChain",
                serde_json::json!([{ "chainId": rpc::to_quantity(chain_id.into()) }]),
            )
            .await?;
        Ok(())
    }

    async fn add_chain(&self, chain_id: u64, params: &ChainParams) -> Result<()> {
        let mut request = serde_json::to_value(params)
            .map_err(|e| SessionError::Transport(format!("chain params: {}", e)))?;
        if let Some(obj) = request.as_object_mut() {
            obj.insert(
                "chainId".to_string(),
                Value::String(rpc::to_quantity(chain_id.into())),
            );
        }
        self.client
            .request("wallet_addEthereumChain", serde_json::json!([request]))
            .await?;
        Ok(())
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<TxHash> {
        let result = self
            .client
            .request(
                "eth_sendTransaction",
                serde_json::json!([{
                    "from": tx.from.to_string(),
                    "to": tx.to.to_string(),
                    "data": format!("0x{}", hex::encode(&tx.data)),
                    "value": rpc::to_quantity(tx.value),
                }]),
            )
            .await?;
        rpc::expect_str(&result, "eth_sendTransaction")?
            .parse()
            .map_err(|e| SessionError::Transport(format!("eth_sendTransaction: {:#}", e)))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>> {
        let result = self
            .client
            .request(
                "eth_getTransactionReceipt",
                serde_json::json!([hash.to_string()]),
            )
            .await?;
        if result.is_null() {
            return Ok(None);
        }

        let block_number = result
            .get("blockNumber")
            .and_then(|v| v.as_str())
            .map(rpc::parse_hex_u64)
            .transpose()?
            .unwrap_or(0);
        // Pre-Byzantium receipts have no status field; treat them as success.
        let success = result
            .get("status")
            .and_then(|v| v.as_str())
            .map(rpc::parse_hex_u64)
            .transpose()?
            .map_or(true, |s| s == 1);

        Ok(Some(TxReceipt {
            hash,
            block_number,
            success,
        }))
    }
}

/// Polls a wallet for account and chain changes.
pub struct WalletWatcher;

impl WalletWatcher {
    /// Spawn the polling task. It stops when `tx` is closed.
    pub fn spawn(
        wallet: Arc<dyn WalletProvider>,
        interval: Duration,
        tx: mpsc::Sender<WalletEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut last_accounts: Option<Vec<Address>> = None;
            let mut last_chain: Option<u64> = None;
            let mut ticker = tokio::time::interval(interval);

            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    break;
                }

                match wallet.accounts().await {
                    Ok(accounts) => {
                        if last_accounts.as_ref().is_some_and(|prev| *prev != accounts)
                            && tx
                                .send(WalletEvent::AccountsChanged(accounts.clone()))
                                .await
                                .is_err()
                        {
                            break;
                        }
                        last_accounts = Some(accounts);
                    }
                    Err(e) => tracing::debug!(error = %e, "wallet accounts poll failed"),
                }

                match wallet.chain_id().await {
                    Ok(chain_id) => {
                        if last_chain.is_some_and(|prev| prev != chain_id)
                            && tx.send(WalletEvent::ChainChanged(chain_id)).await.is_err()
                        {
                            break;
                        }
                        last_chain = Some(chain_id);
                    }
                    Err(e) => tracing::debug!(error = %e, "wallet chain poll failed"),
                }
            }

            tracing::debug!("wallet watcher stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use axum::{extract::State, routing::post, Json, Router};
    use serde_json::json;

    use super::*;
    use crate::{error::UNRECOGNIZED_CHAIN_CODE, lock};

    /// Wallet whose accounts and chain the test flips directly.
    #[derive(Default)]
    struct ScriptedWallet {
        accounts: Mutex<Vec<Address>>,
        chain_id: Mutex<u64>,
    }

    #[async_trait]
    impl ReadProvider for ScriptedWallet {
        async fn chain_id(&self) -> Result<u64> {
            Ok(*lock(&self.chain_id))
        }

        async fn balance(&self, _address: Address) -> Result<U256> {
            Ok(U256::zero())
        }

        async fn call(&self, _to: Address, _data: Vec<u8>) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[async_trait]
    impl WalletProvider for ScriptedWallet {
        async fn request_accounts(&self) -> Result<Vec<Address>> {
            Ok(lock(&self.accounts).clone())
        }

        async fn accounts(&self) -> Result<Vec<Address>> {
            Ok(lock(&self.accounts).clone())
        }

        async fn switch_chain(&self, _chain_id: u64) -> Result<()> {
            Ok(())
        }

        async fn add_chain(&self, _chain_id: u64, _params: &ChainParams) -> Result<()> {
            Ok(())
        }

        async fn send_transaction(&self, _tx: TxRequest) -> Result<TxHash> {
            Err(SessionError::UserRejected)
        }

        async fn transaction_receipt(&self, _hash: TxHash) -> Result<Option<TxReceipt>> {
            Ok(None)
        }
    }

    async fn next_event(rx: &mut mpsc::Receiver<WalletEvent>) -> WalletEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn watcher_reports_changes_after_baseline() {
        let wallet = Arc::new(ScriptedWallet::default());
        *lock(&wallet.accounts) = vec![Address([1; 20])];
        *lock(&wallet.chain_id) = 97;

        let (tx, mut rx) = mpsc::channel(4);
        let handle = WalletWatcher::spawn(wallet.clone(), Duration::from_millis(5), tx);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err(), "first poll only seeds the baseline");

        *lock(&wallet.accounts) = vec![Address([2; 20])];
        assert_eq!(
            next_event(&mut rx).await,
            WalletEvent::AccountsChanged(vec![Address([2; 20])])
        );

        *lock(&wallet.chain_id) = 1;
        assert_eq!(next_event(&mut rx).await, WalletEvent::ChainChanged(1));

        *lock(&wallet.accounts) = Vec::new();
        assert_eq!(
            next_event(&mut rx).await,
            WalletEvent::AccountsChanged(Vec::new())
        );

        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    type Replies = Arc<HashMap<String, Value>>;

    async fn stub_rpc(State(replies): State<Replies>, Json(req): Json<Value>) -> Json<Value> {
        let method = req["method"].as_str().unwrap_or_default();
        let mut body = replies.get(method).cloned().unwrap_or_else(|| {
            json!({ "error": { "code": -32601, "message": "method not found" } })
        });
        body["jsonrpc"] = "2.0".into();
        body["id"] = req["id"].clone();
        Json(body)
    }

    /// Serve canned JSON-RPC replies, keyed by method, on a local port.
    async fn stub_wallet(replies: &[(&str, Value)]) -> RpcWallet {
        let replies: Replies = Arc::new(
            replies
                .iter()
                .map(|(method, reply)| (method.to_string(), reply.clone()))
                .collect(),
        );
        let app = Router::new().route("/", post(stub_rpc)).with_state(replies);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        RpcWallet::new(format!("http://{}", addr))
    }

    #[tokio::test]
    async fn receipt_status_decides_success() {
        let hash = TxHash([9; 32]);

        let wallet = stub_wallet(&[(
            "eth_getTransactionReceipt",
            json!({ "result": { "blockNumber": "0x10", "status": "0x0" } }),
        )])
        .await;
        assert_eq!(
            wallet.transaction_receipt(hash).await.unwrap(),
            Some(TxReceipt {
                hash,
                block_number: 16,
                success: false,
            })
        );

        let wallet = stub_wallet(&[(
            "eth_getTransactionReceipt",
            json!({ "result": { "blockNumber": "0x11", "status": "0x1" } }),
        )])
        .await;
        assert!(wallet.transaction_receipt(hash).await.unwrap().unwrap().success);
    }

    #[tokio::test]
    async fn null_receipt_is_still_pending() {
        let wallet = stub_wallet(&[("eth_getTransactionReceipt", json!({ "result": null }))]).await;
        assert_eq!(wallet.transaction_receipt(TxHash([1; 32])).await.unwrap(), None);
    }

    #[tokio::test]
    async fn wallet_error_codes_are_mapped() {
        let wallet = stub_wallet(&[
            (
                "eth_requestAccounts",
                json!({ "error": { "code": 4001, "message": "User rejected the request." } }),
            ),
            (
                "wallet_switchEthereumChain",
                json!({ "error": { "code": 4902, "message": "Unrecognized chain ID" } }),
            ),
        ])
        .await;

        assert_eq!(
            wallet.request_accounts().await.unwrap_err(),
            SessionError::UserRejected
        );
        assert!(matches!(
            wallet.switch_chain(97).await,
            Err(SessionError::Rpc {
                code: UNRECOGNIZED_CHAIN_CODE,
                ..
            })
        ));
        assert!(matches!(
            wallet.add_chain(97, &ChainParams::default()).await,
            Err(SessionError::Rpc { code: -32601, .. })
        ));
    }

    #[tokio::test]
    async fn accounts_balance_and_send() {
        let wallet = stub_wallet(&[
            (
                "eth_accounts",
                json!({ "result": ["0xB2EFA488040B036E50a18C9d2D8110AF743c5504"] }),
            ),
            ("eth_chainId", json!({ "result": "0x61" })),
            (
                "eth_getBalance",
                json!({ "result": "0x100000000000000000000000000000000" }),
            ),
            (
                "eth_sendTransaction",
                json!({ "result": format!("0x{}", "ab".repeat(32)) }),
            ),
        ])
        .await;

        let accounts = wallet.accounts().await.unwrap();
        let expected: Address = "0xb2efa488040b036e50a18c9d2d8110af743c5504".parse().unwrap();
        assert_eq!(accounts, vec![expected]);
        assert_eq!(wallet.chain_id().await.unwrap(), 97);
        assert_eq!(wallet.balance(expected).await.unwrap(), U256([0, 0, 1, 0]));

        let hash = wallet
            .send_transaction(TxRequest {
                from: expected,
                to: expected,
                data: vec![0xd0, 0xe3, 0x0d, 0xb0],
                value: U256::exp10(17),
            })
            .await
            .unwrap();
        assert_eq!(hash, TxHash([0xab; 32]));
    }

    #[tokio::test]
    async fn malformed_account_list_is_transport_error() {
        let wallet = stub_wallet(&[("eth_accounts", json!({ "result": "0x01" }))]).await;
        assert!(matches!(
            wallet.accounts().await,
            Err(SessionError::Transport(_))
        ));
    }
}
