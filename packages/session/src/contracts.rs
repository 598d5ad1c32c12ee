//! Typed handles for the token, sale and staking contracts.

use std::{fmt, sync::Arc, time::Duration};

use primitive_types::U256;

use crate::{
    abi::{AbiSet, ContractAbi, DecodedOutput, Token},
    cache::StakePosition,
    config::ContractAddresses,
    error::{Result, SessionError},
    rpc::ReadProvider,
    types::{Address, TxHash},
    wallet::{TxReceipt, TxRequest, WalletProvider},
};

/// What a binding talks to the chain through.
#[derive(Clone)]
pub enum Backend {
    ReadOnly(Arc<dyn ReadProvider>),
    Signer {
        wallet: Arc<dyn WalletProvider>,
        from: Address,
    },
}

impl Backend {
    pub fn signer(&self) -> Option<Address> {
        match self {
            Backend::ReadOnly(_) => None,
            Backend::Signer { from, .. } => Some(*from),
        }
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Backend::ReadOnly(provider) => provider.call(to, data).await,
            Backend::Signer { wallet, .. } => wallet.call(to, data).await,
        }
    }

    pub async fn balance(&self, address: Address) -> Result<U256> {
        match self {
            Backend::ReadOnly(provider) => provider.balance(address).await,
            Backend::Signer { wallet, .. } => wallet.balance(address).await,
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::ReadOnly(_) => f.write_str("ReadOnly"),
            Backend::Signer { from, .. } => write!(f, "Signer({})", from),
        }
    }
}

/// One deployed contract bound to a backend.
#[derive(Clone, Debug)]
pub struct Contract {
    pub address: Address,
    abi: Arc<ContractAbi>,
    backend: Backend,
}

impl Contract {
    pub fn new(address: Address, abi: Arc<ContractAbi>, backend: Backend) -> Self {
        Self {
            address,
            abi,
            backend,
        }
    }

    pub async fn read(&self, function: &str, args: &[Token]) -> Result<DecodedOutput> {
        let f = self.abi.function(function)?;
        let data = f
            .encode(args)
            .map_err(|e| SessionError::ReadFailure(format!("{}: {:#}", function, e)))?;
        let ret = self
            .backend
            .call(self.address, data)
            .await
            .map_err(|e| SessionError::ReadFailure(format!("{}: {}", function, e.reason())))?;
        f.decode(&ret)
            .map_err(|e| SessionError::ReadFailure(format!("{}: {:#}", function, e)))
    }

    /// Sign and broadcast a call through the wallet.
    pub async fn send(&self, function: &str, args: &[Token], value: U256) -> Result<PendingTx> {
        let Backend::Signer { wallet, from } = &self.backend else {
            return Err(SessionError::NotConnected);
        };
        let f = self.abi.function(function)?;
        if !value.is_zero() && !f.payable {
            return Err(SessionError::InvalidAmount(format!(
                "{} does not accept a native value",
                function
            )));
        }
        let data = f
            .encode(args)
            .map_err(|e| SessionError::TransactionFailed(format!("{}: {:#}", function, e)))?;

        let hash = wallet
            .send_transaction(TxRequest {
                from: *from,
                to: self.address,
                data,
                value,
            })
            .await?;
        tracing::debug!(function, hash = %hash, "transaction sent");

        Ok(PendingTx {
            hash,
            wallet: Arc::clone(wallet),
        })
    }
}

/// A broadcast transaction that has not been confirmed yet.
pub struct PendingTx {
    hash: TxHash,
    wallet: Arc<dyn WalletProvider>,
}

impl PendingTx {
    pub fn hash(&self) -> TxHash {
        self.hash
    }

    /// Poll for the receipt until it arrives or `timeout` elapses.
    pub async fn wait(self, timeout: Duration, poll: Duration) -> Result<TxReceipt> {
        let hash = self.hash;
        let poll_receipt = async {
            loop {
                match self.wallet.transaction_receipt(hash).await {
                    Ok(Some(receipt)) => return Ok(receipt),
                    Ok(None) => {}
                    Err(e @ SessionError::Rpc { .. }) | Err(e @ SessionError::Transport(_)) => {
                        tracing::debug!(hash = %hash, error = %e, "receipt poll failed, retrying");
                    }
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(poll).await;
            }
        };

        let receipt = tokio::time::timeout(timeout, poll_receipt)
            .await
            .map_err(|_| {
                SessionError::TransactionFailed(format!(
                    "no receipt for {} after {}s",
                    hash,
                    timeout.as_secs()
                ))
            })??;

        if !receipt.success {
            return Err(SessionError::TransactionFailed(format!(
                "transaction {} reverted in block {}",
                hash, receipt.block_number
            )));
        }
        Ok(receipt)
    }
}

#[derive(Clone, Debug)]
pub struct TokenContract(pub Contract);

#[derive(Clone, Debug)]
pub struct SaleContract(pub Contract);

#[derive(Clone, Debug)]
pub struct StakingContract(pub Contract);

impl TokenContract {
    pub async fn balance_of(&self, owner: Address) -> Result<U256> {
        self.0
            .read("balanceOf", &[Token::Address(owner)])
            .await?
            .uint_at(0)
    }

    pub async fn approve(&self, spender: Address, amount: U256) -> Result<PendingTx> {
        self.0
            .send(
                "approve",
                &[Token::Address(spender), Token::Uint(amount)],
                U256::zero(),
            )
            .await
    }
}

impl SaleContract {
    pub async fn sale_active(&self) -> Result<bool> {
        self.0.read("saleActive", &[]).await?.bool_at(0)
    }

    pub async fn min_buy_wei(&self) -> Result<U256> {
        self.0.read("minBuyWei", &[]).await?.uint_at(0)
    }

    pub async fn tokens_per_bnb(&self) -> Result<U256> {
        self.0.read("tokensPerBNB", &[]).await?.uint_at(0)
    }

    pub async fn available_tokens(&self) -> Result<U256> {
        self.0.read("availableTokens", &[]).await?.uint_at(0)
    }

    pub async fn buy(&self, value_wei: U256) -> Result<PendingTx> {
        self.0.send("buy", &[], value_wei).await
    }
}

impl StakingContract {
    pub async fn stake_count(&self, owner: Address) -> Result<u64> {
        let count = self
            .0
            .read("stakeCount", &[Token::Address(owner)])
            .await?
            .uint_at(0)?;
        small(count, "stake count")
    }

    pub async fn stake_at(&self, owner: Address, index: u64) -> Result<StakePosition> {
        let out = self
            .0
            .read(
                "stakes",
                &[Token::Address(owner), Token::Uint(index.into())],
            )
            .await?;
        let amount_wei = out.uint_named(&["amount"], 0)?;
        let start_time = small(out.uint_named(&["startTime", "start"], 1)?, "start time")?;
        let duration_days = small(out.uint_named(&["durationDays", "duration"], 2)?, "duration")?;

        Ok(StakePosition {
            index,
            amount_wei,
            start_time,
            duration_days,
            unlock_time: start_time.saturating_add(duration_days.saturating_mul(86_400)),
            can_withdraw: false,
        })
    }

    pub async fn can_withdraw(&self, owner: Address, index: u64) -> Result<bool> {
        self.0
            .read(
                "canWithdraw",
                &[Token::Address(owner), Token::Uint(index.into())],
            )
            .await?
            .bool_at(0)
    }

    pub async fn stake(&self, amount: U256, months: u32) -> Result<PendingTx> {
        self.0
            .send(
                "stake",
                &[Token::Uint(amount), Token::Uint(months.into())],
                U256::zero(),
            )
            .await
    }

    pub async fn withdraw(&self, index: u64) -> Result<PendingTx> {
        self.0
            .send("withdraw", &[Token::Uint(index.into())], U256::zero())
            .await
    }
}

/// Narrow a uint read that must fit in 64 bits (counts, timestamps).
fn small(v: U256, what: &str) -> Result<u64> {
    if v > U256::from(u64::MAX) {
        return Err(SessionError::ReadFailure(format!("{} {} out of range", what, v)));
    }
    Ok(v.low_u64())
}

/// The three contracts bound to one backend.
///
/// `epoch` increases on every rebuild; account-scoped work started against an
/// older epoch is stale once a newer binding is installed. `chain_epoch` only
/// increases when the chain itself changed, which is all sale-wide reads
/// depend on.
#[derive(Clone, Debug)]
pub struct ContractBinding {
    pub token: TokenContract,
    pub sale: SaleContract,
    pub staking: StakingContract,
    pub epoch: u64,
    pub chain_epoch: u64,
    backend: Backend,
}

impl ContractBinding {
    pub fn new(
        abis: &Arc<AbiSet>,
        addresses: &ContractAddresses,
        backend: Backend,
        epoch: u64,
        chain_epoch: u64,
    ) -> Self {
        let bind = |address: Address, abi: &Arc<ContractAbi>| {
            Contract::new(address, Arc::clone(abi), backend.clone())
        };
        Self {
            token: TokenContract(bind(addresses.token, &abis.token)),
            sale: SaleContract(bind(addresses.sale, &abis.sale)),
            staking: StakingContract(bind(addresses.staking, &abis.staking)),
            epoch,
            chain_epoch,
            backend,
        }
    }

    /// Address writes are signed by, if bound to a signer.
    pub fn signer(&self) -> Option<Address> {
        self.backend.signer()
    }

    pub fn is_read_only(&self) -> bool {
        self.signer().is_none()
    }

    /// Native-currency balance through the bound backend.
    pub async fn native_balance(&self, owner: Address) -> Result<U256> {
        self.backend
            .balance(owner)
            .await
            .map_err(|e| SessionError::ReadFailure(format!("balance: {}", e.reason())))
    }
}
