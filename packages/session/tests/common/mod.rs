#![allow(dead_code)]

//! In-memory chain and wallet used by the session tests.
//!
//! Contract calls are dispatched on their selector against a small model of
//! the token, sale and staking contracts. Transactions mutate that model and
//! produce receipts immediately.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use joda_session::{
    abi::selector, error::UNRECOGNIZED_CHAIN_CODE, AbiSet, Address, ChainParams, ReadProvider,
    Result, SessionConfig, SessionError, SessionSync, TxHash, TxReceipt, TxRequest,
    WalletProvider, U256,
};
use tokio::sync::watch;

/// One whole BNB or JODA in base units.
pub const ONE: U256 = U256([1_000_000_000_000_000_000, 0, 0, 0]);
pub const CHAIN_ID: u64 = 97;
pub const NOW_SECS: u64 = 1_700_000_000;

pub const TOKEN_ABI: &str = r#"[
    {"type":"function","name":"balanceOf","stateMutability":"view",
     "inputs":[{"name":"account","type":"address"}],"outputs":[{"name":"","type":"uint256"}]},
    {"type":"function","name":"totalSupply","stateMutability":"view",
     "inputs":[],"outputs":[{"name":"","type":"uint256"}]},
    {"type":"function","name":"approve","stateMutability":"nonpayable",
     "inputs":[{"name":"spender","type":"address"},{"name":"value","type":"uint256"}],
     "outputs":[{"name":"","type":"bool"}]},
    {"type":"event","name":"Transfer","inputs":[]}
]"#;

pub const SALE_ABI: &str = r#"[
    {"type":"function","name":"saleActive","stateMutability":"view",
     "inputs":[],"outputs":[{"name":"","type":"bool"}]},
    {"type":"function","name":"minBuyWei","stateMutability":"view",
     "inputs":[],"outputs":[{"name":"","type":"uint256"}]},
    {"type":"function","name":"tokensPerBNB","stateMutability":"view",
     "inputs":[],"outputs":[{"name":"","type":"uint256"}]},
    {"type":"function","name":"availableTokens","stateMutability":"view",
     "inputs":[],"outputs":[{"name":"","type":"uint256"}]},
    {"type":"function","name":"buy","stateMutability":"payable","inputs":[],"outputs":[]}
]"#;

pub const STAKING_ABI: &str = r#"{"contractName":"JODAStaking","abi":[
    {"type":"function","name":"stake","stateMutability":"nonpayable",
     "inputs":[{"name":"amount","type":"uint256"},{"name":"months","type":"uint8"}],"outputs":[]},
    {"type":"function","name":"withdraw","stateMutability":"nonpayable",
     "inputs":[{"name":"index","type":"uint256"}],"outputs":[]},
    {"type":"function","name":"stakeCount","stateMutability":"view",
     "inputs":[{"name":"user","type":"address"}],"outputs":[{"name":"","type":"uint256"}]},
    {"type":"function","name":"stakes","stateMutability":"view",
     "inputs":[{"name":"","type":"address"},{"name":"","type":"uint256"}],
     "outputs":[{"name":"amount","type":"uint256"},{"name":"startTime","type":"uint256"},
                {"name":"durationDays","type":"uint256"},{"name":"withdrawn","type":"bool"}]},
    {"type":"function","name":"canWithdraw","stateMutability":"view",
     "inputs":[{"name":"user","type":"address"},{"name":"index","type":"uint256"}],
     "outputs":[{"name":"","type":"bool"}]}
]}"#;

pub fn addr(n: u8) -> Address {
    Address([n; 20])
}

/// `n` whole tokens (or BNB) in base units.
pub fn tokens(n: u64) -> U256 {
    ONE * n
}

pub fn abis() -> AbiSet {
    AbiSet::from_json(TOKEN_ABI, SALE_ABI, STAKING_ABI).unwrap()
}

pub fn config() -> SessionConfig {
    SessionConfig {
        chain_id: CHAIN_ID,
        refresh_interval_ms: 20,
        tx_timeout_secs: 1,
        receipt_poll_ms: 5,
        read_timeout_ms: 5_000,
        ..SessionConfig::default()
    }
}

/// A session whose reads and wallet both go to `chain`.
pub fn session(chain: &Arc<MockChain>) -> Arc<SessionSync> {
    session_with(chain, config())
}

pub fn session_with(chain: &Arc<MockChain>, config: SessionConfig) -> Arc<SessionSync> {
    SessionSync::with_providers(
        config,
        abis(),
        chain.clone(),
        Some(chain.clone() as Arc<dyn WalletProvider>),
    )
}

/// A session with no wallet at all.
pub fn read_only_session(chain: &Arc<MockChain>) -> Arc<SessionSync> {
    SessionSync::with_providers(config(), abis(), chain.clone(), None)
}

/// Poll `check` until it holds, failing the test after about a second.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchMode {
    Accept,
    /// Reply 4902 until the chain has been added.
    Unknown,
    Reject,
}

#[derive(Debug, Clone)]
pub struct MockStake {
    pub amount: U256,
    pub start: u64,
    pub days: u64,
    pub withdrawn: bool,
}

pub struct ChainState {
    pub chain_id: u64,
    pub accounts: Vec<Address>,
    pub native: HashMap<Address, U256>,
    pub tokens: HashMap<Address, U256>,
    pub allowances: HashMap<(Address, Address), U256>,
    pub stakes: HashMap<Address, Vec<MockStake>>,
    pub sale_active: bool,
    pub min_buy_wei: U256,
    pub tokens_per_bnb: U256,
    pub available_tokens: U256,
    pub now_secs: u64,
    pub failing: HashSet<[u8; 4]>,
    pub stalled: HashSet<[u8; 4]>,
    pub reject_accounts: bool,
    pub reject_send: bool,
    pub revert_next: bool,
    pub withhold_receipts: bool,
    pub switch_mode: SwitchMode,
    pub switch_calls: usize,
    pub added_chains: Vec<u64>,
    pub sent: Vec<TxRequest>,
    receipts: HashMap<TxHash, TxReceipt>,
}

pub struct MockChain {
    state: Mutex<ChainState>,
    gate: watch::Sender<bool>,
    stall_gate: watch::Sender<bool>,
    reads: AtomicUsize,
    waiting: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        let (stall_gate, _) = watch::channel(true);
        Arc::new(Self {
            state: Mutex::new(ChainState {
                chain_id: CHAIN_ID,
                accounts: vec![addr(1)],
                native: HashMap::from([(addr(1), tokens(10)), (addr(2), tokens(3))]),
                tokens: HashMap::from([(addr(1), tokens(100)), (addr(2), tokens(7))]),
                allowances: HashMap::new(),
                stakes: HashMap::new(),
                sale_active: true,
                min_buy_wei: ONE / 100u64,
                tokens_per_bnb: tokens(1_000),
                available_tokens: tokens(1_000_000),
                now_secs: NOW_SECS,
                failing: HashSet::new(),
                stalled: HashSet::new(),
                reject_accounts: false,
                reject_send: false,
                revert_next: false,
                withhold_receipts: false,
                switch_mode: SwitchMode::Accept,
                switch_calls: 0,
                added_chains: Vec::new(),
                sent: Vec::new(),
                receipts: HashMap::new(),
            }),
            gate,
            stall_gate,
            reads: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut ChainState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Contract calls issued from now on block until `release_reads`.
    pub fn hold_reads(&self) {
        self.gate.send_replace(false);
    }

    /// Calls to `signature` block until `release_reads`; other reads proceed.
    pub fn stall(&self, signature: &str) {
        self.with(|c| c.stalled.insert(selector(signature)));
        self.stall_gate.send_replace(false);
    }

    pub fn release_reads(&self) {
        self.with(|c| c.stalled.clear());
        self.gate.send_replace(true);
        self.stall_gate.send_replace(true);
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn fail(&self, signature: &str) {
        self.with(|c| c.failing.insert(selector(signature)));
    }

    pub fn heal(&self, signature: &str) {
        self.with(|c| c.failing.remove(&selector(signature)));
    }
}

fn word(v: impl Into<U256>) -> [u8; 32] {
    let v: U256 = v.into();
    let mut w = [0u8; 32];
    for (chunk, limb) in w.chunks_exact_mut(8).zip(v.0.iter().rev()) {
        chunk.copy_from_slice(&limb.to_be_bytes());
    }
    w
}

fn flag(b: bool) -> [u8; 32] {
    word(u64::from(b))
}

fn arg_address(args: &[u8], i: usize) -> Address {
    Address(args[i * 32 + 12..(i + 1) * 32].try_into().unwrap())
}

fn arg_uint(args: &[u8], i: usize) -> U256 {
    U256::from_big_endian(&args[i * 32..(i + 1) * 32])
}

fn is(sel: &[u8], signature: &str) -> bool {
    selector(signature)[..] == *sel
}

impl ChainState {
    fn read(&self, sel: &[u8], args: &[u8]) -> Result<Vec<u8>> {
        if self.failing.iter().any(|f| f[..] == *sel) {
            return Err(SessionError::Transport("injected read failure".into()));
        }
        let out = if is(sel, "balanceOf(address)") {
            word(self.tokens.get(&arg_address(args, 0)).copied().unwrap_or(U256::zero())).to_vec()
        } else if is(sel, "saleActive()") {
            flag(self.sale_active).to_vec()
        } else if is(sel, "minBuyWei()") {
            word(self.min_buy_wei).to_vec()
        } else if is(sel, "tokensPerBNB()") {
            word(self.tokens_per_bnb).to_vec()
        } else if is(sel, "availableTokens()") {
            word(self.available_tokens).to_vec()
        } else if is(sel, "stakeCount(address)") {
            let count = self.stakes.get(&arg_address(args, 0)).map_or(0, Vec::len);
            word(count as u64).to_vec()
        } else if is(sel, "stakes(address,uint256)") {
            let s = self.stake(arg_address(args, 0), arg_uint(args, 1))?;
            [
                word(s.amount),
                word(s.start),
                word(s.days),
                flag(s.withdrawn),
            ]
            .concat()
        } else if is(sel, "canWithdraw(address,uint256)") {
            let s = self.stake(arg_address(args, 0), arg_uint(args, 1))?;
            let ready = !s.withdrawn && s.start + s.days * 86_400 <= self.now_secs;
            flag(ready).to_vec()
        } else {
            return Err(SessionError::Rpc {
                code: -32000,
                message: "execution reverted".into(),
            });
        };
        Ok(out)
    }

    fn stake(&self, owner: Address, index: U256) -> Result<&MockStake> {
        self.stakes
            .get(&owner)
            .and_then(|s| s.get(index.low_u64() as usize))
            .ok_or_else(|| SessionError::Rpc {
                code: -32000,
                message: "execution reverted: bad index".into(),
            })
    }

    fn execute(&mut self, tx: TxRequest) -> Result<TxHash> {
        if self.reject_send {
            return Err(SessionError::UserRejected);
        }
        self.sent.push(tx.clone());
        let hash = TxHash([self.sent.len() as u8; 32]);
        let success = !std::mem::take(&mut self.revert_next);
        if success {
            self.apply(&tx);
        }
        self.receipts.insert(
            hash,
            TxReceipt {
                hash,
                block_number: 100 + self.sent.len() as u64,
                success,
            },
        );
        Ok(hash)
    }

    fn apply(&mut self, tx: &TxRequest) {
        let (sel, args) = tx.data.split_at(4);
        let from = tx.from;
        if is(sel, "buy()") {
            let bought = tx.value * (self.tokens_per_bnb / ONE);
            *self.native.entry(from).or_default() -= tx.value;
            *self.tokens.entry(from).or_default() += bought;
            self.available_tokens -= bought;
        } else if is(sel, "approve(address,uint256)") {
            self.allowances
                .insert((from, arg_address(args, 0)), arg_uint(args, 1));
        } else if is(sel, "stake(uint256,uint8)") {
            let amount = arg_uint(args, 0);
            let months = arg_uint(args, 1).low_u64();
            *self.tokens.entry(from).or_default() -= amount;
            let now = self.now_secs;
            self.stakes.entry(from).or_default().push(MockStake {
                amount,
                start: now,
                days: months * 30,
                withdrawn: false,
            });
        } else if is(sel, "withdraw(uint256)") {
            let index = arg_uint(args, 0).low_u64() as usize;
            if let Some(s) = self.stakes.get_mut(&from).and_then(|s| s.get_mut(index)) {
                s.withdrawn = true;
                let amount = s.amount;
                *self.tokens.entry(from).or_default() += amount;
            }
        }
    }
}

#[async_trait]
impl ReadProvider for MockChain {
    async fn chain_id(&self) -> Result<u64> {
        Ok(self.with(|c| c.chain_id))
    }

    async fn balance(&self, address: Address) -> Result<U256> {
        Ok(self.with(|c| c.native.get(&address).copied().unwrap_or_default()))
    }

    async fn call(&self, _to: Address, data: Vec<u8>) -> Result<Vec<u8>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let (sel, args) = data.split_at(4);

        let mut gate = if self.with(|c| c.stalled.iter().any(|s| s[..] == *sel)) {
            self.stall_gate.subscribe()
        } else {
            self.gate.subscribe()
        };
        let open = *gate.borrow();
        if !open {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let _ = gate.wait_for(|open| *open).await;
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        self.with(|c| c.read(sel, args))
    }
}

#[async_trait]
impl WalletProvider for MockChain {
    async fn request_accounts(&self) -> Result<Vec<Address>> {
        self.with(|c| {
            if c.reject_accounts {
                Err(SessionError::UserRejected)
            } else {
                Ok(c.accounts.clone())
            }
        })
    }

    async fn accounts(&self) -> Result<Vec<Address>> {
        Ok(self.with(|c| c.accounts.clone()))
    }

    async fn switch_chain(&self, chain_id: u64) -> Result<()> {
        self.with(|c| {
            c.switch_calls += 1;
            match c.switch_mode {
                SwitchMode::Reject => Err(SessionError::UserRejected),
                SwitchMode::Unknown if !c.added_chains.contains(&chain_id) => {
                    Err(SessionError::Rpc {
                        code: UNRECOGNIZED_CHAIN_CODE,
                        message: "Unrecognized chain ID".into(),
                    })
                }
                _ => {
                    c.chain_id = chain_id;
                    Ok(())
                }
            }
        })
    }

    async fn add_chain(&self, chain_id: u64, _params: &ChainParams) -> Result<()> {
        self.with(|c| {
            c.added_chains.push(chain_id);
            c.chain_id = chain_id;
        });
        Ok(())
    }

    async fn send_transaction(&self, tx: TxRequest) -> Result<TxHash> {
        self.with(|c| c.execute(tx))
    }

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<TxReceipt>> {
        Ok(self.with(|c| {
            if c.withhold_receipts {
                None
            } else {
                c.receipts.get(&hash).cloned()
            }
        }))
    }
}
