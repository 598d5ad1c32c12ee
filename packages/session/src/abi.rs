//! Contract ABI loading and static-type calldata encoding.
//!
//! Only the static types the JODA contracts use are supported (`address`,
//! `uintN`, `bool`, and static tuples of those). Every argument and return
//! value therefore occupies exactly one 32-byte word.

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::{anyhow, bail, Context};
use primitive_types::U256;
use serde::Deserialize;
use serde_json::Value;
use tiny_keccak::{Hasher, Keccak};

use crate::{
    error::{Result, SessionError},
    types::Address,
};

pub const TOKEN_ABI_FILE: &str = "JODA.json";
pub const SALE_ABI_FILE: &str = "JODASale.json";
pub const STAKING_ABI_FILE: &str = "JODAStaking.json";

const TOKEN_FUNCTIONS: &[&str] = &["balanceOf", "approve"];
const SALE_FUNCTIONS: &[&str] = &[
    "saleActive",
    "minBuyWei",
    "tokensPerBNB",
    "availableTokens",
    "buy",
];
const STAKING_FUNCTIONS: &[&str] = &["stake", "withdraw", "stakeCount", "stakes", "canWithdraw"];

#[derive(Debug, Clone, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub components: Vec<AbiParam>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AbiEntry {
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    inputs: Vec<AbiParam>,
    #[serde(default)]
    outputs: Vec<AbiParam>,
    #[serde(default)]
    state_mutability: Option<String>,
    #[serde(default)]
    payable: Option<bool>,
}

fn function_kind() -> String {
    "function".to_string()
}

/// A single ABI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(U256),
    Bool(bool),
}

#[derive(Debug, Clone)]
pub struct Function {
    pub name: String,
    pub inputs: Vec<AbiParam>,
    pub outputs: Vec<AbiParam>,
    pub payable: bool,
    pub selector: [u8; 4],
}

/// Decoded return values, addressable by position or by output name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedOutput {
    pub names: Vec<String>,
    pub values: Vec<Token>,
}

#[derive(Debug, Clone)]
pub struct ContractAbi {
    pub name: String,
    functions: HashMap<String, Function>,
}

/// ABIs for the three contracts the session talks to.
#[derive(Debug, Clone)]
pub struct AbiSet {
    pub token: Arc<ContractAbi>,
    pub sale: Arc<ContractAbi>,
    pub staking: Arc<ContractAbi>,
}

/// First four bytes of keccak256 of a canonical signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut keccak = Keccak::v256();
    keccak.update(data);
    let mut out = [0u8; 32];
    keccak.finalize(&mut out);
    out
}

fn canonical_type(param: &AbiParam) -> String {
    match param.kind.strip_prefix("tuple") {
        Some(suffix) => {
            let inner: Vec<String> = param.components.iter().map(canonical_type).collect();
            format!("({}){}", inner.join(","), suffix)
        }
        None => param.kind.clone(),
    }
}

/// Flatten static tuples into their leaf parameters.
fn flatten<'a>(params: &'a [AbiParam], out: &mut Vec<&'a AbiParam>) {
    for p in params {
        if p.kind == "tuple" {
            flatten(&p.components, out);
        } else {
            out.push(p);
        }
    }
}

impl Function {
    fn from_entry(entry: AbiEntry) -> Self {
        let payable = entry.state_mutability.as_deref() == Some("payable")
            || entry.payable.unwrap_or(false);
        let mut function = Self {
            name: entry.name,
            inputs: entry.inputs,
            outputs: entry.outputs,
            payable,
            selector: [0u8; 4],
        };
        function.selector = selector(&function.signature());
        function
    }

    /// Canonical signature, e.g. `stake(uint256,uint256)`.
    pub fn signature(&self) -> String {
        let inputs: Vec<String> = self.inputs.iter().map(canonical_type).collect();
        format!("{}({})", self.name, inputs.join(","))
    }

    pub fn encode(&self, args: &[Token]) -> anyhow::Result<Vec<u8>> {
        let mut leaves = Vec::new();
        flatten(&self.inputs, &mut leaves);
        if leaves.len() != args.len() {
            bail!(
                "{} takes {} arguments, got {}",
                self.name,
                leaves.len(),
                args.len()
            );
        }

        let mut data = Vec::with_capacity(4 + 32 * args.len());
        data.extend_from_slice(&self.selector);
        for (param, arg) in leaves.iter().zip(args) {
            data.extend_from_slice(&encode_word(&param.kind, arg)?);
        }
        Ok(data)
    }

    pub fn decode(&self, data: &[u8]) -> anyhow::Result<DecodedOutput> {
        let mut leaves = Vec::new();
        flatten(&self.outputs, &mut leaves);
        if data.len() < leaves.len() * 32 {
            bail!(
                "{} returned {} bytes, expected at least {}",
                self.name,
                data.len(),
                leaves.len() * 32
            );
        }

        let mut values = Vec::with_capacity(leaves.len());
        for (i, param) in leaves.iter().enumerate() {
            let word: &[u8; 32] = data[i * 32..(i + 1) * 32]
                .try_into()
                .context("short word")?;
            values.push(decode_word(&param.kind, word)?);
        }

        Ok(DecodedOutput {
            names: leaves.iter().map(|p| p.name.clone()).collect(),
            values,
        })
    }
}

fn encode_word(kind: &str, arg: &Token) -> anyhow::Result<[u8; 32]> {
    let mut word = [0u8; 32];
    match (kind, arg) {
        ("address", Token::Address(a)) => word = a.to_word(),
        ("bool", Token::Bool(b)) => word[31] = u8::from(*b),
        (k, Token::Uint(v)) if k.starts_with("uint") => word = uint_word(v),
        (k, other) => bail!("cannot encode {:?} as {}", other, k),
    }
    Ok(word)
}

/// Big-endian word of a uint; limbs are stored least significant first.
fn uint_word(value: &U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    for (chunk, limb) in word.chunks_exact_mut(8).zip(value.0.iter().rev()) {
        chunk.copy_from_slice(&limb.to_be_bytes());
    }
    word
}

fn decode_word(kind: &str, word: &[u8; 32]) -> anyhow::Result<Token> {
    match kind {
        "address" => {
            let mut out = [0u8; 20];
            out.copy_from_slice(&word[12..]);
            Ok(Token::Address(Address(out)))
        }
        "bool" => Ok(Token::Bool(word[31] != 0)),
        k if k.starts_with("uint") => Ok(Token::Uint(U256::from_big_endian(word))),
        other => bail!("unsupported return type {}", other),
    }
}

impl DecodedOutput {
    pub fn get(&self, name: &str) -> Option<&Token> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn uint_at(&self, index: usize) -> Result<U256> {
        match self.values.get(index) {
            Some(Token::Uint(v)) => Ok(*v),
            other => Err(SessionError::ReadFailure(format!(
                "expected uint at output {}, got {:?}",
                index, other
            ))),
        }
    }

    pub fn bool_at(&self, index: usize) -> Result<bool> {
        match self.values.get(index) {
            Some(Token::Bool(v)) => Ok(*v),
            other => Err(SessionError::ReadFailure(format!(
                "expected bool at output {}, got {:?}",
                index, other
            ))),
        }
    }

    /// Named uint output, falling back to `fallback_index` for unnamed ABIs.
    pub fn uint_named(&self, names: &[&str], fallback_index: usize) -> Result<U256> {
        for name in names {
            if let Some(Token::Uint(v)) = self.get(name) {
                return Ok(*v);
            }
        }
        self.uint_at(fallback_index)
    }
}

impl ContractAbi {
    /// Parse either a bare ABI array or a build artifact with an `abi` field.
    pub fn from_json(name: &str, raw: &str) -> anyhow::Result<Self> {
        let value: Value =
            serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", name))?;
        let abi = match value {
            Value::Array(_) => value,
            Value::Object(mut obj) => obj
                .remove("abi")
                .ok_or_else(|| anyhow!("{}: artifact has no abi field", name))?,
            _ => bail!("{}: expected an ABI array or artifact object", name),
        };
        let entries: Vec<AbiEntry> =
            serde_json::from_value(abi).with_context(|| format!("{}: malformed ABI", name))?;

        let functions = entries
            .into_iter()
            .filter(|e| e.kind == "function")
            .map(|e| (e.name.clone(), Function::from_entry(e)))
            .collect();

        Ok(Self {
            name: name.to_string(),
            functions,
        })
    }

    pub fn function(&self, name: &str) -> Result<&Function> {
        self.functions.get(name).ok_or_else(|| {
            SessionError::Initialization(format!("{} has no function {}", self.name, name))
        })
    }

    fn require(&self, names: &[&str]) -> Result<()> {
        for name in names {
            self.function(name)?;
        }
        Ok(())
    }
}

impl AbiSet {
    /// Load the three ABI files from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let read = |file: &str| -> Result<String> {
            let path = dir.join(file);
            std::fs::read_to_string(&path).map_err(|e| {
                SessionError::Initialization(format!("failed reading {}: {}", path.display(), e))
            })
        };
        Self::from_json(
            &read(TOKEN_ABI_FILE)?,
            &read(SALE_ABI_FILE)?,
            &read(STAKING_ABI_FILE)?,
        )
    }

    pub fn from_json(token: &str, sale: &str, staking: &str) -> Result<Self> {
        let parse = |name: &str, raw: &str| {
            ContractAbi::from_json(name, raw)
                .map(Arc::new)
                .map_err(|e| SessionError::Initialization(format!("{:#}", e)))
        };
        let set = Self {
            token: parse(TOKEN_ABI_FILE, token)?,
            sale: parse(SALE_ABI_FILE, sale)?,
            staking: parse(STAKING_ABI_FILE, staking)?,
        };
        set.token.require(TOKEN_FUNCTIONS)?;
        set.sale.require(SALE_FUNCTIONS)?;
        set.staking.require(STAKING_FUNCTIONS)?;
        Ok(set)
    }
}
