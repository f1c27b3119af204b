//! Typed ABI descriptions, signature tables and call/log decoding.
//!
//! An [`Abi`] wraps an alloy [`JsonAbi`]; encoding and decoding go through
//! `alloy-dyn-abi` and values are handed out as [`AbiValue`] with
//! `primitive-types` integers and lowercase hex addresses.
//!
//! Entries are looked up by name or by full signature. A bare name resolves to
//! the first declared overload, so `safeTransferFrom` is the three-argument
//! form and `safeTransferFrom(address,address,uint256,bytes)` selects the other.

use std::sync::Arc;

use alloy_dyn_abi::{DynSolValue, EventExt, FunctionExt, JsonAbiExt, Specifier};
use alloy_json_abi::{Event, EventParam, Function, JsonAbi, Param as JsonParam, StateMutability};
use alloy_primitives::{Address, B256, I256};
use futures::future::try_join_all;
use primitive_types::U256;

use crate::rpc::{ChainClient, RpcError};

pub use alloy_dyn_abi::DynSolType as ParamType;

const WORD: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AbiError {
    #[error("unknown abi entry: {0}")]
    UnknownEntry(String),
    #[error("{0} is not an event")]
    NotAnEvent(String),
    #[error("{0} is not a function")]
    NotAFunction(String),
    #[error("invalid hex: {0}")]
    InvalidHex(String),
    #[error("expected {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },
    #[error("value {got} does not match type {expected}")]
    ValueMismatch { expected: String, got: String },
    #[error("log topics do not match event {0}")]
    TopicMismatch(String),
    #[error("abi codec: {0}")]
    Codec(String),
}

fn codec_error(error: alloy_dyn_abi::Error) -> AbiError {
    AbiError::Codec(error.to_string())
}

/// Parameter of an [`AbiEntry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub kind: ParamType,
    pub indexed: bool,
}

impl Param {
    pub fn new(name: &str, kind: ParamType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            indexed: false,
        }
    }

    pub fn indexed(name: &str, kind: ParamType) -> Self {
        Self {
            indexed: true,
            ..Self::new(name, kind)
        }
    }

    fn into_json(self) -> JsonParam {
        JsonParam {
            ty: self.kind.sol_type_name().into_owned(),
            name: self.name,
            components: Vec::new(),
            internal_type: None,
        }
    }

    fn into_event_json(self) -> EventParam {
        EventParam {
            ty: self.kind.sol_type_name().into_owned(),
            name: self.name,
            indexed: self.indexed,
            components: Vec::new(),
            internal_type: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiEntry {
    Function(Function),
    Event(Event),
}

impl AbiEntry {
    pub fn function(name: &str, inputs: Vec<Param>, outputs: Vec<Param>) -> Self {
        Self::Function(Function {
            name: name.to_string(),
            inputs: inputs.into_iter().map(Param::into_json).collect(),
            outputs: outputs.into_iter().map(Param::into_json).collect(),
            state_mutability: StateMutability::NonPayable,
        })
    }

    pub fn event(name: &str, inputs: Vec<Param>) -> Self {
        Self::Event(Event {
            name: name.to_string(),
            inputs: inputs.into_iter().map(Param::into_event_json).collect(),
            anonymous: false,
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Function(f) => &f.name,
            Self::Event(e) => &e.name,
        }
    }

    /// Canonical signature, e.g. `transfer(address,uint256)`.
    pub fn signature(&self) -> String {
        match self {
            Self::Function(f) => f.signature(),
            Self::Event(e) => e.signature(),
        }
    }
}

/// Decoded ABI value. Addresses are lowercase `0x` hex; signed integers keep
/// their two's complement word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Address(String),
    Uint(U256),
    Int(U256),
    Bool(bool),
    String(String),
    Bytes(Vec<u8>),
    FixedBytes(Vec<u8>),
    Array(Vec<AbiValue>),
}

impl AbiValue {
    pub fn address(value: &str) -> Self {
        Self::Address(value.to_ascii_lowercase())
    }

    pub fn uint(value: impl Into<U256>) -> Self {
        Self::Uint(value.into())
    }

    pub fn as_address(&self) -> Option<&str> {
        match self {
            Self::Address(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<U256> {
        match self {
            Self::Uint(v) | Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String value. `bytes32` values are read as NUL-padded strings.
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::String(s) => Some(s.clone()),
            Self::FixedBytes(bytes) => Some(
                String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[AbiValue]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Encode against `kind`, the declared type of the receiving parameter.
    fn to_sol(&self, kind: &ParamType) -> Result<DynSolValue, AbiError> {
        let mismatch = || AbiError::ValueMismatch {
            expected: kind.sol_type_name().into_owned(),
            got: format!("{self:?}"),
        };
        let value = match (kind, self) {
            (ParamType::Address, Self::Address(a)) => {
                DynSolValue::Address(a.parse::<Address>().map_err(|_| mismatch())?)
            }
            (ParamType::Uint(bits), Self::Uint(v)) => DynSolValue::Uint(to_alloy(*v), *bits),
            (ParamType::Int(bits), Self::Int(v) | Self::Uint(v)) => {
                DynSolValue::Int(I256::from_raw(to_alloy(*v)), *bits)
            }
            (ParamType::Bool, Self::Bool(b)) => DynSolValue::Bool(*b),
            (ParamType::String, Self::String(s)) => DynSolValue::String(s.clone()),
            (ParamType::Bytes, Self::Bytes(b)) => DynSolValue::Bytes(b.clone()),
            (ParamType::FixedBytes(size), Self::FixedBytes(b)) if b.len() <= *size => {
                DynSolValue::FixedBytes(B256::right_padding_from(b), *size)
            }
            (ParamType::Array(inner), Self::Array(items)) => DynSolValue::Array(
                items
                    .iter()
                    .map(|item| item.to_sol(inner))
                    .collect::<Result<_, _>>()?,
            ),
            _ => return Err(mismatch()),
        };
        Ok(value)
    }

    fn from_sol(value: DynSolValue) -> Self {
        match value {
            DynSolValue::Address(address) => Self::Address(format!("0x{address:x}")),
            DynSolValue::Uint(v, _) => Self::Uint(from_alloy(v)),
            DynSolValue::Int(v, _) => Self::Int(from_alloy(v.into_raw())),
            DynSolValue::Bool(b) => Self::Bool(b),
            DynSolValue::String(s) => Self::String(s),
            DynSolValue::Bytes(b) => Self::Bytes(b),
            DynSolValue::FixedBytes(word, size) => Self::FixedBytes(word[..size.min(WORD)].to_vec()),
            DynSolValue::Function(function) => Self::FixedBytes(function.to_vec()),
            DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
                Self::Array(items.into_iter().map(Self::from_sol).collect())
            }
        }
    }
}

fn to_alloy(value: U256) -> alloy_primitives::U256 {
    alloy_primitives::U256::from_limbs(value.0)
}

fn from_alloy(value: alloy_primitives::U256) -> U256 {
    U256(value.into_limbs())
}

fn decode_hex(value: &str) -> Result<Vec<u8>, AbiError> {
    let digits = shardex_common::strip_hex_prefix(value.trim());
    hex::decode(digits).map_err(|e| AbiError::InvalidHex(format!("{value}: {e}")))
}

/// A decoded event log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedLog {
    pub name: String,
    pub params: Vec<(String, AbiValue)>,
}

impl DecodedLog {
    pub fn get(&self, name: &str) -> Option<&AbiValue> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn address(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(AbiValue::as_address)
    }

    pub fn uint(&self, name: &str) -> Option<U256> {
        self.get(name).and_then(AbiValue::as_uint)
    }

    pub fn uint_array(&self, name: &str) -> Option<Vec<U256>> {
        self.get(name)?
            .as_array()?
            .iter()
            .map(AbiValue::as_uint)
            .collect()
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(AbiValue::as_bool)
    }
}

/// Picks an overload: the first one for a bare name, the exact match for a
/// full signature.
fn overload<'a, T>(
    overloads: Option<&'a Vec<T>>,
    key: &str,
    signature: impl Fn(&T) -> String,
) -> Option<&'a T> {
    let overloads = overloads?;
    if key.contains('(') {
        overloads.iter().find(|item| signature(item) == key)
    } else {
        overloads.first()
    }
}

fn base_name(key: &str) -> &str {
    key.split_once('(').map_or(key, |(name, _)| name)
}

/// Signature table for a set of ABI entries.
#[derive(Debug, Clone, Default)]
pub struct Abi {
    inner: JsonAbi,
}

impl Abi {
    pub fn new(entries: Vec<AbiEntry>) -> Self {
        let mut inner = JsonAbi::default();
        for entry in entries {
            match entry {
                AbiEntry::Function(f) => inner.functions.entry(f.name.clone()).or_default().push(f),
                AbiEntry::Event(e) => inner.events.entry(e.name.clone()).or_default().push(e),
            }
        }
        Self { inner }
    }

    /// Build from a standard JSON ABI. Constructors, errors and fallbacks are
    /// parsed but never looked up.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(Self {
            inner: serde_json::from_str(json)?,
        })
    }

    fn find_function(&self, key: &str) -> Option<&Function> {
        overload(self.inner.function(base_name(key)), key, Function::signature)
    }

    fn find_event(&self, key: &str) -> Option<&Event> {
        overload(self.inner.event(base_name(key)), key, Event::signature)
    }

    fn function(&self, key: &str) -> Result<&Function, AbiError> {
        self.find_function(key).ok_or_else(|| {
            if self.find_event(key).is_some() {
                AbiError::NotAFunction(key.to_string())
            } else {
                AbiError::UnknownEntry(key.to_string())
            }
        })
    }

    fn event(&self, key: &str) -> Result<&Event, AbiError> {
        self.find_event(key).ok_or_else(|| {
            if self.find_function(key).is_some() {
                AbiError::NotAnEvent(key.to_string())
            } else {
                AbiError::UnknownEntry(key.to_string())
            }
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.find_function(key).is_some() || self.find_event(key).is_some()
    }

    pub fn signature(&self, key: &str) -> Option<String> {
        self.find_function(key)
            .map(Function::signature)
            .or_else(|| self.find_event(key).map(Event::signature))
    }

    /// Selector or topic as bare lowercase hex.
    fn hash_hex(&self, key: &str) -> Option<String> {
        self.find_function(key)
            .map(|f| hex::encode(f.selector()))
            .or_else(|| self.find_event(key).map(|e| hex::encode(e.selector())))
    }

    /// `0x`-prefixed 4-byte function selector.
    pub fn selector(&self, key: &str) -> Result<String, AbiError> {
        Ok(format!("0x{}", hex::encode(self.function(key)?.selector())))
    }

    /// `0x`-prefixed 32-byte event topic.
    pub fn topic(&self, key: &str) -> Result<String, AbiError> {
        Ok(format!("0x{}", hex::encode(self.event(key)?.selector())))
    }

    /// Event whose topic equals `topic`.
    pub fn event_by_topic(&self, topic: &str) -> Option<&Event> {
        let wanted = shardex_common::strip_hex_prefix(topic).to_ascii_lowercase();
        self.inner
            .events()
            .find(|e| hex::encode(e.selector()) == wanted)
    }

    /// True when the selector/topic of every named entry occurs in `bytecode`.
    ///
    /// A fingerprint, not an ABI check: a contract can match without
    /// implementing the interface, and proxies never match.
    pub fn has_all_signatures(&self, keys: &[&str], bytecode: &str) -> bool {
        let bytecode = bytecode.to_ascii_lowercase();
        keys.iter().all(|key| {
            self.hash_hex(key)
                .is_some_and(|hash| bytecode.contains(&hash))
        })
    }

    /// Selector followed by the encoded arguments, as `0x` hex.
    pub fn encode_call(&self, key: &str, args: &[AbiValue]) -> Result<String, AbiError> {
        let function = self.function(key)?;
        if args.len() != function.inputs.len() {
            return Err(AbiError::ArgumentCount {
                expected: function.inputs.len(),
                got: args.len(),
            });
        }
        let values = function
            .inputs
            .iter()
            .zip(args)
            .map(|(param, arg)| arg.to_sol(&param.resolve().map_err(codec_error)?))
            .collect::<Result<Vec<_>, _>>()?;
        let data = function.abi_encode_input(&values).map_err(codec_error)?;
        Ok(format!("0x{}", hex::encode(data)))
    }

    /// Decode a function's return data.
    pub fn decode_output(&self, key: &str, data: &str) -> Result<Vec<AbiValue>, AbiError> {
        let function = self.function(key)?;
        let bytes = decode_hex(data)?;
        match function.abi_decode_output(&bytes, false) {
            Ok(values) => Ok(values.into_iter().map(AbiValue::from_sol).collect()),
            // Older tokens return `bytes32` where the interface says `string`.
            Err(_) if returns_string(function) && bytes.len() == WORD => {
                Ok(vec![AbiValue::FixedBytes(bytes)])
            }
            Err(e) => Err(codec_error(e)),
        }
    }

    /// Decode a log emitted by event `key`.
    pub fn decode_log(&self, key: &str, data: &str, topics: &[String]) -> Result<DecodedLog, AbiError> {
        let event = self.event(key)?;
        let mismatch = || AbiError::TopicMismatch(event.name.clone());

        let indexed = event.inputs.iter().filter(|p| p.indexed).count();
        if topics.len() != indexed + usize::from(!event.anonymous) {
            return Err(mismatch());
        }
        let topics = topics
            .iter()
            .map(|t| t.trim().parse::<B256>().map_err(|e| AbiError::InvalidHex(format!("{t}: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;
        if !event.anonymous && topics.first() != Some(&event.selector()) {
            return Err(mismatch());
        }

        let decoded = event
            .decode_log_parts(topics, &decode_hex(data)?, false)
            .map_err(codec_error)?;
        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        let params = event
            .inputs
            .iter()
            .map(|param| {
                let value = if param.indexed { indexed.next() } else { body.next() };
                value
                    .map(|v| (param.name.clone(), AbiValue::from_sol(v)))
                    .ok_or_else(mismatch)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(DecodedLog {
            name: event.name.clone(),
            params,
        })
    }
}

fn returns_string(function: &Function) -> bool {
    matches!(function.outputs.as_slice(), [output] if output.ty == "string")
}

/// Errors from an on-chain read call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Abi(#[from] AbiError),
    #[error("{0} returned no value")]
    Empty(String),
}

/// Read-only contract calls through the chain client.
#[derive(Clone)]
pub struct ContractCaller {
    abi: Arc<Abi>,
    client: ChainClient,
}

impl ContractCaller {
    pub fn new(abi: Arc<Abi>, client: ChainClient) -> Self {
        Self { abi, client }
    }

    pub fn abi(&self) -> &Arc<Abi> {
        &self.abi
    }

    pub fn client(&self) -> &ChainClient {
        &self.client
    }

    /// Call `name` on `address` and return its first return value.
    pub async fn call(&self, address: &str, name: &str, args: &[AbiValue]) -> Result<AbiValue, CallError> {
        let data = self.abi.encode_call(name, args)?;
        let output = self.client.call(address, &data).await?;
        self.abi
            .decode_output(name, &output)?
            .into_iter()
            .next()
            .ok_or_else(|| CallError::Empty(name.to_string()))
    }

    /// Call every argument-less function in `names`, concurrently.
    pub async fn call_all(&self, address: &str, names: &[&str]) -> Result<Vec<AbiValue>, CallError> {
        try_join_all(names.iter().map(|name| self.call(address, name, &[]))).await
    }
}
