//! In-memory JSON-RPC transport answering from scripted handlers.
//!
//! Enabled for this crate's tests and, through the `test-utils` feature, for
//! downstream crates' tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::rpc::{EndpointPool, RpcError, Transport};
use crate::types::ShardId;

pub type Handler = Arc<dyn Fn(&Value) -> Result<Value, RpcError> + Send + Sync>;

/// Recorded `(method, params)` pairs.
pub type CallLog = Arc<Mutex<Vec<(String, Value)>>>;

pub struct ScriptedTransport {
    pool: Arc<EndpointPool>,
    handlers: Mutex<HashMap<String, Handler>>,
    /// `eth_call` answers keyed by `(to, data)`; `data` may be just the selector.
    calls_by_target: Mutex<HashMap<(String, String), Value>>,
    call_log: CallLog,
}

impl ScriptedTransport {
    pub fn new(shard: ShardId) -> Self {
        Self::with_pool(Arc::new(EndpointPool::new(
            shard,
            [format!("scripted://shard-{shard}")],
        )))
    }

    pub fn with_pool(pool: Arc<EndpointPool>) -> Self {
        Self {
            pool,
            handlers: Mutex::new(HashMap::new()),
            calls_by_target: Mutex::new(HashMap::new()),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_handler<F>(self, method: &str, handler: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.set_handler(method, handler);
        self
    }

    pub fn with_result(self, method: &str, result: Value) -> Self {
        self.set_result(method, result);
        self
    }

    /// Answer `eth_call` to `to` whose data equals or starts with `data`.
    pub fn with_call(self, to: &str, data: &str, output: &str) -> Self {
        self.set_call(to, data, output);
        self
    }

    pub fn set_handler<F>(&self, method: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.handlers
            .lock()
            .unwrap()
            .insert(method.to_string(), Arc::new(handler));
    }

    pub fn set_result(&self, method: &str, result: Value) {
        self.set_handler(method, move |_| Ok(result.clone()));
    }

    pub fn set_call(&self, to: &str, data: &str, output: &str) {
        self.calls_by_target.lock().unwrap().insert(
            (to.to_ascii_lowercase(), data.to_ascii_lowercase()),
            json!(output),
        );
    }

    pub fn calls(&self) -> CallLog {
        self.call_log.clone()
    }

    /// Number of recorded calls to `method`.
    pub fn count(&self, method: &str) -> usize {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    fn dispatch(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        if method == "eth_call" {
            let to = params[0]["to"].as_str().unwrap_or_default().to_ascii_lowercase();
            let data = params[0]["data"].as_str().unwrap_or_default().to_ascii_lowercase();
            let targets = self.calls_by_target.lock().unwrap();
            if let Some(output) = targets.get(&(to.clone(), data.clone())) {
                return Ok(output.clone());
            }
            let selector: String = data.chars().take(10).collect();
            if let Some(output) = targets.get(&(to, selector)) {
                return Ok(output.clone());
            }
        }

        let handler = self.handlers.lock().unwrap().get(method).cloned();
        match handler {
            Some(handler) => handler(params),
            None if method == "eth_call" => Err(RpcError::Protocol {
                code: 3,
                message: "execution reverted".to_string(),
            }),
            None => Err(RpcError::Protocol {
                code: -32601,
                message: format!("method {method} not scripted"),
            }),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        self.call_log
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        let endpoint = self.pool.select()?;
        let result = self.dispatch(method, &params);
        let failed = result.as_ref().is_err_and(RpcError::is_retryable);
        self.pool
            .submit_statistic(&endpoint, Duration::from_millis(1), failed);
        result
    }

    fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }
}

/// Left-pad a hex quantity to a 32-byte word, without `0x`.
pub fn word(hex_value: &str) -> String {
    format!("{:0>64}", shardex_common::strip_hex_prefix(hex_value))
}

/// ABI-encode a single `uint256` return value.
pub fn uint_output(value: u64) -> String {
    format!("0x{value:064x}")
}

/// ABI-encode a single dynamic `string` return value.
pub fn string_output(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut padded = hex::encode(bytes);
    let rem = padded.len() % 64;
    if rem != 0 || padded.is_empty() {
        padded.push_str(&"0".repeat(64 - rem));
    }
    format!("0x{:064x}{:064x}{}", 32, bytes.len(), padded)
}

/// Topic form of an address.
pub fn address_topic(address: &str) -> String {
    format!("0x{}", word(address))
}
