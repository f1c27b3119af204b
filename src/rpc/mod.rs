//! JSON-RPC access to shard nodes.
//!
//! - [`pool`]: per-shard endpoint statistics and selection
//! - [`http`] / [`ws`]: transports that retry transport failures on a re-selected endpoint
//! - [`client`]: typed chain procedures with field normalisation

pub mod client;
pub mod http;
pub mod pool;
pub mod types;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use client::{ChainClient, ChainClientConfig, LogFilter};
pub use http::{HttpTransport, HttpTransportConfig};
pub use pool::{Endpoint, EndpointPool, EndpointStats};
pub use ws::{WsTransport, WsTransportConfig};

use crate::types::ShardId;

/// Errors raised at the RPC boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// Timeout, connection failure, bad HTTP status or closed socket.
    #[error("transport error ({url}): {message}")]
    Transport { url: String, message: String },

    /// Error envelope returned by the node.
    #[error("rpc error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// The node answered but the payload did not have the expected shape.
    #[error("failed to decode {context}: {message}")]
    Decode { context: String, message: String },

    #[error("no endpoints configured for shard {0}")]
    NoEndpoints(ShardId),
}

impl RpcError {
    pub fn transport(url: impl Into<String>, message: impl ToString) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn decode(context: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            context: context.into(),
            message: message.to_string(),
        }
    }

    /// Only transport failures are worth another endpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// A JSON-RPC transport bound to one shard's endpoint pool.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    fn pool(&self) -> &Arc<EndpointPool>;
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: &'a Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    /// Split the envelope into the result or a protocol error.
    pub fn into_result(self) -> Result<Value, RpcError> {
        if let Some(err) = self.error {
            return Err(RpcError::Protocol {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}
