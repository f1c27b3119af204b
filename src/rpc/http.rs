//! HTTP JSON-RPC transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use shardex_common::RetryPolicy;

use super::{Endpoint, EndpointPool, JsonRpcRequest, JsonRpcResponse, RpcError, Transport};

const LOG_TARGET: &str = "shardex::rpc::http";

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub timeout: Duration,
    /// Total attempts per request, each on a freshly selected endpoint.
    pub attempts: u32,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            attempts: 5,
        }
    }
}

pub struct HttpTransport {
    pool: Arc<EndpointPool>,
    client: reqwest::Client,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(pool: Arc<EndpointPool>, config: HttpTransportConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            pool,
            client,
            retry: RetryPolicy::immediate(config.attempts),
            next_id: AtomicU64::new(1),
        })
    }

    async fn attempt(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let endpoint = self.pool.select()?;
        let started = Instant::now();
        let result = self.post(&endpoint, method, params).await;
        let failed = result.as_ref().is_err_and(RpcError::is_retryable);
        self.pool.submit_statistic(&endpoint, started.elapsed(), failed);

        if let Err(e) = &result {
            if failed {
                tracing::warn!(
                    target: LOG_TARGET,
                    shard = self.pool.shard(),
                    url = %endpoint.url,
                    method,
                    error = %e,
                    "RPC attempt failed"
                );
            }
        }
        result
    }

    async fn post(&self, endpoint: &Endpoint, method: &str, params: &Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(&endpoint.url)
            .json(&JsonRpcRequest::new(id, method, params))
            .send()
            .await
            .map_err(|e| RpcError::transport(&endpoint.url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RpcError::transport(
                &endpoint.url,
                format!("HTTP status {status}"),
            ));
        }

        let envelope: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| RpcError::transport(&endpoint.url, format!("invalid response body: {e}")))?;
        envelope.into_result()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let params = &params;
        let this = self;
        self.retry
            .execute_when(move || this.attempt(method, params), RpcError::is_retryable)
            .await
    }

    fn pool(&self) -> &Arc<EndpointPool> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn transport(urls: Vec<String>) -> HttpTransport {
        let pool = Arc::new(EndpointPool::new(0, urls));
        HttpTransport::new(pool, HttpTransportConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_successful_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"method": "hmyv2_blockNumber"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": 1234
            })))
            .mount(&server)
            .await;

        let transport = transport(vec![server.uri()]);
        let result = transport
            .request("hmyv2_blockNumber", json!([]))
            .await
            .unwrap();
        assert_eq!(result, json!(1234));
        assert_eq!(transport.pool().total_failed(), 0);
    }

    #[tokio::test]
    async fn test_protocol_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": -32602, "message": "invalid params"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = transport(vec![server.uri()]);
        let err = transport.request("eth_call", json!([])).await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol { code: -32602, .. }));
        assert_eq!(transport.pool().total_failed(), 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .expect(5)
            .mount(&server)
            .await;

        let transport = transport(vec![server.uri()]);
        let err = transport
            .request("hmyv2_blockNumber", json!([]))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.pool().total_failed(), 5);
    }

    #[tokio::test]
    async fn test_fails_over_to_second_endpoint() {
        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&failing)
            .await;

        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0", "id": 1, "result": "0x10"
            })))
            .expect(1)
            .mount(&healthy)
            .await;

        let transport = transport(vec![failing.uri(), healthy.uri()]);
        // Endpoint 2 starts slower, so endpoint 1 keeps winning until its
        // failure penalty outweighs the latency gap: 28 - 10*3 < 0.
        transport.pool().set_response_time(1, 28);

        let result = transport.request("eth_chainId", json!([])).await.unwrap();
        assert_eq!(result, json!("0x10"));

        let stats = transport.pool().snapshot();
        assert_eq!(stats[0].failed_requests, 3);
        assert_eq!(stats[1].failed_requests, 0);
        assert_eq!(stats[0].in_flight, 0);
        assert_eq!(stats[1].in_flight, 0);
    }
}
