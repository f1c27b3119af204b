//! WebSocket JSON-RPC transport.
//!
//! One client per endpoint, created on first use. A client that closed is not
//! reconnected in the background; the next call through that endpoint opens a
//! new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use shardex_common::RetryPolicy;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use super::{Endpoint, EndpointPool, JsonRpcRequest, JsonRpcResponse, RpcError, Transport};

const LOG_TARGET: &str = "shardex::rpc::ws";

#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    /// Each call is raced against this timeout.
    pub timeout: Duration,
    pub attempts: u32,
}

impl Default for WsTransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(40),
            attempts: 3,
        }
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, RpcError>>>>>;

struct WsClient {
    url: String,
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
}

impl WsClient {
    async fn connect(url: &str) -> Result<Self, RpcError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| RpcError::transport(url, e))?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader_url = url.to_string();
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let response: JsonRpcResponse = match serde_json::from_str(&text) {
                    Ok(response) => response,
                    Err(e) => {
                        tracing::debug!(
                            target: LOG_TARGET,
                            url = %reader_url,
                            error = %e,
                            "Ignoring unparseable frame"
                        );
                        continue;
                    }
                };
                let Some(id) = response.id else { continue };
                let waiter = lock(&reader_pending).remove(&id);
                if let Some(waiter) = waiter {
                    let _ = waiter.send(response.into_result());
                }
            }

            reader_closed.store(true, Ordering::SeqCst);
            let waiters: Vec<_> = lock(&reader_pending).drain().collect();
            for (_, waiter) in waiters {
                let _ = waiter.send(Err(RpcError::transport(&reader_url, "socket closed")));
            }
            tracing::debug!(target: LOG_TARGET, url = %reader_url, "WebSocket client closed");
        });

        tracing::debug!(target: LOG_TARGET, url = %url, "WebSocket client connected");

        Ok(Self {
            url: url.to_string(),
            outgoing,
            pending,
            closed,
        })
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn call(&self, id: u64, method: &str, params: &Value) -> Result<Value, RpcError> {
        let payload = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| RpcError::decode("request", e))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if self.outgoing.send(Message::Text(payload)).is_err() {
            lock(&self.pending).remove(&id);
            return Err(RpcError::transport(&self.url, "socket closed"));
        }

        rx.await
            .unwrap_or_else(|_| Err(RpcError::transport(&self.url, "socket closed")))
    }

    fn forget(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct WsTransport {
    pool: Arc<EndpointPool>,
    config: WsTransportConfig,
    retry: RetryPolicy,
    clients: tokio::sync::Mutex<HashMap<usize, Arc<WsClient>>>,
    next_id: AtomicU64,
}

impl WsTransport {
    pub fn new(pool: Arc<EndpointPool>, config: WsTransportConfig) -> Self {
        let retry = RetryPolicy::immediate(config.attempts);
        Self {
            pool,
            config,
            retry,
            clients: tokio::sync::Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn client_for(&self, endpoint: &Endpoint) -> Result<Arc<WsClient>, RpcError> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&endpoint.index) {
            if !client.is_closed() {
                return Ok(client.clone());
            }
        }
        let client = Arc::new(WsClient::connect(&endpoint.url).await?);
        clients.insert(endpoint.index, client.clone());
        Ok(client)
    }

    async fn attempt(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        let endpoint = self.pool.select()?;
        let started = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let call = async {
            let client = self.client_for(&endpoint).await?;
            match tokio::time::timeout(self.config.timeout, client.call(id, method, params)).await {
                Ok(result) => result,
                Err(_) => {
                    client.forget(id);
                    Err(RpcError::transport(&endpoint.url, "request timed out"))
                }
            }
        };
        let result = call.await;

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
}

#[async_trait]
impl Transport for WsTransport {
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
