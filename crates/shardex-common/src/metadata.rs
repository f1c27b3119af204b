//! Off-chain token metadata resolution.
//!
//! Token contracts point at their metadata through a URI returned by
//! `tokenURI`, `uri` or `contractURI`. Supported forms:
//! - `https://` / `http://` URLs, fetched with retries
//! - `ipfs://` URIs, rewritten onto the configured gateway
//! - `data:application/json;base64,` and URL-encoded `data:` URIs
//! - raw inline JSON as a fallback
//!
//! Fetched documents are sanitised (control characters, unescaped quotes)
//! before parsing, since a lot of deployed metadata is not valid JSON as served.

use std::time::Duration;

use primitive_types::U256;
use reqwest::StatusCode;
use serde_json::Value;

use crate::retry::RetryPolicy;

const LOG_TARGET: &str = "shardex_common::metadata";

/// Configuration for [`MetadataResolver`].
#[derive(Debug, Clone)]
pub struct MetadataResolverConfig {
    /// Gateway base used for `ipfs://` URIs, without trailing slash.
    pub ipfs_gateway: String,
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry policy for network errors. Non-success HTTP statuses are not retried.
    pub retry: RetryPolicy,
}

impl Default for MetadataResolverConfig {
    fn default() -> Self {
        Self {
            ipfs_gateway: "https://ipfs.io/ipfs".to_string(),
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("http status {0}")]
    Status(StatusCode),
}

/// Resolves metadata URIs to JSON documents.
#[derive(Debug, Clone)]
pub struct MetadataResolver {
    client: reqwest::Client,
    config: MetadataResolverConfig,
}

impl MetadataResolver {
    pub fn new(config: MetadataResolverConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &MetadataResolverConfig {
        &self.config
    }

    /// Rewrite an `ipfs://` URI onto the configured gateway. Other URIs are returned as-is.
    pub fn gateway_url(&self, uri: &str) -> String {
        match uri.strip_prefix("ipfs://") {
            Some(path) => {
                let path = path.strip_prefix("ipfs/").unwrap_or(path);
                format!("{}/{}", self.config.ipfs_gateway.trim_end_matches('/'), path)
            }
            None => uri.to_string(),
        }
    }

    /// Resolve a URI to a JSON document. Returns `None` when the URI cannot be
    /// resolved or does not contain JSON.
    pub async fn resolve(&self, uri: &str) -> Option<Value> {
        let uri = uri.trim();
        if uri.is_empty() {
            return None;
        }

        let raw = match uri {
            u if u.starts_with("http://") || u.starts_with("https://") => self.fetch(u).await,
            u if u.starts_with("ipfs://") => self.fetch(&self.gateway_url(u)).await,
            u if u.starts_with("data:") => resolve_data_uri(u),
            u => Some(u.to_string()),
        }?;

        let sanitized = sanitize_json_string(&raw);
        match serde_json::from_str::<Value>(&sanitized) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    uri = %uri,
                    error = %e,
                    "Metadata is not valid JSON after sanitization"
                );
                None
            }
        }
    }

    /// Resolve an ERC1155-style templated URI for a specific token id.
    pub async fn resolve_for_token(&self, uri: &str, token_id: U256) -> Option<Value> {
        self.resolve(&substitute_token_id(uri, token_id)).await
    }

    async fn fetch(&self, url: &str) -> Option<String> {
        let result = self
            .config
            .retry
            .execute_when(
                || {
                    let client = &self.client;
                    async move {
                        let resp = client.get(url).send().await?;
                        let status = resp.status();
                        if !status.is_success() {
                            return Err(FetchError::Status(status));
                        }
                        Ok(resp.text().await?)
                    }
                },
                |err| matches!(err, FetchError::Network(_)),
            )
            .await;

        match result {
            Ok(body) => Some(body),
            Err(e) => {
                tracing::debug!(
                    target: LOG_TARGET,
                    url = %url,
                    error = %e,
                    "Metadata fetch failed"
                );
                None
            }
        }
    }
}

/// Replace the `{id}` placeholder with the 64-char lowercase hex token id.
pub fn substitute_token_id(uri: &str, token_id: U256) -> String {
    if uri.contains("{id}") {
        uri.replace("{id}", &format!("{token_id:064x}"))
    } else {
        uri.to_string()
    }
}

/// Read a string field from a metadata document.
pub fn json_string_field(doc: &Value, field: &str) -> Option<String> {
    match doc.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn resolve_data_uri(uri: &str) -> Option<String> {
    let uri = uri.replace('#', "%23");
    let rest = uri.strip_prefix("data:")?;
    let Some((header, body)) = rest.split_once(',') else {
        tracing::debug!(target: LOG_TARGET, "Malformed data URI");
        return None;
    };

    if header.contains("base64") {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD.decode(body).ok()?;
        return String::from_utf8(bytes).ok();
    }

    Some(
        urlencoding::decode(body)
            .map_or_else(|_| body.to_string(), std::borrow::Cow::into_owned),
    )
}

/// Escape unescaped double quotes inside string values and drop control
/// characters other than standard whitespace.
pub fn sanitize_json_string(s: &str) -> String {
    let filtered: String = s
        .chars()
        .filter(|c| !c.is_ascii_control() || matches!(c, '\n' | '\r' | '\t'))
        .collect();

    let mut result = String::with_capacity(filtered.len());
    let mut chars = filtered.chars().peekable();
    let mut in_string = false;
    let mut backslashes: usize = 0;

    while let Some(c) = chars.next() {
        if !in_string {
            if c == '"' {
                in_string = true;
                backslashes = 0;
            }
            result.push(c);
            continue;
        }

        match c {
            '\\' => {
                backslashes += 1;
                result.push('\\');
                continue;
            }
            '"' if backslashes % 2 == 0 => {
                let mut lookahead = chars.clone();
                while lookahead.peek().is_some_and(|n| n.is_whitespace()) {
                    lookahead.next();
                }
                match lookahead.peek() {
                    Some(':' | ',' | '}' | ']') | None => {
                        result.push('"');
                        in_string = false;
                    }
                    Some(_) => result.push_str("\\\""),
                }
            }
            _ => result.push(c),
        }
        backslashes = 0;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn resolver_for(gateway: &str) -> MetadataResolver {
        MetadataResolver::new(MetadataResolverConfig {
            ipfs_gateway: gateway.to_string(),
            timeout: Duration::from_secs(2),
            retry: RetryPolicy::immediate(2),
        })
        .unwrap()
    }

    #[test]
    fn test_sanitize_unescaped_quotes() {
        let input = r#"{"name":""Rage Shout" DireWolf"}"#;
        let expected = r#"{"name":"\"Rage Shout\" DireWolf"}"#;
        assert_eq!(sanitize_json_string(input), expected);
    }

    #[test]
    fn test_sanitize_keeps_escaped_quotes() {
        let input = r#"{"name":"\"Escaped\" Wolf"}"#;
        assert_eq!(sanitize_json_string(input), input);
    }

    #[test]
    fn test_sanitize_drops_control_chars() {
        let sanitized = sanitize_json_string("{\x01\"name\": \"test\x02\"}");
        assert!(!sanitized.contains('\x01'));
        assert!(!sanitized.contains('\x02'));
    }

    #[test]
    fn test_data_uri_base64_and_urlencoded() {
        assert_eq!(
            resolve_data_uri("data:application/json;base64,eyJuYW1lIjoidGVzdCJ9").as_deref(),
            Some(r#"{"name":"test"}"#)
        );
        assert_eq!(
            resolve_data_uri("data:application/json,%7B%22name%22%3A%22test%22%7D").as_deref(),
            Some(r#"{"name":"test"}"#)
        );
        assert!(resolve_data_uri("data:application/json").is_none());
    }

    #[test]
    fn test_substitute_token_id() {
        let uri = substitute_token_id("https://example.com/{id}.json", U256::from(42u64));
        assert_eq!(
            uri,
            "https://example.com/000000000000000000000000000000000000000000000000000000000000002a.json"
        );
        assert_eq!(substitute_token_id("ipfs://Qm/1", U256::one()), "ipfs://Qm/1");
    }

    #[test]
    fn test_gateway_url() {
        let resolver = resolver_for("https://gw.example/ipfs/");
        assert_eq!(resolver.gateway_url("ipfs://QmHash/1.json"), "https://gw.example/ipfs/QmHash/1.json");
        assert_eq!(resolver.gateway_url("ipfs://ipfs/QmHash"), "https://gw.example/ipfs/QmHash");
        assert_eq!(resolver.gateway_url("https://a.b/c"), "https://a.b/c");
    }

    #[tokio::test]
    async fn test_resolve_inline_json() {
        let resolver = resolver_for("https://ipfs.io/ipfs");
        let doc = resolver.resolve(r#"{"name":"Inline","symbol":"INL"}"#).await.unwrap();
        assert_eq!(json_string_field(&doc, "symbol").as_deref(), Some("INL"));
        assert!(resolver.resolve("not json").await.is_none());
        assert!(resolver.resolve("").await.is_none());
    }

    #[tokio::test]
    async fn test_resolve_ipfs_through_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ipfs/QmContract"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"name":"Collection"}"#))
            .mount(&server)
            .await;

        let resolver = resolver_for(&format!("{}/ipfs", server.uri()));
        let doc = resolver.resolve("ipfs://QmContract").await.unwrap();
        assert_eq!(json_string_field(&doc, "name").as_deref(), Some("Collection"));
    }

    #[tokio::test]
    async fn test_error_status_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.json"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let resolver = resolver_for("https://ipfs.io/ipfs");
        let result = resolver.resolve(&format!("{}/missing.json", server.uri())).await;
        assert!(result.is_none());
    }
}
