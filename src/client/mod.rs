//! Authenticated JSON transport for the platform API.
//!
//! One `ApiClient` wraps one instance (source or destination): it owns a
//! pooled `reqwest` client with the `X-API-Key` header installed, paces
//! outbound requests, classifies HTTP failures into `MigrateError` variants,
//! and retries the recoverable ones per `RetryPolicy`. Batch POSTs split
//! recursively on failure so one bad record cannot sink its whole batch.
//!
//! The client is immutable after construction and safe to share across
//! workers; the connection pool synchronizes internally.

pub mod pagination;
pub mod retry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::config::{ConnectionConfig, MigrationConfig};
use crate::errors::MigrateError;
pub use pagination::Paginator;
pub use retry::RetryPolicy;

/// PATCH gets a short fixed timeout: the server treats idempotent overwrites
/// as expensive, and a slow PATCH means it is overloaded.
pub const PATCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Request counters, shared across workers.
#[derive(Debug, Default)]
struct ClientStats {
    requests: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time view of the client's request counters.
#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub errors: u64,
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.requests - self.errors) as f64 / self.requests as f64
        }
    }
}

/// Result of a batch POST: one slot per input item, in input order, carrying
/// either the response body or a non-empty error string.
#[derive(Debug, Default)]
pub struct BatchResult {
    slots: Vec<Result<Value, String>>,
}

impl BatchResult {
    pub fn slots(&self) -> &[Result<Value, String>] {
        &self.slots
    }

    pub fn into_slots(self) -> Vec<Result<Value, String>> {
        self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn success_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_ok()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_err()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count() == 0
    }
}

pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
    policy: RetryPolicy,
    rate_limit_delay: Duration,
    stats: ClientStats,
}

impl ApiClient {
    pub fn new(
        conn: &ConnectionConfig,
        migration: &MigrationConfig,
    ) -> Result<Self, MigrateError> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(&conn.api_key)
            .map_err(|_| MigrateError::validation("API key contains invalid header bytes"))?;
        headers.insert("X-API-Key", key);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(conn.timeout_seconds))
            .danger_accept_invalid_certs(!conn.verify_tls)
            .build()
            .map_err(|e| MigrateError::Network(e.to_string()))?;

        Ok(Self {
            base_url: conn.api_base(),
            http,
            policy: RetryPolicy::with_attempts(conn.max_retries.max(1)),
            rate_limit_delay: Duration::from_secs_f64(migration.rate_limit_delay.max(0.0)),
            stats: ClientStats::default(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.stats.requests.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    pub async fn get(&self, path: &str, query: &[(&str, String)]) -> Result<Value, MigrateError> {
        self.execute(Method::GET, path, Some(query), None, &self.policy, None)
            .await
    }

    pub async fn post(&self, path: &str, body: &Value) -> Result<Value, MigrateError> {
        self.execute(Method::POST, path, None, Some(body), &self.policy, None)
            .await
    }

    pub async fn patch(&self, path: &str, body: &Value) -> Result<Value, MigrateError> {
        // A PATCH that fails once is likely to keep failing; one attempt.
        let policy = RetryPolicy::with_attempts(1);
        self.execute(
            Method::PATCH,
            path,
            None,
            Some(body),
            &policy,
            Some(PATCH_TIMEOUT),
        )
        .await
    }

    /// Lazy offset pagination over a listing endpoint.
    pub fn paginate(
        &self,
        path: &str,
        query: Vec<(String, String)>,
        page_size: usize,
    ) -> Paginator<'_> {
        Paginator::new(self, path, query, page_size)
    }

    /// POST `items` in batches of `batch_size`, isolating failures by binary
    /// splitting so success is per-item granular.
    ///
    /// Auth and network failures abort the whole call; anything else is
    /// narrowed down to the offending records and reported in the result.
    pub async fn post_batch(
        &self,
        path: &str,
        items: Vec<Value>,
        batch_size: usize,
    ) -> Result<BatchResult, MigrateError> {
        let mut result = BatchResult::default();
        let chunk = batch_size.max(1);
        for batch in items.chunks(chunk) {
            tracing::debug!("posting batch of {} item(s) to {}", batch.len(), path);
            self.post_batch_split(path, batch, &mut result.slots).await?;
        }
        if result.failure_count() > 0 {
            tracing::warn!(
                "batch to {} completed with {} failure(s) out of {} item(s)",
                path,
                result.failure_count(),
                result.len()
            );
        }
        Ok(result)
    }

    fn post_batch_split<'a>(
        &'a self,
        path: &'a str,
        items: &'a [Value],
        out: &'a mut Vec<Result<Value, String>>,
    ) -> BoxFuture<'a, Result<(), MigrateError>> {
        Box::pin(async move {
            if items.is_empty() {
                return Ok(());
            }

            match self.post(path, &Value::Array(items.to_vec())).await {
                Ok(response) => {
                    let responses: Vec<Value> = match response {
                        Value::Array(list) => list,
                        single @ Value::Object(_) => vec![single; items.len()],
                        _ => vec![json!({}); items.len()],
                    };
                    for i in 0..items.len() {
                        match responses.get(i) {
                            Some(Value::Null) | None => {
                                out.push(Err("empty response from API".to_string()));
                            }
                            Some(v) => out.push(Ok(v.clone())),
                        }
                    }
                    Ok(())
                }
                Err(err) if err.is_fatal() || matches!(err, MigrateError::Network(_)) => Err(err),
                Err(err) => {
                    if items.len() == 1 {
                        tracing::debug!("batch item isolated as failure: {}", err);
                        out.push(Err(err.to_string()));
                        Ok(())
                    } else {
                        let mid = items.len() / 2;
                        tracing::debug!(
                            "batch of {} failed, splitting {}+{} to isolate the offender",
                            items.len(),
                            mid,
                            items.len() - mid
                        );
                        self.post_batch_split(path, &items[..mid], out).await?;
                        self.post_batch_split(path, &items[mid..], out).await
                    }
                }
            }
        })
    }

    /// Probe the instance with a static ordered endpoint list and report the
    /// first success or the most useful diagnostic.
    pub async fn test_connection(&self) -> Result<(), String> {
        let mut last_error: Option<String> = None;

        for endpoint in ["/datasets", "/health", "/"] {
            let query: Vec<(&str, String)> = if endpoint.contains("datasets") {
                vec![("limit", "1".to_string())]
            } else {
                Vec::new()
            };

            match self.get(endpoint, &query).await {
                Ok(_) => return Ok(()),
                Err(err @ MigrateError::Authentication { .. })
                | Err(err @ MigrateError::Authorization { .. }) => {
                    return Err(format!(
                        "{err}. Verify the API key is correct and not expired."
                    ));
                }
                Err(MigrateError::NotFound { .. }) => continue,
                Err(err @ MigrateError::Network(_)) => {
                    return Err(format!("connection failed: {err}"));
                }
                Err(err) => {
                    last_error = Some(err.to_string());
                    continue;
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            "all probe endpoints returned errors or were not found".to_string()
        }))
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        query: Option<&[(&str, String)]>,
        body: Option<&Value>,
        policy: &RetryPolicy,
        timeout: Option<Duration>,
    ) -> Result<Value, MigrateError> {
        let mut attempt: u32 = 0;
        loop {
            if !self.rate_limit_delay.is_zero() {
                tokio::time::sleep(self.rate_limit_delay).await;
            }

            let url = self.url_for(path);
            tracing::debug!("{} {}", method, url);

            let mut request = self.http.request(method.clone(), url.as_str());
            if let Some(query) = query {
                request = request.query(query);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            self.stats.requests.fetch_add(1, Ordering::Relaxed);

            let outcome = match request.send().await {
                Ok(response) => self.decode_response(response, path).await,
                Err(err) => Err(MigrateError::Network(err.to_string())),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) => match policy.delay_for(&err, attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            "{} {} failed ({}), retrying in {:.1}s",
                            method,
                            path,
                            err,
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    async fn decode_response(
        &self,
        response: reqwest::Response,
        endpoint: &str,
    ) -> Result<Value, MigrateError> {
        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let text = response.text().await.unwrap_or_default();

        match status.as_u16() {
            200..=299 => {
                if text.is_empty() {
                    return Ok(json!({}));
                }
                serde_json::from_str(&text).map_err(|e| {
                    MigrateError::protocol(endpoint, format!("invalid JSON body: {e}"))
                })
            }
            401 => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(MigrateError::Authentication {
                    endpoint: endpoint.to_string(),
                    detail: error_detail(&text),
                })
            }
            403 => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(MigrateError::Authorization {
                    endpoint: endpoint.to_string(),
                    detail: error_detail(&text),
                })
            }
            404 => Err(MigrateError::not_found(endpoint, error_detail(&text))),
            409 => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(MigrateError::conflict(endpoint, error_detail(&text)))
            }
            429 => Err(MigrateError::RateLimited {
                endpoint: endpoint.to_string(),
                retry_after,
            }),
            code => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                Err(MigrateError::Server {
                    endpoint: endpoint.to_string(),
                    status: code,
                    detail: error_detail(&text),
                })
            }
        }
    }
}

/// Pull a human-readable detail out of an error body.
///
/// The platform usually returns `{"detail": "..."}`; some proxies return
/// `{"message": "..."}` or plain text.
fn error_detail(text: &str) -> String {
    if text.is_empty() {
        return "no response body".to_string();
    }
    if let Ok(body) = serde_json::from_str::<Value>(text) {
        for key in ["detail", "message"] {
            match body.get(key) {
                Some(Value::String(s)) => return s.clone(),
                Some(other) if !other.is_null() => return other.to_string(),
                _ => {}
            }
        }
        return body.to_string();
    }
    text.chars().take(500).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_detail_shapes() {
        assert_eq!(error_detail(r#"{"detail": "bad key"}"#), "bad key");
        assert_eq!(error_detail(r#"{"message": "nope"}"#), "nope");
        assert_eq!(error_detail(""), "no response body");
        assert_eq!(error_detail("plain text error"), "plain text error");
    }

    #[test]
    fn test_stats_success_rate() {
        let snapshot = StatsSnapshot {
            requests: 10,
            errors: 2,
        };
        assert!((snapshot.success_rate() - 0.8).abs() < f64::EPSILON);

        let empty = StatsSnapshot {
            requests: 0,
            errors: 0,
        };
        assert_eq!(empty.success_rate(), 0.0);
    }

    #[test]
    fn test_url_joining() {
        let conn = ConnectionConfig {
            api_key: "k".into(),
            base_url: "https://host.example.com".into(),
            ..ConnectionConfig::default()
        };
        let client = ApiClient::new(&conn, &MigrationConfig::default()).expect("client");
        assert_eq!(
            client.url_for("/datasets"),
            "https://host.example.com/api/v1/datasets"
        );
        // Presigned URLs pass through untouched.
        assert_eq!(
            client.url_for("https://blobs.example.com/x?sig=1"),
            "https://blobs.example.com/x?sig=1"
        );
    }
}
