//! Signed REST client for the OKX V5 API.
//!
//! Owns request signing, per-category rate limiting, retry with exponential
//! backoff, and credential-invalid classification. Exchange application
//! errors (non-zero `code`) are returned in the envelope, not raised: the
//! caller knows what a given code means for its operation.

use crate::error::{ApiError, RestResult};
use crate::rate_limiter::RateLimiter;
use crate::sign::{canonical_json, signing_timestamp, sorted_query, Credentials};
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Production REST endpoint.
pub const LIVE_REST_URL: &str = "https://www.okx.com";

/// Fixed per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default retry attempts per request.
pub const DEFAULT_RETRIES: u32 = 3;

/// Error codes that mean the credentials themselves are bad. These are
/// never retried and poison the client until credentials are reapplied.
const CREDENTIAL_ERROR_CODES: [&str; 3] = ["50110", "50111", "50113"];

/// HTTP method subset the exchange API uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

/// Decoded response envelope. `code == "0"` is success; any other code is
/// an application-level error the caller interprets.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub msg: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ApiEnvelope {
    pub fn is_ok(&self) -> bool {
        self.code == "0"
    }

    /// The `data` field as an array slice (empty when absent or not a list).
    pub fn data_array(&self) -> &[serde_json::Value] {
        self.data.as_array().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Signed, rate-limited OKX REST client.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    credentials: RwLock<Credentials>,
    server_offset_ms: AtomicI64,
    credentials_invalid: AtomicBool,
    rate_limiter: RateLimiter,
}

impl RestClient {
    /// Create a client against the production endpoint.
    pub fn new(credentials: Credentials) -> RestResult<Self> {
        Self::with_base_url(LIVE_REST_URL, credentials)
    }

    pub fn with_base_url(base_url: impl Into<String>, credentials: Credentials) -> RestResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(format!("HTTP client build failed: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            credentials: RwLock::new(credentials),
            server_offset_ms: AtomicI64::new(0),
            credentials_invalid: AtomicBool::new(false),
            rate_limiter: RateLimiter::new(),
        })
    }

    /// Replace the active credentials and clear the invalid flag.
    pub fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write() = credentials;
        self.credentials_invalid.store(false, Ordering::SeqCst);
    }

    /// Whether the current credentials have been rejected by the exchange.
    pub fn credentials_invalid(&self) -> bool {
        self.credentials_invalid.load(Ordering::SeqCst)
    }

    /// Whether the active profile has all three credential fields set.
    pub fn has_credentials(&self) -> bool {
        self.credentials.read().is_complete()
    }

    /// Current server-time offset in milliseconds.
    pub fn server_offset_ms(&self) -> i64 {
        self.server_offset_ms.load(Ordering::SeqCst)
    }

    /// Fetch `/public/time` and track the offset applied to every signed
    /// timestamp from here on.
    pub async fn sync_server_time(&self) -> RestResult<i64> {
        let envelope = self
            .request(Method::Get, "/api/v5/public/time", &[], None, 1)
            .await?;
        let server_ms: i64 = envelope
            .data_array()
            .first()
            .and_then(|row| row.get("ts"))
            .and_then(|ts| ts.as_str())
            .and_then(|ts| ts.parse().ok())
            .ok_or_else(|| ApiError::Decode("missing ts in /public/time".to_string()))?;

        let local_ms = Utc::now().timestamp_millis();
        let offset = server_ms - local_ms;
        self.server_offset_ms.store(offset, Ordering::SeqCst);
        debug!(offset_ms = offset, "server time synchronized");
        Ok(offset)
    }

    /// Issue a signed request with the default retry count.
    pub async fn request_default(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<serde_json::Value>,
    ) -> RestResult<ApiEnvelope> {
        self.request(method, path, query, body, DEFAULT_RETRIES).await
    }

    /// Issue a signed request.
    ///
    /// Retries on timeout, transport failure, non-200 status and undecodable
    /// bodies, with `2^attempt` second backoff. Credential-error codes set
    /// the poisoned flag and are returned without retry; once poisoned, all
    /// further requests fail fast with `ApiError::CredentialInvalid`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<serde_json::Value>,
        max_retries: u32,
    ) -> RestResult<ApiEnvelope> {
        if self.credentials_invalid() {
            return Err(ApiError::CredentialInvalid);
        }

        let body_str = body.as_ref().map(|b| canonical_json(b)).unwrap_or_default();
        let query_str = sorted_query(query);
        let path_with_query = format!("{path}{query_str}");
        let url = format!("{}{path_with_query}", self.base_url);

        let timestamp = signing_timestamp(Utc::now(), self.server_offset_ms());
        let (signature, api_key, passphrase, simulated) = {
            let creds = self.credentials.read();
            let sig = creds.sign_request(&timestamp, method.as_str(), &path_with_query, &body_str)?;
            (
                sig,
                creds.api_key.clone(),
                creds.passphrase.clone(),
                creds.simulated,
            )
        };

        let mut last_error = ApiError::Transport("no attempt made".to_string());

        for attempt in 0..max_retries.max(1) {
            if self.credentials_invalid() {
                return Err(ApiError::CredentialInvalid);
            }

            self.rate_limiter.acquire(path, 1).await;

            debug!(
                method = method.as_str(),
                path,
                attempt = attempt + 1,
                max_retries,
                "REST request"
            );

            let mut builder = match method {
                Method::Get => self.http.get(&url),
                Method::Post => self.http.post(&url),
            };
            builder = builder
                .header("OK-ACCESS-KEY", &api_key)
                .header("OK-ACCESS-SIGN", &signature)
                .header("OK-ACCESS-TIMESTAMP", &timestamp)
                .header("OK-ACCESS-PASSPHRASE", &passphrase)
                .header("Content-Type", "application/json");
            if simulated {
                builder = builder.header("x-simulated-trading", "1");
            }
            if method == Method::Post && !body_str.is_empty() {
                builder = builder.body(body_str.clone());
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) => {
                    let api_err = ApiError::from(err);
                    self.log_attempt_failure(path, attempt, max_retries, &api_err);
                    last_error = api_err;
                    self.backoff(attempt, max_retries).await;
                    continue;
                }
            };

            let status = response.status().as_u16();
            let text = match response.text().await {
                Ok(text) => text,
                Err(err) => {
                    let api_err = ApiError::from(err);
                    self.log_attempt_failure(path, attempt, max_retries, &api_err);
                    last_error = api_err;
                    self.backoff(attempt, max_retries).await;
                    continue;
                }
            };

            let envelope: Option<ApiEnvelope> = serde_json::from_str(&text).ok();

            if status != 200 {
                if let Some(envelope) = envelope {
                    if status == 401 || CREDENTIAL_ERROR_CODES.contains(&envelope.code.as_str()) {
                        self.poison_credentials(status, &envelope.code);
                        return Ok(envelope);
                    }
                    if !self.credentials_invalid() {
                        error!(
                            path,
                            status,
                            code = %envelope.code,
                            msg = %envelope.msg,
                            "API error response"
                        );
                    }
                }
                last_error = ApiError::Http {
                    status,
                    body: text.chars().take(200).collect(),
                };
                self.backoff(attempt, max_retries).await;
                continue;
            }

            match envelope {
                Some(envelope) => {
                    if !envelope.is_ok() {
                        if CREDENTIAL_ERROR_CODES.contains(&envelope.code.as_str()) {
                            self.poison_credentials(status, &envelope.code);
                            return Ok(envelope);
                        }
                        debug!(
                            path,
                            code = %envelope.code,
                            msg = %envelope.msg,
                            "non-zero application code"
                        );
                    }
                    return Ok(envelope);
                }
                None => {
                    let api_err = ApiError::Decode(format!(
                        "undecodable 200 body for {path}: {}",
                        text.chars().take(120).collect::<String>()
                    ));
                    self.log_attempt_failure(path, attempt, max_retries, &api_err);
                    last_error = api_err;
                    self.backoff(attempt, max_retries).await;
                }
            }
        }

        Err(last_error)
    }

    fn poison_credentials(&self, status: u16, code: &str) {
        if !self.credentials_invalid.swap(true, Ordering::SeqCst) {
            error!(
                status,
                code,
                "invalid API credentials detected; suppressing further requests until reapplied"
            );
        }
    }

    fn log_attempt_failure(&self, path: &str, attempt: u32, max_retries: u32, err: &ApiError) {
        if self.credentials_invalid() {
            return;
        }
        warn!(
            path,
            attempt = attempt + 1,
            max_retries,
            error = %err,
            "REST attempt failed"
        );
    }

    async fn backoff(&self, attempt: u32, max_retries: u32) {
        if attempt + 1 < max_retries {
            tokio::time::sleep(Duration::from_secs(1u64 << attempt.min(6))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_decode_and_accessors() {
        let envelope: ApiEnvelope = serde_json::from_str(
            r#"{"code":"0","msg":"","data":[{"ordId":"123"}]}"#,
        )
        .unwrap();
        assert!(envelope.is_ok());
        assert_eq!(envelope.data_array().len(), 1);

        let err: ApiEnvelope =
            serde_json::from_str(r#"{"code":"51001","msg":"order gone"}"#).unwrap();
        assert!(!err.is_ok());
        assert!(err.data_array().is_empty());
    }

    #[test]
    fn test_credential_codes_are_the_invalid_key_family() {
        for code in CREDENTIAL_ERROR_CODES {
            assert!(code.starts_with("501"));
        }
    }

    #[tokio::test]
    async fn test_poisoned_client_short_circuits() {
        let client =
            RestClient::with_base_url("http://127.0.0.1:1", Credentials::new("k", "s", "p", false))
                .unwrap();
        client.credentials_invalid.store(true, Ordering::SeqCst);

        let result = client
            .request(Method::Get, "/api/v5/account/balance", &[], None, 3)
            .await;
        assert!(matches!(result, Err(ApiError::CredentialInvalid)));

        // Reapplying credentials clears the poisoned state.
        client.set_credentials(Credentials::new("k2", "s2", "p2", false));
        assert!(!client.credentials_invalid());
    }
}
