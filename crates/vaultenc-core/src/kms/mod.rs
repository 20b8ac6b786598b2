//! Transit-style KMS client: generate/decrypt/rewrap data keys, read key metadata.
//!
//! The wire format matches a HashiCorp Vault Transit secrets engine: wrapped DEKs are
//! opaque strings shaped `vendor:v<N>:<base64>`, and the mount/key live in the URL path.

mod wire;

use std::time::Duration;

use base64::Engine as _;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::secure_buffer::{SecureBuffer, SecureBufferError};
use wire::{DecryptRequest, DecryptResponse, GenerateDataKeyResponse, KeyMetadataResponse, RewrapRequest, RewrapResponse};

/// Vendor tag embedded in every wrapped DEK, e.g. `vault:v3:<opaque>`.
pub const WRAPPED_DEK_VENDOR: &str = "vault";

#[derive(Debug, Error)]
pub enum KmsError {
    /// Network-level failure; safe to retry.
    #[error("KMS transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// 401/403 from the backend; retrying will not help.
    #[error("KMS authorization failed (status {status}): {body}")]
    Unauthorized { status: u16, body: String },
    /// The backend rejected the request as malformed or throttled it.
    #[error("KMS request failed (status {status}): {body}")]
    RequestFailed { status: u16, body: String },
    /// `429` or backend-signaled throttling; retry with a longer backoff.
    #[error("KMS throttled the request (status {status})")]
    Throttled { status: u16 },
    /// The wrapped DEK string did not match `vendor:vN:opaque`.
    #[error("malformed wrapped DEK: {0}")]
    MalformedWrappedDek(String),
    /// The backend's base64 payload did not decode.
    #[error("invalid base64 in KMS response: {0}")]
    InvalidBase64(#[from] base64::DecodeError),
    /// Building a `SecureBuffer` for the recovered plaintext failed.
    #[error("failed to secure plaintext DEK: {0}")]
    SecureBuffer(#[from] SecureBufferError),
}

impl KmsError {
    /// Whether this class of failure should be retried by the caller (Work Queue backoff
    /// or the client's own bounded internal retry).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KmsError::Transport(_) | KmsError::Throttled { .. } | KmsError::RequestFailed { .. }
        )
    }
}

/// The parsed components of a wrapped DEK string: `vendor:v<version>:<opaque>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedDek {
    pub vendor: String,
    pub version: u32,
    pub opaque: String,
}

impl WrappedDek {
    pub fn parse(raw: &str) -> Result<Self, KmsError> {
        let mut parts = raw.splitn(3, ':');
        let (Some(vendor), Some(version_tag), Some(opaque)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(KmsError::MalformedWrappedDek(raw.to_string()));
        };
        let version = version_tag
            .strip_prefix('v')
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| KmsError::MalformedWrappedDek(raw.to_string()))?;
        Ok(Self {
            vendor: vendor.to_string(),
            version,
            opaque: opaque.to_string(),
        })
    }

    #[must_use]
    pub fn to_wire(&self) -> String {
        format!("{}:v{}:{}", self.vendor, self.version, self.opaque)
    }
}

/// Result of `generate_data_key`: a fresh plaintext DEK (already secured) and its
/// wrapped form for the sidecar.
pub struct GeneratedDataKey {
    pub plaintext: SecureBuffer,
    pub wrapped: String,
}

/// Configuration for reaching the Transit-style backend.
#[derive(Debug, Clone)]
pub struct KmsClientConfig {
    pub agent_address: String,
    pub transit_mount: String,
    pub key_name: String,
    pub request_timeout: Duration,
    pub namespace: Option<String>,
    pub token: Option<String>,
}

/// Stateless client over a pooled HTTP connection. All operations are safe to retry.
pub struct KmsClient {
    http: Client,
    config: KmsClientConfig,
}

const MAX_INTERNAL_RETRIES: u32 = 3;
const INTERNAL_RETRY_BASE: Duration = Duration::from_millis(200);

impl KmsClient {
    pub fn new(config: KmsClientConfig) -> Result<Self, KmsError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { http, config })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/v1/{}/{}",
            self.config.agent_address.trim_end_matches('/'),
            self.config.transit_mount,
            path
        )
    }

    fn apply_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder;
        if let Some(token) = &self.config.token {
            builder = builder.header("X-Vault-Token", token);
        }
        if let Some(namespace) = &self.config.namespace {
            builder = builder.header("X-Vault-Namespace", namespace);
        }
        builder
    }

    async fn classify_status(resp: reqwest::Response) -> Result<reqwest::Response, KmsError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                KmsError::Unauthorized { status: status.as_u16(), body }
            }
            StatusCode::TOO_MANY_REQUESTS => KmsError::Throttled { status: status.as_u16() },
            _ => KmsError::RequestFailed { status: status.as_u16(), body },
        })
    }

    /// Run `op` up to `MAX_INTERNAL_RETRIES` times with deterministic exponential
    /// backoff, but only for retryable error classes.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, KmsError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, KmsError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < MAX_INTERNAL_RETRIES => {
                    attempt += 1;
                    let delay = INTERNAL_RETRY_BASE * 2u32.pow(attempt - 1);
                    warn!(attempt, ?delay, error = %e, "retrying KMS call");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Generate a fresh DEK bound to the configured key. The plaintext never touches
    /// a log line or the error path; it is moved into a `SecureBuffer` immediately.
    #[instrument(level = "info", skip(self), fields(key = %self.config.key_name))]
    pub async fn generate_data_key(&self) -> Result<GeneratedDataKey, KmsError> {
        self.with_retry(|| async {
            let url = self.url(&format!("datakey/plaintext/{}", self.config.key_name));
            let resp = self.apply_headers(self.http.post(&url)).send().await?;
            let resp = Self::classify_status(resp).await?;
            let body: GenerateDataKeyResponse = resp.json().await?;

            let mut plaintext_bytes = base64::engine::general_purpose::STANDARD.decode(&body.data.plaintext)?;
            let secured = SecureBuffer::from_slice(&plaintext_bytes)?;
            // Zeroize the transient decoded copy the compiler cannot elide away.
            use zeroize::Zeroize;
            plaintext_bytes.zeroize();

            debug!("generated fresh DEK");
            Ok(GeneratedDataKey {
                plaintext: secured,
                wrapped: body.data.ciphertext,
            })
        })
        .await
    }

    /// Recover the plaintext DEK from its wrapped form.
    #[instrument(level = "info", skip(self, wrapped_dek), fields(key = %self.config.key_name))]
    pub async fn decrypt_data_key(&self, wrapped_dek: &str) -> Result<SecureBuffer, KmsError> {
        let wrapped_dek = wrapped_dek.to_string();
        self.with_retry(|| {
            let wrapped_dek = wrapped_dek.clone();
            async move {
                let url = self.url(&format!("decrypt/{}", self.config.key_name));
                let resp = self
                    .apply_headers(self.http.post(&url))
                    .json(&DecryptRequest { ciphertext: wrapped_dek })
                    .send()
                    .await?;
                let resp = Self::classify_status(resp).await?;
                let body: DecryptResponse = resp.json().await?;

                let mut plaintext_bytes = base64::engine::general_purpose::STANDARD.decode(&body.data.plaintext)?;
                let secured = SecureBuffer::from_slice(&plaintext_bytes)?;
                use zeroize::Zeroize;
                plaintext_bytes.zeroize();
                Ok(secured)
            }
        })
        .await
    }

    /// Re-wrap a DEK under the current key version without exposing plaintext.
    #[instrument(level = "info", skip(self, wrapped_dek), fields(key = %self.config.key_name))]
    pub async fn rewrap_data_key(&self, wrapped_dek: &str) -> Result<String, KmsError> {
        let wrapped_dek = wrapped_dek.to_string();
        self.with_retry(|| {
            let wrapped_dek = wrapped_dek.clone();
            async move {
                let url = self.url(&format!("rewrap/{}", self.config.key_name));
                let resp = self
                    .apply_headers(self.http.post(&url))
                    .json(&RewrapRequest { ciphertext: wrapped_dek })
                    .send()
                    .await?;
                let resp = Self::classify_status(resp).await?;
                let body: RewrapResponse = resp.json().await?;
                Ok(body.data.ciphertext)
            }
        })
        .await
    }

    /// Read the latest key version for the configured key.
    #[instrument(level = "debug", skip(self), fields(key = %self.config.key_name))]
    pub async fn read_key_metadata(&self) -> Result<u32, KmsError> {
        self.with_retry(|| async {
            let url = self.url(&format!("keys/{}", self.config.key_name));
            let resp = self.apply_headers(self.http.get(&url)).send().await?;
            let resp = Self::classify_status(resp).await?;
            let body: KeyMetadataResponse = resp.json().await?;
            Ok(body.data.latest_version)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wrapped_dek() {
        let parsed = WrappedDek::parse("vault:v3:abcd1234").unwrap();
        assert_eq!(parsed.vendor, "vault");
        assert_eq!(parsed.version, 3);
        assert_eq!(parsed.opaque, "abcd1234");
        assert_eq!(parsed.to_wire(), "vault:v3:abcd1234");
    }

    #[test]
    fn rejects_malformed_wrapped_dek() {
        assert!(WrappedDek::parse("not-a-wrapped-key").is_err());
        assert!(WrappedDek::parse("vault:3:abcd").is_err());
    }
}
