//! HTTP client wrapper.
//!
//! Wraps reqwest with a browser-like user agent, a connect timeout (no overall
//! timeout, checkpoints can be several hundred megabytes) and automatic bearer
//! authentication for HuggingFace hosts.

use reqwest::{header, Client, Response};
use tracing::debug;

use crate::config::NetworkConfig;
use crate::error::{FetchError, OnnxportError, Result};
use crate::network::auth::resolve_hf_token;

pub struct HttpClient {
    client: Client,
    hf_token: Option<String>,
}

impl HttpClient {
    /// Create a client, picking up an HF token from the environment if present.
    pub fn new() -> Result<Self> {
        let token = resolve_hf_token().map(|(token, source)| {
            debug!("Using HuggingFace token from {}", source.as_str());
            token
        });
        Self::with_token(token)
    }

    /// Create a client with an explicit (or no) HF token.
    pub fn with_token(hf_token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| OnnxportError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;

        Ok(Self { client, hf_token })
    }

    pub fn has_token(&self) -> bool {
        self.hf_token.is_some()
    }

    /// Headers to attach to a request for `url`.
    pub fn headers_for(&self, url: &str) -> Vec<(String, String)> {
        match &self.hf_token {
            Some(token) if is_hf_url(url) => vec![(
                header::AUTHORIZATION.to_string(),
                format!("Bearer {}", token),
            )],
            _ => Vec::new(),
        }
    }

    /// GET `url`, classifying any non-success status as a [`FetchError`].
    pub async fn get(&self, url: &str) -> std::result::Result<Response, FetchError> {
        let headers = self.headers_for(url);
        self.get_with_headers(url, &headers).await
    }

    /// GET `url` with extra headers.
    pub async fn get_with_headers(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> std::result::Result<Response, FetchError> {
        let mut request = self.client.get(url);
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::transport(url, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            debug!("GET {} returned {}", url, status);
            return Err(FetchError::from_status(url, status.as_u16()));
        }

        Ok(response)
    }
}

/// Extract domain from a URL.
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.host_str().unwrap_or("unknown").to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Whether `url` points at a HuggingFace host (or a subdomain of one).
pub fn is_hf_url(url: &str) -> bool {
    let domain = extract_domain(url);
    NetworkConfig::HF_DOMAINS
        .iter()
        .any(|hf| domain == *hf || domain.ends_with(&format!(".{}", hf)))
}
