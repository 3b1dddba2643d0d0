//! Network layer: authenticated HTTP client, retries and the artifact fetcher.

mod auth;
mod client;
mod download;
mod retry;

pub use auth::{resolve_hf_token, TokenSource};
pub use client::{extract_domain, is_hf_url, HttpClient};
pub use download::{DownloadProgress, Fetch, HttpFetcher};
pub use retry::{retry_async, RetryConfig, RetryStats};
