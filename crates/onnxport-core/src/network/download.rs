//! Artifact fetcher with progress tracking.
//!
//! Downloads stream into `<destination>.part` and are renamed into place only
//! after the body is fully written, so an interrupted fetch never leaves a
//! truncated file at the destination. Transient failures are retried against
//! the same URL; 401 and 404 are not.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::NetworkConfig;
use crate::error::{FetchError, Result};
use crate::network::client::HttpClient;
use crate::network::retry::{retry_async, RetryConfig};

/// Downloads a single URL to a local path.
///
/// Returns the number of bytes written. Every failure is a [`FetchError`], which
/// the locator treats as recoverable.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, url: &str, destination: &Path) -> std::result::Result<u64, FetchError>;
}

/// Progress information for a download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub url: String,
    /// Bytes downloaded so far.
    pub bytes_downloaded: u64,
    /// Total bytes (if the server sent a content length).
    pub total_bytes: Option<u64>,
    /// Download speed in bytes per second.
    pub speed_bytes_per_sec: f64,
    /// Percentage complete (0-100).
    pub percent: Option<f64>,
    /// Estimated time remaining in seconds.
    pub eta_seconds: Option<f64>,
}

impl DownloadProgress {
    fn new(url: &str, bytes_downloaded: u64, total_bytes: Option<u64>, speed: f64) -> Self {
        let percent = total_bytes.map(|total| {
            if total > 0 {
                (bytes_downloaded as f64 / total as f64) * 100.0
            } else {
                0.0
            }
        });

        let eta_seconds = total_bytes.and_then(|total| {
            if speed > 0.0 && bytes_downloaded < total {
                Some((total - bytes_downloaded) as f64 / speed)
            } else {
                None
            }
        });

        Self {
            url: url.to_string(),
            bytes_downloaded,
            total_bytes,
            speed_bytes_per_sec: speed,
            percent,
            eta_seconds,
        }
    }
}

/// HTTP implementation of [`Fetch`].
pub struct HttpFetcher {
    http: Arc<HttpClient>,
    retry: RetryConfig,
    progress_tx: Option<mpsc::Sender<DownloadProgress>>,
    progress_interval: Duration,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        Ok(Self::with_client(Arc::new(HttpClient::new()?)))
    }

    pub fn with_client(http: Arc<HttpClient>) -> Self {
        Self {
            http,
            retry: RetryConfig::default(),
            progress_tx: None,
            progress_interval: NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Report progress on `tx`. Updates are dropped when the receiver lags.
    pub fn with_progress(mut self, tx: mpsc::Sender<DownloadProgress>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    fn report(&self, progress: DownloadProgress) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.try_send(progress);
        }
    }

    async fn download_once(
        &self,
        url: &str,
        destination: &Path,
    ) -> std::result::Result<u64, FetchError> {
        let temp_path = temp_path_for(destination);

        match self.stream_to(url, &temp_path).await {
            Ok(bytes) => {
                tokio::fs::rename(&temp_path, destination)
                    .await
                    .map_err(|e| {
                        let _ = std::fs::remove_file(&temp_path);
                        FetchError::transport(
                            url,
                            format!("failed to move download into place: {}", e),
                        )
                    })?;
                info!("Downloaded {} bytes to {}", bytes, destination.display());
                Ok(bytes)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }

    async fn stream_to(&self, url: &str, temp_path: &Path) -> std::result::Result<u64, FetchError> {
        let response = self.http.get(url).await?;
        let total_bytes = response.content_length();

        let file = tokio::fs::File::create(temp_path)
            .await
            .map_err(|e| FetchError::transport(url, format!("failed to create temp file: {}", e)))?;
        // Disk writes go out in fixed-size blocks whatever the network chunking.
        let mut file = BufWriter::with_capacity(NetworkConfig::DOWNLOAD_CHUNK_SIZE, file);

        let mut bytes_downloaded: u64 = 0;
        let mut last_progress_update = Instant::now();
        let mut speed_tracker = SpeedTracker::new();
        let mut stream = response.bytes_stream();

        self.report(DownloadProgress::new(url, 0, total_bytes, 0.0));

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| FetchError::transport(url, format!("error reading body: {}", e)))?;

            file.write_all(&chunk)
                .await
                .map_err(|e| FetchError::transport(url, format!("write failed: {}", e)))?;

            bytes_downloaded += chunk.len() as u64;
            speed_tracker.record(chunk.len() as u64);

            if last_progress_update.elapsed() >= self.progress_interval {
                self.report(DownloadProgress::new(
                    url,
                    bytes_downloaded,
                    total_bytes,
                    speed_tracker.speed(),
                ));
                last_progress_update = Instant::now();
            }
        }

        file.flush()
            .await
            .map_err(|e| FetchError::transport(url, format!("flush failed: {}", e)))?;

        if let Some(expected) = total_bytes {
            if bytes_downloaded < expected {
                return Err(FetchError::transport(
                    url,
                    format!("body truncated: {} of {} bytes", bytes_downloaded, expected),
                ));
            }
        }

        self.report(DownloadProgress::new(
            url,
            bytes_downloaded,
            total_bytes,
            speed_tracker.speed(),
        ));

        Ok(bytes_downloaded)
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, destination: &Path) -> std::result::Result<u64, FetchError> {
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                FetchError::transport(
                    url,
                    format!("failed to create {}: {}", parent.display(), e),
                )
            })?;
        }

        let (result, stats) = retry_async(
            &self.retry,
            || self.download_once(url, destination),
            FetchError::is_retryable,
        )
        .await;

        if stats.attempts > 1 {
            debug!(
                "Fetch of {} finished after {} attempts (total delay: {:?})",
                url, stats.attempts, stats.total_delay
            );
        }

        result
    }
}

fn temp_path_for(destination: &Path) -> PathBuf {
    PathBuf::from(format!(
        "{}{}",
        destination.display(),
        NetworkConfig::DOWNLOAD_TEMP_SUFFIX
    ))
}

/// Average throughput since the download started.
struct SpeedTracker {
    start_time: Instant,
    total_bytes: u64,
}

impl SpeedTracker {
    fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_bytes: 0,
        }
    }

    fn record(&mut self, bytes: u64) {
        self.total_bytes += bytes;
    }

    fn speed(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.total_bytes as f64 / elapsed
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fetcher() -> HttpFetcher {
        let http = Arc::new(HttpClient::with_token(None).unwrap());
        HttpFetcher::with_client(http).with_retry(
            RetryConfig::new()
                .with_max_attempts(2)
                .with_base_delay(Duration::from_millis(5))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_download_progress() {
        let progress = DownloadProgress::new("u", 50, Some(100), 10.0);
        assert_eq!(progress.percent, Some(50.0));
        assert_eq!(progress.eta_seconds, Some(5.0));

        let progress = DownloadProgress::new("u", 50, None, 10.0);
        assert_eq!(progress.percent, None);
        assert_eq!(progress.eta_seconds, None);
    }

    #[test]
    fn test_temp_path_suffix() {
        let temp = temp_path_for(Path::new("/cache/fbcnn/fbcnn_color.pth"));
        assert_eq!(temp, PathBuf::from("/cache/fbcnn/fbcnn_color.pth.part"));
    }

    #[tokio::test]
    async fn test_fetch_writes_destination_and_creates_parents() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![7u8; 20_000];
        let _m = server
            .mock("GET", "/weights.pth")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("nested").join("dir").join("weights.pth");
        let (tx, mut rx) = mpsc::channel(64);

        let bytes = fetcher()
            .with_progress(tx)
            .fetch(&format!("{}/weights.pth", server.url()), &dest)
            .await
            .unwrap();

        assert_eq!(bytes, 20_000);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(!temp_path_for(&dest).exists());

        let first = rx.recv().await.unwrap();
        assert_eq!(first.bytes_downloaded, 0);
    }

    #[tokio::test]
    async fn test_body_spanning_partial_write_block() {
        let mut server = mockito::Server::new_async().await;
        let size = NetworkConfig::DOWNLOAD_CHUNK_SIZE * 3 + 17;
        let body: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        let _m = server
            .mock("GET", "/odd.bin")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("odd.bin");
        let (tx, mut rx) = mpsc::channel(64);

        let bytes = fetcher()
            .with_progress(tx)
            .fetch(&format!("{}/odd.bin", server.url()), &dest)
            .await
            .unwrap();

        assert_eq!(bytes, size as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);

        let mut last = None;
        while let Ok(progress) = rx.try_recv() {
            last = Some(progress);
        }
        assert_eq!(last.unwrap().bytes_downloaded, size as u64);
    }

    #[tokio::test]
    async fn test_not_found_leaves_no_file_and_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/missing.pth")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("missing.pth");
        let err = fetcher()
            .fetch(&format!("{}/missing.pth", server.url()), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NotFound { .. }));
        assert!(!dest.exists());
        assert!(!temp_path_for(&dest).exists());
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/flaky.pth")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let temp = TempDir::new().unwrap();
        let err = fetcher()
            .fetch(
                &format!("{}/flaky.pth", server.url()),
                &temp.path().join("flaky.pth"),
            )
            .await
            .unwrap_err();

        assert_eq!(
            err,
            FetchError::HttpError {
                url: format!("{}/flaky.pth", server.url()),
                code: 503
            }
        );
        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_bearer_sent_to_hf_only() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("GET", "/plain.bin")
            .match_header("authorization", mockito::Matcher::Missing)
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        // Mock server host is 127.0.0.1, not an HF domain.
        let http = Arc::new(HttpClient::with_token(Some("hf_secret".into())).unwrap());
        let temp = TempDir::new().unwrap();
        HttpFetcher::with_client(http)
            .fetch(
                &format!("{}/plain.bin", server.url()),
                &temp.path().join("plain.bin"),
            )
            .await
            .unwrap();
        m.assert_async().await;
    }
}
