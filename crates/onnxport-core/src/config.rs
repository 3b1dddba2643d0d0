//! Centralized configuration for onnxport.
//!
//! Constants for network operations, export layout and on-disk paths.

use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "onnxport";
    pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_ATTEMPTS: u32 = 2;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
    pub const DOWNLOAD_CHUNK_SIZE: usize = 8192;
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    pub const DOWNLOAD_TEMP_SUFFIX: &'static str = ".part";
    /// Some hosts reject requests without a browser-like user agent (HTTP 403).
    pub const USER_AGENT: &'static str =
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
    pub const HF_TOKEN_ENV_VAR: &'static str = "HF_TOKEN";
    pub const HF_DOMAINS: &'static [&'static str] = &["huggingface.co", "hf.co"];
}

/// Export layout and defaults.
pub struct ExportConfig;

impl ExportConfig {
    pub const DEFAULT_OPSET: u32 = 11;
    pub const ONNX_DIR_NAME: &'static str = "onnx";
    pub const MODEL_FILE_NAME: &'static str = "model.onnx";
    pub const QUANTIZED_FILE_NAME: &'static str = "model_quantized.onnx";
    pub const MANIFEST_FILE_NAME: &'static str = "export_manifest.json";
    /// Number of container values sampled by the raw weight-state heuristic.
    pub const STATE_SAMPLE_SIZE: usize = 5;
}

/// Shared directory and path configurations.
pub struct PathsConfig;

impl PathsConfig {
    pub const DEFAULT_OUTPUT_ROOT: &'static str = "./models";
    pub const CACHE_DIR_NAME: &'static str = ".cache";
    pub const BRIDGE_DIR_NAME: &'static str = "onnxport-bridge";
    pub const DEFAULT_PYTHON: &'static str = "python3";
}
