//! Error types for onnxport.
//!
//! The pipeline distinguishes recoverable errors (fetch failures, absorbed by the
//! locator) from fatal ones (resolution and export failures). Each stage has its own
//! error enum; `OnnxportError` is the crate-wide error for everything else.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the onnxport library.
#[derive(Debug, Error)]
pub enum OnnxportError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Pipeline stage errors
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("Runtime error: {message}")]
    Runtime { message: String },

    // Registry / configuration errors
    #[error("Unknown model: {identifier}")]
    UnknownModel { identifier: String },

    #[error("Unknown variant {variant:?} for {identifier} (available: {available})")]
    UnknownVariant {
        identifier: String,
        variant: String,
        available: String,
    },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for onnxport operations.
pub type Result<T> = std::result::Result<T, OnnxportError>;

/// Failure classes for a single remote fetch.
///
/// Every variant is recoverable: the locator logs it and moves on to the next
/// candidate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("authentication required (HTTP 401) for {url}")]
    Unauthorized { url: String },

    #[error("not found (HTTP 404): {url}")]
    NotFound { url: String },

    #[error("HTTP error {code} for {url}")]
    HttpError { url: String, code: u16 },

    #[error("transport error for {url}: {message}")]
    TransportError { url: String, message: String },
}

impl FetchError {
    /// Classify a non-success HTTP status.
    pub fn from_status(url: &str, code: u16) -> Self {
        match code {
            401 => FetchError::Unauthorized {
                url: url.to_string(),
            },
            404 => FetchError::NotFound {
                url: url.to_string(),
            },
            _ => FetchError::HttpError {
                url: url.to_string(),
                code,
            },
        }
    }

    pub fn transport(url: &str, message: impl Into<String>) -> Self {
        FetchError::TransportError {
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Check if this failure is worth retrying against the same URL.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::TransportError { .. } => true,
            FetchError::HttpError { code, .. } => matches!(code, 408 | 429 | 500..=599),
            FetchError::Unauthorized { .. } | FetchError::NotFound { .. } => false,
        }
    }
}

/// Fatal failures of the checkpoint resolver.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("unresolvable checkpoint shape: {detail}")]
    UnresolvableShape { detail: String },

    #[error("unresolvable checkpoint shape: weight state found under {origin} but no architecture factory is available")]
    MissingArchitecture { origin: String },

    #[error("variant mismatch: requested {requested:?}, checkpoint provides {found:?}")]
    VariantMismatch { requested: String, found: String },

    #[error("failed to build architecture {builder}: {message}")]
    ArchitectureBuild { builder: String, message: String },
}

/// Fatal failures of the export stage.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("tracing failed: {message}")]
    Trace { message: String },

    #[error("invalid export request: {message}")]
    InvalidRequest { message: String },

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ExportError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ExportError::Io {
            path: path.into(),
            source,
        }
    }
}

// Conversion implementations for common error types

impl From<std::io::Error> for OnnxportError {
    fn from(err: std::io::Error) -> Self {
        OnnxportError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for OnnxportError {
    fn from(err: serde_json::Error) -> Self {
        OnnxportError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for OnnxportError {
    fn from(err: reqwest::Error) -> Self {
        OnnxportError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl OnnxportError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        OnnxportError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }
}

/// Attach a path to IO errors, mirroring `OnnxportError::io_with_path`.
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| OnnxportError::io_with_path(e, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_classification() {
        assert_eq!(
            FetchError::from_status("https://x/a.pth", 401),
            FetchError::Unauthorized {
                url: "https://x/a.pth".into()
            }
        );
        assert_eq!(
            FetchError::from_status("https://x/a.pth", 404),
            FetchError::NotFound {
                url: "https://x/a.pth".into()
            }
        );
        assert_eq!(
            FetchError::from_status("https://x/a.pth", 403),
            FetchError::HttpError {
                url: "https://x/a.pth".into(),
                code: 403
            }
        );
    }

    #[test]
    fn test_retryable_fetch_errors() {
        assert!(FetchError::transport("u", "reset").is_retryable());
        assert!(FetchError::from_status("u", 503).is_retryable());
        assert!(FetchError::from_status("u", 429).is_retryable());
        assert!(!FetchError::from_status("u", 404).is_retryable());
        assert!(!FetchError::from_status("u", 401).is_retryable());
        assert!(!FetchError::from_status("u", 403).is_retryable());
    }

    #[test]
    fn test_resolution_error_mentions_shape() {
        let err = ResolutionError::UnresolvableShape {
            detail: "empty container".into(),
        };
        assert!(err.to_string().contains("unresolvable checkpoint shape"));

        let err = ResolutionError::MissingArchitecture {
            origin: "state_dict".into(),
        };
        assert!(err.to_string().contains("unresolvable checkpoint shape"));
    }

    #[test]
    fn test_io_with_path() {
        let err = OnnxportError::io_with_path(
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
            "/tmp/x",
        );
        assert!(err.to_string().contains("/tmp/x"));
    }
}
