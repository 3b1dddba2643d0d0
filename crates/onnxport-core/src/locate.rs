//! Artifact locator: model identifier to a local weights file.
//!
//! Local candidates are always probed first. Remote candidates are then tried in
//! declared priority order through a [`Fetch`] implementation until one
//! succeeds. Fetch failures are logged and absorbed; only exhausting every
//! candidate is reported, as [`ArtifactNotFound`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::network::Fetch;

/// Where a candidate artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    LocalPath(PathBuf),
    RemoteUrl(String),
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::LocalPath(path) => write!(f, "{}", path.display()),
            SourceKind::RemoteUrl(url) => write!(f, "{}", url),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCandidate {
    pub kind: SourceKind,
    /// Lower is tried first. Ties keep declaration order.
    pub priority: u32,
}

impl SourceCandidate {
    pub fn local(path: impl Into<PathBuf>, priority: u32) -> Self {
        Self {
            kind: SourceKind::LocalPath(path.into()),
            priority,
        }
    }

    pub fn remote(url: impl Into<String>, priority: u32) -> Self {
        Self {
            kind: SourceKind::RemoteUrl(url.into()),
            priority,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, SourceKind::LocalPath(_))
    }
}

/// What the locator needs to know about the artifact being located.
#[derive(Debug, Clone)]
pub struct LocateRequest {
    pub identifier: String,
    /// Directory remote candidates are downloaded into, under the URL's file name.
    pub download_dir: PathBuf,
    /// Manual acquisition steps shown when every candidate fails.
    pub instructions: Option<String>,
}

/// A successfully located artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedArtifact {
    pub path: PathBuf,
    pub source: SourceKind,
    pub downloaded: bool,
}

/// Outcome of one candidate probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptedSource {
    pub source: SourceKind,
    pub outcome: String,
}

/// Every candidate failed. Recoverable: the caller decides what to do.
#[derive(Debug, Clone, Error)]
#[error("no artifact found for {identifier} ({} sources tried)", attempted.len())]
pub struct ArtifactNotFound {
    pub identifier: String,
    pub attempted: Vec<AttemptedSource>,
    pub instructions: Option<String>,
}

impl ArtifactNotFound {
    /// Multi-line remediation text: what was tried, then the manual steps.
    pub fn remediation(&self) -> String {
        let mut text = String::new();
        if !self.attempted.is_empty() {
            text.push_str("Tried:\n");
            for attempt in &self.attempted {
                text.push_str(&format!("  - {} ({})\n", attempt.source, attempt.outcome));
            }
        }
        match &self.instructions {
            Some(instructions) => text.push_str(instructions),
            None => text.push_str("Download the weights manually and pass --model-path."),
        }
        text
    }
}

pub struct ArtifactLocator {
    fetcher: Arc<dyn Fetch>,
    work_dir: PathBuf,
    allow_download: bool,
}

impl ArtifactLocator {
    pub fn new(fetcher: Arc<dyn Fetch>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            work_dir: work_dir.into(),
            allow_download: true,
        }
    }

    /// When disabled, remote candidates are recorded as skipped.
    pub fn with_downloads(mut self, allow: bool) -> Self {
        self.allow_download = allow;
        self
    }

    /// Expand `~` and resolve relative paths against the working directory.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        let expanded = expand_home(path);
        if expanded.is_absolute() {
            expanded
        } else {
            self.work_dir.join(expanded)
        }
    }

    pub async fn locate(
        &self,
        request: &LocateRequest,
        candidates: &[SourceCandidate],
    ) -> Result<LocatedArtifact, ArtifactNotFound> {
        let mut attempted = Vec::new();

        let (mut locals, mut remotes): (Vec<&SourceCandidate>, Vec<&SourceCandidate>) =
            candidates.iter().partition(|c| c.is_local());
        locals.sort_by_key(|c| c.priority);
        remotes.sort_by_key(|c| c.priority);

        for candidate in locals {
            let SourceKind::LocalPath(path) = &candidate.kind else {
                continue;
            };
            let resolved = self.resolve_path(path);
            if resolved.is_file() {
                info!("Found {} at {}", request.identifier, resolved.display());
                return Ok(LocatedArtifact {
                    path: resolved,
                    source: candidate.kind.clone(),
                    downloaded: false,
                });
            }
            debug!("Not found locally: {}", resolved.display());
            attempted.push(AttemptedSource {
                source: SourceKind::LocalPath(resolved),
                outcome: "not found".to_string(),
            });
        }

        let download_dir = self.resolve_path(&request.download_dir);
        for candidate in remotes {
            let SourceKind::RemoteUrl(url) = &candidate.kind else {
                continue;
            };
            let destination = download_dir.join(url_file_name(url));

            if !self.allow_download {
                attempted.push(AttemptedSource {
                    source: candidate.kind.clone(),
                    outcome: "skipped (downloads disabled)".to_string(),
                });
                continue;
            }

            info!("Downloading {} from {}", request.identifier, url);
            match self.fetcher.fetch(url, &destination).await {
                Ok(bytes) => {
                    info!("Fetched {} bytes to {}", bytes, destination.display());
                    return Ok(LocatedArtifact {
                        path: destination,
                        source: candidate.kind.clone(),
                        downloaded: true,
                    });
                }
                Err(e) => {
                    warn!("Fetch failed, trying next source: {}", e);
                    attempted.push(AttemptedSource {
                        source: candidate.kind.clone(),
                        outcome: e.to_string(),
                    });
                }
            }
        }

        Err(ArtifactNotFound {
            identifier: request.identifier.clone(),
            attempted,
            instructions: request.instructions.clone(),
        })
    }
}

/// Last path segment of `url`, used as the local file name.
pub fn url_file_name(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        })
        .unwrap_or_else(|| "download.bin".to_string())
}

fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}
