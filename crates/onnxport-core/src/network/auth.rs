//! HuggingFace token resolution.
//!
//! Gated repositories answer 401 without a bearer token. The token is read from
//! the `HF_TOKEN` environment variable first, then from the HuggingFace CLI
//! cache (`~/.cache/huggingface/token`).

use std::path::{Path, PathBuf};

use crate::config::NetworkConfig;

/// Where a resolved token came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    EnvVar,
    HfCache,
}

impl TokenSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenSource::EnvVar => "env_var",
            TokenSource::HfCache => "hf_cache",
        }
    }
}

/// Resolve an HF token from the environment or the CLI cache file.
pub fn resolve_hf_token() -> Option<(String, TokenSource)> {
    resolve_from(
        std::env::var(NetworkConfig::HF_TOKEN_ENV_VAR).ok(),
        dirs::home_dir().map(|home| hf_cache_token_path(&home)),
    )
}

fn hf_cache_token_path(home: &Path) -> PathBuf {
    home.join(".cache").join("huggingface").join("token")
}

fn resolve_from(
    env_value: Option<String>,
    cache_file: Option<PathBuf>,
) -> Option<(String, TokenSource)> {
    if let Some(token) = env_value.as_deref().and_then(non_empty) {
        return Some((token, TokenSource::EnvVar));
    }

    let content = std::fs::read_to_string(cache_file?).ok()?;
    non_empty(&content).map(|token| (token, TokenSource::HfCache))
}

fn non_empty(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_env_var_wins_over_cache_file() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("token");
        std::fs::write(&cache, "hf_from_cache").unwrap();

        let (token, source) = resolve_from(Some("hf_from_env\n".into()), Some(cache)).unwrap();
        assert_eq!(token, "hf_from_env");
        assert_eq!(source, TokenSource::EnvVar);
    }

    #[test]
    fn test_blank_env_var_falls_back_to_cache_file() {
        let temp = TempDir::new().unwrap();
        let cache = temp.path().join("token");
        std::fs::write(&cache, "  hf_from_cache  \n").unwrap();

        let (token, source) = resolve_from(Some("   ".into()), Some(cache)).unwrap();
        assert_eq!(token, "hf_from_cache");
        assert_eq!(source.as_str(), "hf_cache");
    }

    #[test]
    fn test_missing_everything_yields_none() {
        let temp = TempDir::new().unwrap();
        assert!(resolve_from(None, Some(temp.path().join("absent"))).is_none());
        assert!(resolve_from(None, None).is_none());
    }

    #[test]
    fn test_cache_path_layout() {
        let path = hf_cache_token_path(Path::new("/home/u"));
        assert!(path.ends_with(".cache/huggingface/token"));
    }
}
