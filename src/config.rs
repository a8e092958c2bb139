//! TOML configuration parsing and validation.
//!
//! Every section has defaults, so a minimal config file only needs the
//! pieces that differ from them. Credentials are never stored in the file
//! itself: backends name the environment variable that holds their key.
//!
//! ```toml
//! [db]
//! path = "./data/matcher.sqlite"
//!
//! [embedding]
//! provider = "ollama"
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [scoring.primary]
//! provider = "gemini"
//! model = "gemini-flash-latest"
//! api_key_env = "GEMINI_API_KEY"
//!
//! [scoring.fallback]
//! provider = "chat"
//! url = "https://api.perplexity.ai/chat/completions"
//! model = "sonar"
//! api_key_env = "PERPLEXITY_API_KEY"
//!
//! [matching]
//! hybrid = true
//! top_k = 20
//! min_similarity = 0.3
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/matcher.sqlite"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of the sharded content-addressed file arena.
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/storage"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama host, or an OpenAI-compatible endpoint).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScoringConfig {
    /// Retries for transient failures, per backend.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff; doubles on every retry.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Deadline for a single HTTP attempt.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Deadline for one backend including all of its retries.
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_primary")]
    pub primary: Option<BackendConfig>,
    #[serde(default = "default_fallback")]
    pub fallback: Option<BackendConfig>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            deadline_secs: default_deadline_secs(),
            primary: default_primary(),
            fallback: default_fallback(),
        }
    }
}

fn default_backoff_ms() -> u64 {
    2000
}
fn default_call_timeout_secs() -> u64 {
    45
}
fn default_deadline_secs() -> u64 {
    120
}
fn default_primary() -> Option<BackendConfig> {
    Some(BackendConfig {
        provider: "gemini".to_string(),
        model: "gemini-flash-latest".to_string(),
        url: None,
        api_key_env: "GEMINI_API_KEY".to_string(),
    })
}
fn default_fallback() -> Option<BackendConfig> {
    Some(BackendConfig {
        provider: "chat".to_string(),
        model: "sonar".to_string(),
        url: Some("https://api.perplexity.ai/chat/completions".to_string()),
        api_key_env: "PERPLEXITY_API_KEY".to_string(),
    })
}

impl ScoringConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// One scoring backend: `gemini` (generateContent) or `chat`
/// (OpenAI-compatible chat completions).
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    pub api_key_env: String,
}

impl BackendConfig {
    /// Reads the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_true")]
    pub hybrid: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
    #[serde(default = "default_min_score")]
    pub min_score: u8,
    /// Pause after this many fresh backend calls.
    #[serde(default = "default_pace_every")]
    pub pace_every: usize,
    #[serde(default = "default_pace_secs")]
    pub pace_secs: u64,
    /// 0 disables expiry.
    #[serde(default)]
    pub cache_ttl_hours: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            hybrid: true,
            top_k: default_top_k(),
            min_similarity: default_min_similarity(),
            min_score: default_min_score(),
            pace_every: default_pace_every(),
            pace_secs: default_pace_secs(),
            cache_ttl_hours: 0,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_top_k() -> usize {
    20
}
fn default_min_similarity() -> f32 {
    0.3
}
fn default_min_score() -> u8 {
    60
}
fn default_pace_every() -> usize {
    10
}
fn default_pace_secs() -> u64 {
    2
}

impl MatchingConfig {
    pub fn pace_interval(&self) -> Duration {
        Duration::from_secs(self.pace_secs)
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_hours > 0).then(|| Duration::from_secs(self.cache_ttl_hours * 3600))
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parses and validates a config document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    for (label, backend) in [
        ("scoring.primary", &config.scoring.primary),
        ("scoring.fallback", &config.scoring.fallback),
    ] {
        if let Some(b) = backend {
            match b.provider.as_str() {
                "gemini" | "chat" => {}
                other => anyhow::bail!(
                    "Unknown {} provider: '{}'. Must be gemini or chat.",
                    label,
                    other
                ),
            }
            if b.provider == "chat" && b.url.is_none() {
                anyhow::bail!("{}.url is required for the chat provider", label);
            }
        }
    }

    if config.scoring.call_timeout_secs == 0 || config.scoring.deadline_secs == 0 {
        anyhow::bail!("scoring timeouts must be > 0");
    }

    if config.matching.top_k == 0 {
        anyhow::bail!("matching.top_k must be >= 1");
    }

    if !(-1.0..=1.0).contains(&config.matching.min_similarity) {
        anyhow::bail!("matching.min_similarity must be in [-1.0, 1.0]");
    }

    if config.matching.min_score > 100 {
        anyhow::bail!("matching.min_score must be in [0, 100]");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.matching.top_k, 20);
        assert_eq!(config.matching.min_score, 60);
        assert!(config.matching.hybrid);
        assert!(config.matching.cache_ttl().is_none());
        assert_eq!(config.scoring.primary.as_ref().unwrap().provider, "gemini");
        assert_eq!(config.scoring.fallback.as_ref().unwrap().provider, "chat");
    }

    #[test]
    fn test_openai_requires_dims_and_model() {
        let err = parse_config("[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));

        let err = parse_config("[embedding]\nprovider = \"openai\"\ndims = 1536\n").unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_unknown_scoring_provider_rejected() {
        let toml = r#"
[scoring.primary]
provider = "carrier-pigeon"
model = "x"
api_key_env = "X"
"#;
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("scoring.primary"));
    }

    #[test]
    fn test_chat_backend_needs_url() {
        let toml = r#"
[scoring.fallback]
provider = "chat"
model = "sonar"
api_key_env = "PERPLEXITY_API_KEY"
"#;
        let err = parse_config(toml).unwrap_err();
        assert!(err.to_string().contains("scoring.fallback.url"));
    }

    #[test]
    fn test_similarity_bounds() {
        let err = parse_config("[matching]\nmin_similarity = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("min_similarity"));
    }

    #[test]
    fn test_ttl_hours_converts() {
        let config = parse_config("[matching]\ncache_ttl_hours = 24\n").unwrap();
        assert_eq!(
            config.matching.cache_ttl(),
            Some(Duration::from_secs(24 * 3600))
        );
    }
}
