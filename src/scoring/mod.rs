//! Compatibility scoring backends and the fallback chain.
//!
//! A [`ScoringStrategy`] makes one attempt at scoring a (candidate, project)
//! pair. Retrying, backoff and deadlines are applied uniformly by
//! [`RetryPolicy`] so every backend fails the same way:
//!
//! | Error | Retried | Effect |
//! |-------|---------|--------|
//! | [`ScoreError::Transient`], [`ScoreError::Timeout`] | yes, with backoff | next attempt |
//! | [`ScoreError::Malformed`] | no | next strategy |
//! | [`ScoreError::Rejected`], [`ScoreError::Request`] | no | next strategy |
//!
//! When every strategy has failed the [`Scorer`] emits a sentinel result
//! instead of an error.

pub mod chat;
pub mod gemini;
mod scorer;

pub use scorer::Scorer;

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use crate::config::{BackendConfig, ScoringConfig};
use crate::models::{CandidateProfile, Project, ScoreSource, Verdict};
use crate::response::{parse_json_response, MalformedResponseError};

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Malformed(#[from] MalformedResponseError),
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("could not build request: {0}")]
    Request(String),
    #[error("all scoring backends failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

impl ScoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ScoreError::Transient(_) | ScoreError::Timeout(_))
    }

    /// Maps a non-success HTTP status: 429 and 5xx are transient, other
    /// statuses are final.
    pub fn from_status(backend: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let excerpt: String = body.chars().take(300).collect();
        if status.as_u16() == 429 || status.is_server_error() {
            ScoreError::Transient(format!("{} API error {}: {}", backend, status, excerpt))
        } else {
            ScoreError::Rejected {
                status: status.as_u16(),
                message: format!("{} API error: {}", backend, excerpt),
            }
        }
    }
}

impl From<reqwest::Error> for ScoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ScoreError::Malformed(MalformedResponseError::new(
                "response envelope was not JSON",
                &e.to_string(),
            ))
        } else {
            ScoreError::Transient(e.to_string())
        }
    }
}

/// One backend able to score a (candidate, project) pair.
///
/// `score` performs a single attempt; callers own retries and deadlines.
#[async_trait]
pub trait ScoringStrategy: Send + Sync {
    fn name(&self) -> &str;
    /// Tag attached to results this strategy produces.
    fn source(&self) -> ScoreSource;
    async fn score(
        &self,
        candidate: &CandidateProfile,
        project: &Project,
    ) -> Result<Verdict, ScoreError>;
}

/// Parses backend text into a verdict that carries a score.
pub(crate) fn verdict_from_text(text: &str) -> Result<Verdict, ScoreError> {
    let verdict: Verdict = parse_json_response(text)?;
    if verdict.overall_score.is_none() {
        return Err(MalformedResponseError::new("missing or non-numeric overall_score", text).into());
    }
    Ok(verdict)
}

/// Retry with exponential backoff and a per-attempt deadline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ScoringConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.backoff(),
            call_timeout: config.call_timeout(),
        }
    }

    /// Delay before retry number `attempt` (1-based): `backoff × 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(10))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// the retry budget is spent.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, ScoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScoreError>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(self.call_timeout, op()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ScoreError::Timeout(self.call_timeout)),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        backend = label,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying scoring call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Builds the ordered strategy chain from config. Backends whose API key
/// is not set are skipped; having none at all is a configuration error.
pub fn build_strategies(config: &ScoringConfig) -> Result<Vec<Box<dyn ScoringStrategy>>> {
    let mut strategies: Vec<Box<dyn ScoringStrategy>> = Vec::new();

    for (backend, source) in [
        (&config.primary, ScoreSource::Primary),
        (&config.fallback, ScoreSource::Fallback),
    ] {
        let Some(backend) = backend else {
            continue;
        };
        let Some(api_key) = backend.api_key() else {
            tracing::warn!(
                provider = %backend.provider,
                env = %backend.api_key_env,
                "scoring backend skipped: API key not set"
            );
            continue;
        };
        strategies.push(build_strategy(backend, api_key, source, config.call_timeout())?);
    }

    if strategies.is_empty() {
        bail!(
            "No scoring backend is usable. Set the API key named by scoring.primary.api_key_env \
             or scoring.fallback.api_key_env."
        );
    }

    Ok(strategies)
}

fn build_strategy(
    backend: &BackendConfig,
    api_key: String,
    source: ScoreSource,
    timeout: Duration,
) -> Result<Box<dyn ScoringStrategy>> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    match backend.provider.as_str() {
        "gemini" => Ok(Box::new(gemini::GeminiStrategy::new(
            backend, api_key, source, client,
        ))),
        "chat" => Ok(Box::new(chat::ChatStrategy::new(
            backend, api_key, source, client,
        )?)),
        other => bail!("Unknown scoring provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::ZERO,
            call_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let p = RetryPolicy {
            max_retries: 3,
            backoff: Duration::from_millis(2000),
            call_timeout: Duration::from_secs(1),
        };
        assert_eq!(p.delay_for(1), Duration::from_millis(2000));
        assert_eq!(p.delay_for(2), Duration::from_millis(4000));
        assert_eq!(p.delay_for(3), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = policy(3)
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ScoreError::Transient("503".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(2)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ScoreError::Transient("429".to_string()))
            })
            .await;
        assert!(matches!(result, Err(ScoreError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_malformed_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = policy(3)
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ScoreError::from(MalformedResponseError::new("bad", "x")))
            })
            .await;
        assert!(matches!(result, Err(ScoreError::Malformed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        let p = RetryPolicy {
            max_retries: 0,
            backoff: Duration::ZERO,
            call_timeout: Duration::from_millis(10),
        };
        let result: Result<(), _> = p
            .run("test", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ScoreError::Timeout(_))));
    }

    #[test]
    fn test_status_classification() {
        let e = ScoreError::from_status("gemini", reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(e.is_retryable());
        let e = ScoreError::from_status("gemini", reqwest::StatusCode::BAD_GATEWAY, "");
        assert!(e.is_retryable());
        let e = ScoreError::from_status("gemini", reqwest::StatusCode::UNAUTHORIZED, "bad key");
        assert!(matches!(e, ScoreError::Rejected { status: 401, .. }));
    }

    #[test]
    fn test_verdict_requires_score() {
        assert!(verdict_from_text("```json\n{\"overall_score\": 85}\n```").is_ok());
        let err = verdict_from_text("{\"gaps\": []}").unwrap_err();
        assert!(matches!(err, ScoreError::Malformed(_)));
    }

    #[test]
    fn test_build_without_keys_fails() {
        let config = ScoringConfig {
            primary: Some(BackendConfig {
                provider: "gemini".to_string(),
                model: "m".to_string(),
                url: None,
                api_key_env: "PMATCH_TEST_UNSET_KEY_A".to_string(),
            }),
            fallback: None,
            ..ScoringConfig::default()
        };
        let err = build_strategies(&config).err().unwrap();
        assert!(err.to_string().contains("No scoring backend"));
    }

    #[test]
    fn test_exhausted_message_lists_failures() {
        let e = ScoreError::Exhausted(vec!["gemini: timed out".into(), "chat: 401".into()]);
        assert_eq!(
            e.to_string(),
            "all scoring backends failed: gemini: timed out; chat: 401"
        );
    }
}
