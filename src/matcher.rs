//! Hybrid matching: optional embedding prefilter, then cache-first scoring
//! of the survivors, paced to stay inside the scoring backends' rate limits.

use serde::Serialize;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::MatchingConfig;
use crate::index::EmbeddingIndex;
use crate::models::{CandidateProfile, MatchResult, Project};
use crate::scoring::Scorer;

/// Per-run knobs, defaulted from `[matching]` and overridable from the CLI.
#[derive(Debug, Clone)]
pub struct MatchOptions {
    pub min_score: u8,
    pub hybrid: bool,
    pub top_k: usize,
    pub min_similarity: f32,
    /// Pause after this many fresh backend calls; 0 disables pacing.
    pub pace_every: usize,
    pub pace_interval: Duration,
}

impl From<&MatchingConfig> for MatchOptions {
    fn from(config: &MatchingConfig) -> Self {
        Self {
            min_score: config.min_score,
            hybrid: config.hybrid,
            top_k: config.top_k,
            min_similarity: config.min_similarity,
            pace_every: config.pace_every,
            pace_interval: config.pace_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MatchMetrics {
    pub total_projects: usize,
    /// Projects left after prefiltering.
    pub candidates: usize,
    pub api_calls: usize,
    pub cache_hits: usize,
    pub elapsed_ms: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchReport {
    pub matches: Vec<MatchResult>,
    pub metrics: MatchMetrics,
}

pub struct Matcher {
    scorer: Scorer,
    index: Option<EmbeddingIndex>,
}

impl Matcher {
    /// `index = None` always scores the full list.
    pub fn new(scorer: Scorer, index: Option<EmbeddingIndex>) -> Self {
        Self { scorer, index }
    }

    /// Ranks `projects` for `candidate`. Results at or above
    /// `options.min_score` are kept, as are failed results; the list is
    /// sorted by score, descending, ties in scoring order.
    ///
    /// Cancellation is checked before each project and interrupts pacing
    /// pauses; a cancelled run returns what it has with `cancelled = true`.
    pub async fn run(
        &self,
        candidate: &CandidateProfile,
        projects: Vec<Project>,
        options: &MatchOptions,
        cancel: &CancellationToken,
    ) -> MatchReport {
        let started = Instant::now();
        let candidate_hash = candidate.content_hash();
        let mut metrics = MatchMetrics {
            total_projects: projects.len(),
            ..MatchMetrics::default()
        };

        let pool = match (&self.index, options.hybrid) {
            (Some(index), true) => {
                index
                    .prefilter(
                        &candidate.embedding_text(),
                        projects,
                        options.top_k,
                        options.min_similarity,
                    )
                    .await
            }
            _ => projects,
        };
        metrics.candidates = pool.len();

        tracing::info!(
            total = metrics.total_projects,
            candidates = metrics.candidates,
            hybrid = options.hybrid && self.index.is_some(),
            "matching started"
        );

        let mut matches = Vec::new();

        for (position, project) in pool.iter().enumerate() {
            if cancel.is_cancelled() {
                metrics.cancelled = true;
                break;
            }

            let result = self.scorer.score(candidate, &candidate_hash, project).await;

            if result.cached {
                metrics.cache_hits += 1;
            } else {
                metrics.api_calls += 1;
            }

            let fresh = !result.cached;
            if result.overall_score >= options.min_score || result.is_error() {
                matches.push(result);
            }

            let is_last = position + 1 == pool.len();
            if fresh
                && !is_last
                && options.pace_every > 0
                && metrics.api_calls % options.pace_every == 0
                && !options.pace_interval.is_zero()
            {
                tracing::debug!(api_calls = metrics.api_calls, "pacing scoring calls");
                tokio::select! {
                    _ = cancel.cancelled() => {
                        metrics.cancelled = true;
                        break;
                    }
                    _ = tokio::time::sleep(options.pace_interval) => {}
                }
            }
        }

        // Stable: equal scores keep scoring order.
        matches.sort_by(|a, b| b.overall_score.cmp(&a.overall_score));
        metrics.elapsed_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            matches = matches.len(),
            api_calls = metrics.api_calls,
            cache_hits = metrics.cache_hits,
            elapsed_ms = metrics.elapsed_ms,
            cancelled = metrics.cancelled,
            "matching finished"
        );

        MatchReport { matches, metrics }
    }
}
