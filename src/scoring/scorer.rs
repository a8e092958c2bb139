use std::time::Duration;

use super::{RetryPolicy, ScoreError, ScoringStrategy};
use crate::cache::MatchCache;
use crate::config::ScoringConfig;
use crate::models::{CandidateProfile, MatchResult, Project};

/// Cache-first scorer walking an ordered chain of strategies.
pub struct Scorer {
    strategies: Vec<Box<dyn ScoringStrategy>>,
    cache: MatchCache,
    policy: RetryPolicy,
    deadline: Duration,
}

impl Scorer {
    pub fn new(
        strategies: Vec<Box<dyn ScoringStrategy>>,
        cache: MatchCache,
        config: &ScoringConfig,
    ) -> Self {
        Self::with_policy(
            strategies,
            cache,
            RetryPolicy::from_config(config),
            config.deadline(),
        )
    }

    /// `deadline` bounds one strategy including all of its retries.
    pub fn with_policy(
        strategies: Vec<Box<dyn ScoringStrategy>>,
        cache: MatchCache,
        policy: RetryPolicy,
        deadline: Duration,
    ) -> Self {
        Self {
            strategies,
            cache,
            policy,
            deadline,
        }
    }

    pub fn cache(&self) -> &MatchCache {
        &self.cache
    }

    /// Scores one pair. Never fails: when every strategy is exhausted the
    /// result is a score-0 sentinel carrying the reasons.
    pub async fn score(
        &self,
        candidate: &CandidateProfile,
        candidate_hash: &str,
        project: &Project,
    ) -> MatchResult {
        if let Some(mut hit) = self.cache.lookup(candidate_hash, &project.id).await {
            tracing::debug!(project_id = %project.id, "match cache hit");
            // The id does not cover contact fields; report the current ones.
            hit.application_link = project.application_link.clone();
            hit.email = project.email.clone();
            hit.reference_id = project.reference_id.clone();
            if project.similarity.is_some() {
                hit.similarity = project.similarity;
            }
            return hit;
        }

        let mut failures = Vec::new();

        for strategy in &self.strategies {
            let attempt = tokio::time::timeout(
                self.deadline,
                self.policy
                    .run(strategy.name(), || strategy.score(candidate, project)),
            )
            .await;

            let outcome = match attempt {
                Ok(outcome) => outcome,
                Err(_) => Err(ScoreError::Timeout(self.deadline)),
            };

            match outcome {
                Ok(verdict) => {
                    let score = verdict.overall_score.unwrap_or_default();
                    let result =
                        MatchResult::from_verdict(verdict, score, project, strategy.source());

                    if let Err(e) = self.cache.save(candidate_hash, &result).await {
                        tracing::warn!(error = %e, project_id = %project.id, "failed to cache match");
                    }
                    self.log_history(candidate_hash, &result).await;

                    tracing::info!(
                        project_id = %project.id,
                        score,
                        backend = strategy.name(),
                        "scored project"
                    );
                    return result;
                }
                Err(e) => {
                    tracing::warn!(
                        project_id = %project.id,
                        backend = strategy.name(),
                        error = %e,
                        "scoring backend failed"
                    );
                    failures.push(format!("{}: {}", strategy.name(), e));
                }
            }
        }

        let exhausted = ScoreError::Exhausted(failures);
        let result = MatchResult::failed(project, exhausted.to_string());
        self.log_history(candidate_hash, &result).await;
        result
    }

    async fn log_history(&self, candidate_hash: &str, result: &MatchResult) {
        if let Err(e) = self.cache.record_history(candidate_hash, result).await {
            tracing::warn!(error = %e, project_id = %result.project_id, "failed to record match history");
        }
    }
}
