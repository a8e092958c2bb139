//! Persistent match results, match history and the project-list cache.
//!
//! `match_cache` holds at most one result per (candidate hash, project id).
//! `match_history` is append-only and also receives failed sentinel
//! results, which are never cached.

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::time::Duration;

use crate::models::{MatchResult, Project};

pub struct MatchCache {
    pool: SqlitePool,
    ttl: Option<Duration>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub cached_matches: i64,
    pub distinct_candidates: i64,
    pub history_rows: i64,
    pub failed_in_history: i64,
    pub project_lists: i64,
    pub project_embeddings: i64,
    pub text_embeddings: i64,
    pub oldest_match: Option<i64>,
    pub newest_match: Option<i64>,
}

impl MatchCache {
    /// `ttl = None` keeps entries forever.
    pub fn new(pool: SqlitePool, ttl: Option<Duration>) -> Self {
        Self { pool, ttl }
    }

    /// Stored result for the pair, tagged `cached = true`. Errors and
    /// expired or undecodable rows are misses.
    pub async fn lookup(&self, candidate_hash: &str, project_id: &str) -> Option<MatchResult> {
        let row = sqlx::query(
            "SELECT result_json, created_at FROM match_cache WHERE candidate_hash = ? AND project_id = ?",
        )
        .bind(candidate_hash)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await;

        let row = match row {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(error = %e, project_id, "match cache lookup failed");
                return None;
            }
        };

        let created_at: i64 = row.get("created_at");
        if let Some(ttl) = self.ttl {
            let age = Utc::now().timestamp() - created_at;
            if age >= ttl.as_secs() as i64 {
                tracing::debug!(project_id, age, "match cache entry expired");
                return None;
            }
        }

        let json: String = row.get("result_json");
        match serde_json::from_str::<MatchResult>(&json) {
            Ok(mut result) => {
                result.cached = true;
                Some(result)
            }
            Err(e) => {
                tracing::warn!(error = %e, project_id, "discarding undecodable cached match");
                None
            }
        }
    }

    /// Upserts the result for the pair.
    pub async fn save(&self, candidate_hash: &str, result: &MatchResult) -> Result<()> {
        let stored = MatchResult {
            cached: false,
            ..result.clone()
        };
        let json = serde_json::to_string(&stored)?;

        sqlx::query(
            r#"
            INSERT INTO match_cache (candidate_hash, project_id, score, source, result_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(candidate_hash, project_id) DO UPDATE SET
                score = excluded.score,
                source = excluded.source,
                result_json = excluded.result_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(candidate_hash)
        .bind(&result.project_id)
        .bind(result.overall_score as i64)
        .bind(result.source.as_str())
        .bind(json)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn record_history(&self, candidate_hash: &str, result: &MatchResult) -> Result<()> {
        let json = serde_json::to_string(result)?;

        sqlx::query(
            r#"
            INSERT INTO match_history (candidate_hash, project_id, score, source, error, result_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(candidate_hash)
        .bind(&result.project_id)
        .bind(result.overall_score as i64)
        .bind(result.source.as_str())
        .bind(result.error.as_deref())
        .bind(json)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent history rows for one candidate, newest first.
    pub async fn history(&self, candidate_hash: &str, limit: i64) -> Result<Vec<MatchResult>> {
        let rows = sqlx::query(
            "SELECT result_json FROM match_history WHERE candidate_hash = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(candidate_hash)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter_map(|r| serde_json::from_str(&r.get::<String, _>("result_json")).ok())
            .collect())
    }

    /// Empties the match cache, history and project-list cache. Vectors are
    /// kept. Returns rows removed from the match cache.
    pub async fn clear(&self) -> Result<u64> {
        let cleared = sqlx::query("DELETE FROM match_cache")
            .execute(&self.pool)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM match_history")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM project_cache")
            .execute(&self.pool)
            .await?;
        Ok(cleared)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM match_cache) AS cached_matches,
                (SELECT COUNT(DISTINCT candidate_hash) FROM match_cache) AS distinct_candidates,
                (SELECT COUNT(*) FROM match_history) AS history_rows,
                (SELECT COUNT(*) FROM match_history WHERE error IS NOT NULL) AS failed_in_history,
                (SELECT COUNT(*) FROM project_cache) AS project_lists,
                (SELECT COUNT(*) FROM project_embeddings) AS project_embeddings,
                (SELECT COUNT(*) FROM candidate_embeddings) AS text_embeddings,
                (SELECT MIN(created_at) FROM match_cache) AS oldest_match,
                (SELECT MAX(created_at) FROM match_cache) AS newest_match
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CacheStats {
            cached_matches: row.get("cached_matches"),
            distinct_candidates: row.get("distinct_candidates"),
            history_rows: row.get("history_rows"),
            failed_in_history: row.get("failed_in_history"),
            project_lists: row.get("project_lists"),
            project_embeddings: row.get("project_embeddings"),
            text_embeddings: row.get("text_embeddings"),
            oldest_match: row.get("oldest_match"),
            newest_match: row.get("newest_match"),
        })
    }
}

/// Normalized project lists keyed by the hash of their raw source.
pub struct ProjectCache {
    pool: SqlitePool,
}

impl ProjectCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, source_hash: &str) -> Option<Vec<Project>> {
        let json: Option<String> =
            match sqlx::query_scalar("SELECT projects_json FROM project_cache WHERE source_hash = ?")
                .bind(source_hash)
                .fetch_optional(&self.pool)
                .await
            {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(error = %e, "project cache lookup failed");
                    return None;
                }
            };

        json.and_then(|j| serde_json::from_str(&j).ok())
    }

    pub async fn put(&self, source_hash: &str, projects: &[Project]) -> Result<()> {
        let json = serde_json::to_string(projects)?;
        sqlx::query(
            r#"
            INSERT INTO project_cache (source_hash, projects_json, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source_hash) DO UPDATE SET
                projects_json = excluded.projects_json,
                created_at = excluded.created_at
            "#,
        )
        .bind(source_hash)
        .bind(json)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use crate::models::{ScoreSource, Verdict};
    use tempfile::TempDir;

    async fn pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect_path(&dir.path().join("test.sqlite")).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        (dir, pool)
    }

    fn project(id: &str) -> Project {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "title": "Data pipeline",
            "description": "ETL work"
        }))
        .unwrap()
    }

    fn result(id: &str, score: u8) -> MatchResult {
        let verdict = Verdict {
            overall_score: Some(score),
            matching_points: vec!["SQL".to_string()],
            ..Verdict::default()
        };
        MatchResult::from_verdict(verdict, score, &project(id), ScoreSource::Primary)
    }

    #[tokio::test]
    async fn test_upsert_keeps_one_row_per_pair() {
        let (_dir, pool) = pool().await;
        let cache = MatchCache::new(pool.clone(), None);

        cache.save("cand", &result("p1", 40)).await.unwrap();
        cache.save("cand", &result("p1", 90)).await.unwrap();

        let hit = cache.lookup("cand", "p1").await.unwrap();
        assert_eq!(hit.overall_score, 90);
        assert!(hit.cached);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM match_cache")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let (_dir, pool) = pool().await;
        let cache = MatchCache::new(pool.clone(), Some(Duration::from_secs(0)));
        cache.save("cand", &result("p1", 70)).await.unwrap();
        assert!(cache.lookup("cand", "p1").await.is_none());

        let forever = MatchCache::new(pool, None);
        assert!(forever.lookup("cand", "p1").await.is_some());
    }

    #[tokio::test]
    async fn test_history_and_stats() {
        let (_dir, pool) = pool().await;
        let cache = MatchCache::new(pool, None);
        let ok = result("p1", 70);
        let failed = MatchResult::failed(&project("p2"), "backends down");

        cache.save("cand", &ok).await.unwrap();
        cache.record_history("cand", &ok).await.unwrap();
        cache.record_history("cand", &failed).await.unwrap();

        let history = cache.history("cand", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].project_id, "p2");

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.cached_matches, 1);
        assert_eq!(stats.history_rows, 2);
        assert_eq!(stats.failed_in_history, 1);
        assert!(stats.oldest_match.is_some());

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.lookup("cand", "p1").await.is_none());
        assert_eq!(cache.stats().await.unwrap().history_rows, 0);
    }

    #[tokio::test]
    async fn test_project_cache_roundtrip() {
        let (_dir, pool) = pool().await;
        let cache = ProjectCache::new(pool);
        assert!(cache.get("src").await.is_none());

        cache.put("src", &[project("p1")]).await.unwrap();
        let projects = cache.get("src").await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, "p1");
    }
}
