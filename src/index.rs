//! Cached vectorization and similarity prefiltering.
//!
//! Vectors are keyed by the SHA-256 of the text they represent and tagged
//! with the backend's model name, so switching models never serves a vector
//! from the wrong space. Text vectors live in `candidate_embeddings` and are
//! write-once. Project vectors live in `project_embeddings`, keyed by
//! project id, and are reused only while the project's content hash is
//! unchanged.
//!
//! The cache never makes an operation fail: read errors count as misses and
//! write errors are logged and skipped.

use anyhow::{bail, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingBackend};
use crate::hashing::hash_text;
use crate::models::Project;

pub struct EmbeddingIndex {
    pool: SqlitePool,
    backend: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
}

impl EmbeddingIndex {
    pub fn new(pool: SqlitePool, backend: Arc<dyn EmbeddingBackend>, batch_size: usize) -> Self {
        Self {
            pool,
            backend,
            batch_size: batch_size.max(1),
        }
    }

    pub fn model_name(&self) -> &str {
        self.backend.model_name()
    }

    /// Vector for `text`, computed at most once per (content, model).
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))
    }

    /// Vectors for `texts` in input order. Only cache misses reach the
    /// backend, de-duplicated by content and chunked by batch size.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = self.backend.model_name().to_string();
        let hashes: Vec<String> = texts.iter().map(|t| hash_text(t)).collect();

        let mut known: HashMap<String, Vec<f32>> = HashMap::new();
        let mut misses: Vec<(String, String)> = Vec::new();

        for (text, hash) in texts.iter().zip(&hashes) {
            if known.contains_key(hash) || misses.iter().any(|(h, _)| h == hash) {
                continue;
            }
            match self.load_text_vector(hash, &model).await {
                Some(vec) => {
                    known.insert(hash.clone(), vec);
                }
                None => misses.push((hash.clone(), text.clone())),
            }
        }

        if !misses.is_empty() {
            tracing::debug!(misses = misses.len(), hits = known.len(), "embedding texts");
        }

        for batch in misses.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self.call_backend(&inputs).await?;

            for ((hash, _), vec) in batch.iter().zip(vectors) {
                self.store_text_vector(hash, &model, &vec).await;
                known.insert(hash.clone(), vec);
            }
        }

        hashes
            .iter()
            .map(|h| {
                known
                    .get(h)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Missing embedding for content {}", h))
            })
            .collect()
    }

    /// Vectors for each project keyed by project id.
    pub async fn embed_projects(&self, projects: &[Project]) -> Result<HashMap<String, Vec<f32>>> {
        let model = self.backend.model_name().to_string();
        let mut out: HashMap<String, Vec<f32>> = HashMap::with_capacity(projects.len());
        let mut misses: Vec<(&Project, String)> = Vec::new();

        for project in projects {
            if out.contains_key(&project.id) {
                continue;
            }
            let content_hash = hash_text(&project.embedding_text());
            match self
                .load_project_vector(&project.id, &content_hash, &model)
                .await
            {
                Some(vec) => {
                    out.insert(project.id.clone(), vec);
                }
                None => misses.push((project, content_hash)),
            }
        }

        for batch in misses.chunks(self.batch_size) {
            let inputs: Vec<String> = batch.iter().map(|(p, _)| p.embedding_text()).collect();
            let vectors = self.call_backend(&inputs).await?;

            for ((project, content_hash), vec) in batch.iter().zip(vectors) {
                self.store_project_vector(&project.id, content_hash, &model, &vec)
                    .await;
                out.insert(project.id.clone(), vec);
            }
        }

        Ok(out)
    }

    /// Cosine similarity; 0.0 for empty, mismatched or zero-norm vectors.
    pub fn similarity(a: &[f32], b: &[f32]) -> f32 {
        cosine_similarity(a, b)
    }

    /// Narrows `projects` to the `top_k` most similar to `candidate_text`
    /// with similarity at least `min_similarity`, best first, with the
    /// score attached. Ties keep input order.
    ///
    /// Fails open: if vectors cannot be produced the input list is returned
    /// unchanged.
    pub async fn prefilter(
        &self,
        candidate_text: &str,
        projects: Vec<Project>,
        top_k: usize,
        min_similarity: f32,
    ) -> Vec<Project> {
        if projects.is_empty() {
            return projects;
        }

        let ranked = match self.rank(candidate_text, &projects).await {
            Ok(ranked) => ranked,
            Err(e) => {
                tracing::warn!(error = %e, "prefilter unavailable, scoring all projects");
                return projects;
            }
        };

        let total = projects.len();
        let mut slots: Vec<Option<Project>> = projects.into_iter().map(Some).collect();
        let kept: Vec<Project> = ranked
            .into_iter()
            .filter(|(_, sim)| *sim >= min_similarity)
            .take(top_k)
            .filter_map(|(idx, sim)| {
                slots[idx].take().map(|mut p| {
                    p.similarity = Some(sim);
                    p
                })
            })
            .collect();

        tracing::info!(total, kept = kept.len(), top_k, min_similarity, "prefilter complete");
        kept
    }

    /// (input index, similarity), sorted descending and stable.
    async fn rank(&self, candidate_text: &str, projects: &[Project]) -> Result<Vec<(usize, f32)>> {
        let candidate = self.embed(candidate_text).await?;
        let vectors = self.embed_projects(projects).await?;

        let mut ranked: Vec<(usize, f32)> = projects
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let sim = vectors
                    .get(&p.id)
                    .map(|v| cosine_similarity(&candidate, v))
                    .unwrap_or(0.0);
                (i, sim)
            })
            .collect();

        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        Ok(ranked)
    }

    async fn call_backend(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = self.backend.embed(inputs).await?;
        if vectors.len() != inputs.len() {
            bail!(
                "Embedding backend returned {} vectors for {} inputs",
                vectors.len(),
                inputs.len()
            );
        }
        Ok(vectors)
    }

    async fn load_text_vector(&self, hash: &str, model: &str) -> Option<Vec<f32>> {
        let row = sqlx::query(
            "SELECT embedding FROM candidate_embeddings WHERE content_hash = ? AND model = ?",
        )
        .bind(hash)
        .bind(model)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(row) => row.map(|r| blob_to_vec(&r.get::<Vec<u8>, _>("embedding"))),
            Err(e) => {
                tracing::warn!(error = %e, "embedding cache read failed");
                None
            }
        }
    }

    async fn store_text_vector(&self, hash: &str, model: &str, vec: &[f32]) {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO candidate_embeddings (content_hash, model, dims, embedding, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(hash)
        .bind(model)
        .bind(vec.len() as i64)
        .bind(vec_to_blob(vec))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to cache embedding");
        }
    }

    async fn load_project_vector(
        &self,
        project_id: &str,
        content_hash: &str,
        model: &str,
    ) -> Option<Vec<f32>> {
        let row = sqlx::query(
            "SELECT content_hash, model, embedding FROM project_embeddings WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some(r)) => {
                let stored_hash: String = r.get("content_hash");
                let stored_model: String = r.get("model");
                if stored_hash == content_hash && stored_model == model {
                    Some(blob_to_vec(&r.get::<Vec<u8>, _>("embedding")))
                } else {
                    None
                }
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, project_id, "project embedding read failed");
                None
            }
        }
    }

    async fn store_project_vector(
        &self,
        project_id: &str,
        content_hash: &str,
        model: &str,
        vec: &[f32],
    ) {
        let result = sqlx::query(
            r#"
            INSERT INTO project_embeddings (project_id, content_hash, model, dims, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_id) DO UPDATE SET
                content_hash = excluded.content_hash,
                model = excluded.model,
                dims = excluded.dims,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(project_id)
        .bind(content_hash)
        .bind(model)
        .bind(vec.len() as i64)
        .bind(vec_to_blob(vec))
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            tracing::warn!(error = %e, project_id, "failed to cache project embedding");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tempfile::TempDir;

    /// Two-dimensional toy space: texts mentioning rust point one way.
    struct AxisBackend {
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingBackend for AxisBackend {
        fn model_name(&self) -> &str {
            "axis"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.texts.fetch_add(texts.len(), AtomicOrdering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    if t.to_lowercase().contains("rust") {
                        vec![1.0, 0.0]
                    } else {
                        vec![0.0, 1.0]
                    }
                })
                .collect())
        }
    }

    async fn index() -> (TempDir, EmbeddingIndex, Arc<AxisBackend>) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect_path(&dir.path().join("test.sqlite")).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let backend = Arc::new(AxisBackend {
            calls: AtomicUsize::new(0),
            texts: AtomicUsize::new(0),
        });
        let index = EmbeddingIndex::new(pool, backend.clone(), 2);
        (dir, index, backend)
    }

    fn project(title: &str) -> Project {
        Project {
            id: Project::derive_id(title, None, "desc"),
            title: title.to_string(),
            description: "desc".to_string(),
            company: None,
            technologies: Vec::new(),
            domain: None,
            supervisor: None,
            email: None,
            reference_id: None,
            application_method: Default::default(),
            application_link: None,
            note: None,
            similarity: None,
        }
    }

    #[tokio::test]
    async fn test_batch_dedups_and_chunks_misses() {
        let (_dir, index, backend) = index().await;
        let texts: Vec<String> = ["a", "b", "a", "c", "rust"].iter().map(|s| s.to_string()).collect();

        let vectors = index.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors.len(), 5);
        assert_eq!(vectors[0], vectors[2]);
        assert_eq!(vectors[4], vec![1.0, 0.0]);
        // 4 distinct texts, batch size 2
        assert_eq!(backend.texts.load(AtomicOrdering::SeqCst), 4);
        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 2);

        index.embed_batch(&texts).await.unwrap();
        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_project_vector_recomputed_when_content_changes() {
        let (_dir, index, backend) = index().await;
        let mut p = project("Rust API");

        index.embed_projects(std::slice::from_ref(&p)).await.unwrap();
        index.embed_projects(std::slice::from_ref(&p)).await.unwrap();
        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 1);

        // Same id, different text
        p.technologies = vec!["Go".to_string()];
        index.embed_projects(std::slice::from_ref(&p)).await.unwrap();
        assert_eq!(backend.calls.load(AtomicOrdering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_prefilter_ranks_and_truncates() {
        let (_dir, index, _backend) = index().await;
        let projects = vec![project("Web design"), project("Rust backend"), project("Rust CLI")];

        let kept = index.prefilter("rust developer", projects, 5, 0.5).await;
        let titles: Vec<&str> = kept.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, vec!["Rust backend", "Rust CLI"]);
        assert!(kept.iter().all(|p| p.similarity.unwrap() >= 0.5));

        let projects = vec![project("Web design"), project("Rust backend"), project("Rust CLI")];
        let kept = index.prefilter("rust developer", projects, 1, -1.0).await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].title, "Rust backend");
    }

    #[test]
    fn test_similarity_delegates_to_cosine() {
        assert_eq!(EmbeddingIndex::similarity(&[1.0, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(EmbeddingIndex::similarity(&[], &[]), 0.0);
    }
}
