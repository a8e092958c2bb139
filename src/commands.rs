//! Command handlers behind the `pmatch` binary.
//!
//! Each handler opens its own pool from the config, does one job, and
//! prints a short human-readable summary (or JSON) to stdout.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use sqlx::SqlitePool;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use crate::cache::{MatchCache, ProjectCache};
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::hashing::hash_bytes;
use crate::index::EmbeddingIndex;
use crate::matcher::{MatchOptions, MatchReport, Matcher};
use crate::migrate;
use crate::models::{CandidateProfile, DocumentKind, Project, RawProject};
use crate::normalize::Normalizer;
use crate::scoring::{self, Scorer};
use crate::store::ContentStore;

async fn open(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(pool)
}

// ============ store ============

pub async fn run_store_save(config: &Config, file: &Path, kind: DocumentKind) -> Result<()> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload".to_string());

    let pool = open(config).await?;
    let store = ContentStore::new(pool.clone(), config.storage.root.clone());
    let id = store.save(&bytes, &name, kind).await?;

    println!("store save");
    println!("  id: {}", id);
    println!("  hash: {}", hash_bytes(&bytes));

    pool.close().await;
    Ok(())
}

pub async fn run_store_path(config: &Config, id: i64) -> Result<()> {
    let pool = open(config).await?;
    let store = ContentStore::new(pool.clone(), config.storage.root.clone());
    let path = store.get_path(id).await?;
    pool.close().await;

    match path {
        Some(path) => {
            println!("{}", path.display());
            Ok(())
        }
        None => bail!("No document with id {}", id),
    }
}

pub async fn run_store_delete(config: &Config, id: i64) -> Result<()> {
    let pool = open(config).await?;
    let store = ContentStore::new(pool.clone(), config.storage.root.clone());
    let deleted = store.delete(id).await?;
    pool.close().await;

    if !deleted {
        bail!("No document with id {}", id);
    }
    println!("Deleted record {} (bytes kept until `store sweep`).", id);
    Ok(())
}

pub async fn run_store_sweep(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    let store = ContentStore::new(pool.clone(), config.storage.root.clone());
    let removed = store.sweep_orphans().await?;
    pool.close().await;

    println!("store sweep");
    println!("  orphans removed: {}", removed);
    Ok(())
}

// ============ normalize ============

/// Accepts a bare array of projects or an object with a `projects` array.
pub fn parse_raw_projects(bytes: &[u8]) -> Result<Vec<RawProject>> {
    let value: Value = serde_json::from_slice(bytes).context("Project file is not valid JSON")?;
    let list = match value {
        Value::Array(_) => value,
        Value::Object(mut map) => match map.remove("projects") {
            Some(list @ Value::Array(_)) => list,
            _ => bail!("Project file must be an array or an object with a 'projects' array"),
        },
        _ => bail!("Project file must be an array or an object with a 'projects' array"),
    };
    Ok(serde_json::from_value(list)?)
}

/// Normalized projects for a raw source file, served from the project-list
/// cache when the file's bytes have been seen before.
pub async fn load_projects(pool: &SqlitePool, file: &Path, use_cache: bool) -> Result<Vec<Project>> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let source_hash = hash_bytes(&bytes);
    let cache = ProjectCache::new(pool.clone());

    if use_cache {
        if let Some(projects) = cache.get(&source_hash).await {
            tracing::info!(count = projects.len(), "project list served from cache");
            return Ok(projects);
        }
    }

    let raw = parse_raw_projects(&bytes)?;
    let (projects, _stats) = Normalizer::new()?.normalize(raw);

    if let Err(e) = cache.put(&source_hash, &projects).await {
        tracing::warn!(error = %e, "failed to cache normalized projects");
    }
    Ok(projects)
}

pub async fn run_normalize(config: &Config, file: &Path, no_cache: bool) -> Result<()> {
    let pool = open(config).await?;
    let projects = load_projects(&pool, file, !no_cache).await?;
    pool.close().await;

    println!("{}", serde_json::to_string_pretty(&projects)?);
    Ok(())
}

// ============ match ============

pub struct MatchArgs<'a> {
    pub candidate: &'a Path,
    pub projects: &'a Path,
    pub min_score: Option<u8>,
    pub no_hybrid: bool,
    pub top_k: Option<usize>,
    pub json: bool,
}

pub async fn run_match(config: &Config, args: MatchArgs<'_>, cancel: CancellationToken) -> Result<()> {
    let candidate_bytes = std::fs::read(args.candidate)
        .with_context(|| format!("Failed to read {}", args.candidate.display()))?;
    let candidate: CandidateProfile =
        serde_json::from_slice(&candidate_bytes).context("Candidate file is not a valid profile")?;

    // Configuration problems abort before any scoring starts.
    let strategies = scoring::build_strategies(&config.scoring)?;

    let pool = open(config).await?;
    let projects = load_projects(&pool, args.projects, true).await?;

    let index = if config.embedding.is_enabled() {
        let backend = embedding::create_backend(&config.embedding)?;
        Some(EmbeddingIndex::new(
            pool.clone(),
            backend,
            config.embedding.batch_size,
        ))
    } else {
        None
    };

    let cache = MatchCache::new(pool.clone(), config.matching.cache_ttl());
    let scorer = Scorer::new(strategies, cache, &config.scoring);
    let matcher = Matcher::new(scorer, index);

    let mut options = MatchOptions::from(&config.matching);
    if let Some(min_score) = args.min_score {
        options.min_score = min_score.min(100);
    }
    if let Some(top_k) = args.top_k {
        options.top_k = top_k.max(1);
    }
    if args.no_hybrid {
        options.hybrid = false;
    }

    let report = matcher.run(&candidate, projects, &options, &cancel).await;
    pool.close().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &MatchReport) {
    let m = &report.metrics;
    println!("match");
    println!("  projects: {} (scored: {})", m.total_projects, m.candidates);
    println!("  api calls: {}", m.api_calls);
    println!("  cache hits: {}", m.cache_hits);
    println!("  elapsed: {} ms", m.elapsed_ms);
    if m.cancelled {
        println!("  cancelled: results are partial");
    }

    if report.matches.is_empty() {
        println!();
        println!("No matches above threshold.");
        return;
    }

    println!();
    for (i, r) in report.matches.iter().enumerate() {
        let company = r.company.as_deref().unwrap_or("-");
        match &r.error {
            Some(err) => println!("{}. [error] {} ({}): {}", i + 1, r.project_title, company, err),
            None => println!(
                "{}. [{:>3}] {} ({}) {} via {}{}",
                i + 1,
                r.overall_score,
                r.project_title,
                company,
                r.recommendation.as_str(),
                r.source.as_str(),
                if r.cached { ", cached" } else { "" }
            ),
        }
        if let Some(link) = &r.application_link {
            println!("     apply: {}", link);
        } else if let Some(email) = &r.email {
            println!("     contact: {}", email);
        }
    }
}

// ============ cache ============

pub async fn run_cache_stats(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    let stats = MatchCache::new(pool.clone(), None).stats().await?;
    pool.close().await;

    println!("cache stats");
    println!("  cached matches: {}", stats.cached_matches);
    println!("  candidates: {}", stats.distinct_candidates);
    println!("  history rows: {} ({} failed)", stats.history_rows, stats.failed_in_history);
    println!("  project lists: {}", stats.project_lists);
    println!("  project vectors: {}", stats.project_embeddings);
    println!("  text vectors: {}", stats.text_embeddings);
    if let (Some(oldest), Some(newest)) = (stats.oldest_match, stats.newest_match) {
        println!("  oldest match: {}", format_ts(oldest));
        println!("  newest match: {}", format_ts(newest));
    }
    Ok(())
}

pub async fn run_cache_clear(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    let cleared = MatchCache::new(pool.clone(), None).clear().await?;
    pool.close().await;

    println!("cache clear");
    println!("  matches removed: {}", cleared);
    Ok(())
}

fn format_ts(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|d| d.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_raw_projects_shapes() {
        let list = parse_raw_projects(br#"[{"title": "A", "description": "a"}]"#).unwrap();
        assert_eq!(list.len(), 1);

        let wrapped =
            parse_raw_projects(br#"{"projects": [{"title": "A"}, {"title": "B"}]}"#).unwrap();
        assert_eq!(wrapped.len(), 2);

        assert!(parse_raw_projects(br#"{"items": []}"#).is_err());
        assert!(parse_raw_projects(b"not json").is_err());
    }
}
