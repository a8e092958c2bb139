//! Content-addressed storage for uploaded source files.
//!
//! Bytes live in a sharded arena under `storage.root`
//! (`ab/cd/abcd…<ext>`, keyed by SHA-256); the `documents` table is the
//! logical index over it. Identical bytes uploaded under any number of
//! names share one file and one record.
//!
//! Deleting a record never touches the arena. [`ContentStore::sweep_orphans`]
//! reconciles the two afterwards by path.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use crate::hashing::hash_bytes;
use crate::models::{DocumentKind, StoredDocument};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_JSON: &str = "application/json";
pub const MIME_TEXT: &str = "text/plain";

/// Temp files younger than this may belong to a save in progress.
pub const TMP_GRACE: Duration = Duration::from_secs(600);

const TMP_PREFIX: &str = ".tmp-";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct ContentStore {
    pool: SqlitePool,
    root: PathBuf,
}

impl ContentStore {
    pub fn new(pool: SqlitePool, root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stores `bytes` and returns the id of its record.
    ///
    /// If the hash is already known the existing id is returned and nothing
    /// is written. Otherwise the file is written to a temp name, flushed and
    /// renamed into place before the record is inserted, so a committed
    /// record never points at a partial file.
    pub async fn save(&self, bytes: &[u8], original_name: &str, kind: DocumentKind) -> Result<i64> {
        let hash = hash_bytes(bytes);

        if let Some(id) = self.find_by_hash(&hash).await? {
            tracing::debug!(hash = %hash, id, "content already stored");
            return Ok(id);
        }

        let ext = extension_of(original_name);
        let path = self.shard_path(&hash, &ext);
        self.write_atomically(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;

        sqlx::query(
            r#"
            INSERT INTO documents (hash, original_name, path, size, mime, logical_type, uploaded_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(hash) DO NOTHING
            "#,
        )
        .bind(&hash)
        .bind(original_name)
        .bind(path.to_string_lossy().to_string())
        .bind(bytes.len() as i64)
        .bind(mime_for_extension(&ext))
        .bind(kind.as_str())
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        // A concurrent writer may have won the insert; either way the row exists now.
        let id = self
            .find_by_hash(&hash)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Document record for {} vanished after insert", hash))?;

        tracing::info!(hash = %hash, id, name = original_name, "stored document");
        Ok(id)
    }

    pub async fn get(&self, id: i64) -> Result<Option<StoredDocument>> {
        let row = sqlx::query(
            r#"
            SELECT id, hash, original_name, path, size, mime, logical_type, uploaded_at
            FROM documents WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let logical_type: String = row.get("logical_type");
        Ok(Some(StoredDocument {
            id: row.get("id"),
            hash: row.get("hash"),
            original_name: row.get("original_name"),
            path: row.get("path"),
            size: row.get("size"),
            mime: row.get("mime"),
            logical_type: logical_type.parse().unwrap_or_default(),
            uploaded_at: row.get("uploaded_at"),
        }))
    }

    pub async fn get_path(&self, id: i64) -> Result<Option<PathBuf>> {
        let path: Option<String> = sqlx::query_scalar("SELECT path FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(path.map(PathBuf::from))
    }

    /// Removes the logical record only. Returns whether a record existed.
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes arena files no record points at. Returns how many were removed.
    ///
    /// Files are matched by full file name, so a stale copy of known bytes
    /// under another extension is an orphan too. Temp files of writes younger than
    /// [`TMP_GRACE`] are left alone; older ones are leftovers of interrupted
    /// saves and are removed.
    pub async fn sweep_orphans(&self) -> Result<usize> {
        if !self.root.exists() {
            return Ok(0);
        }

        // `<hash><ext>` is unique in the arena, so file names identify
        // records even if the root was spelled differently when saved.
        let known: HashSet<String> = sqlx::query_scalar::<_, String>("SELECT path FROM documents")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .filter_map(|p| Path::new(p).file_name())
            .map(|n| n.to_string_lossy().to_string())
            .collect();

        let mut removed = 0usize;
        for entry in WalkDir::new(&self.root) {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy();
            if !entry.file_type().is_file() || known.contains(name.as_ref()) {
                continue;
            }

            if name.starts_with(TMP_PREFIX) && is_recent(&entry) {
                tracing::debug!(path = %entry.path().display(), "skipping in-flight temp file");
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    tracing::debug!(path = %entry.path().display(), "removed orphan");
                    removed += 1;
                }
                Err(e) => {
                    tracing::warn!(path = %entry.path().display(), error = %e, "failed to remove orphan");
                }
            }
        }

        tracing::info!(removed, "orphan sweep complete");
        Ok(removed)
    }

    async fn find_by_hash(&self, hash: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM documents WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    fn shard_path(&self, hash: &str, ext: &str) -> PathBuf {
        self.root
            .join(&hash[..2])
            .join(&hash[2..4])
            .join(format!("{}{}", hash, ext))
    }

    async fn write_atomically(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Storage path has no parent: {}", path.display()))?;
        tokio::fs::create_dir_all(dir).await?;

        let tmp = dir.join(format!(
            "{}{}-{}",
            TMP_PREFIX,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await?;
            Ok::<_, std::io::Error>(())
        }
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp).await;
        }
        Ok(result?)
    }
}

/// Unreadable timestamps count as recent.
fn is_recent(entry: &walkdir::DirEntry) -> bool {
    entry
        .metadata()
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .map_or(true, |age| age < TMP_GRACE)
}

/// Lowercased extension including the dot, or empty.
fn extension_of(name: &str) -> String {
    Path::new(name)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

fn mime_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        ".pdf" => Some(MIME_PDF),
        ".docx" => Some(MIME_DOCX),
        ".json" => Some(MIME_JSON),
        ".txt" | ".md" => Some(MIME_TEXT),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::migrate;
    use tempfile::TempDir;

    async fn store() -> (TempDir, ContentStore) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect_path(&dir.path().join("test.sqlite")).await.unwrap();
        migrate::migrate_pool(&pool).await.unwrap();
        let store = ContentStore::new(pool, dir.path().join("storage"));
        (dir, store)
    }

    fn count_files(root: &Path) -> usize {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn test_extension_and_mime() {
        assert_eq!(extension_of("CV.PDF"), ".pdf");
        assert_eq!(extension_of("noext"), "");
        assert_eq!(mime_for_extension(".pdf"), Some(MIME_PDF));
        assert_eq!(mime_for_extension(".bin"), None);
    }

    #[tokio::test]
    async fn test_identical_bytes_share_one_record_and_file() {
        let (_dir, store) = store().await;
        let a = store.save(b"ABC", "first.pdf", DocumentKind::Cv).await.unwrap();
        let b = store
            .save(b"ABC", "renamed.pdf", DocumentKind::Other)
            .await
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(count_files(store.root()), 1);

        let doc = store.get(a).await.unwrap().unwrap();
        assert_eq!(doc.original_name, "first.pdf");
        assert_eq!(doc.size, 3);
        assert_eq!(doc.mime.as_deref(), Some(MIME_PDF));
        assert_eq!(doc.logical_type, DocumentKind::Cv);
        assert!(doc.path.ends_with(&format!("{}.pdf", doc.hash)));
        assert!(doc.path.contains(&format!("{}", &doc.hash[..2])));
    }

    #[tokio::test]
    async fn test_delete_keeps_shared_bytes_until_sweep() {
        let (_dir, store) = store().await;
        let keep = store.save(b"keep", "a.txt", DocumentKind::Other).await.unwrap();
        let gone = store.save(b"gone", "b.txt", DocumentKind::Other).await.unwrap();
        let gone_path = store.get_path(gone).await.unwrap().unwrap();

        assert!(store.delete(gone).await.unwrap());
        assert!(!store.delete(gone).await.unwrap());
        assert!(gone_path.exists());
        assert!(store.get(gone).await.unwrap().is_none());

        let removed = store.sweep_orphans().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!gone_path.exists());
        assert!(store.get_path(keep).await.unwrap().unwrap().exists());
    }

    #[tokio::test]
    async fn test_resave_under_new_extension_leaves_one_file() {
        let (_dir, store) = store().await;
        let first = store.save(b"ABC", "a.pdf", DocumentKind::Cv).await.unwrap();
        assert!(store.delete(first).await.unwrap());

        let second = store.save(b"ABC", "b.txt", DocumentKind::Cv).await.unwrap();
        let kept = store.get_path(second).await.unwrap().unwrap();
        assert_eq!(count_files(store.root()), 2);

        assert_eq!(store.sweep_orphans().await.unwrap(), 1);
        assert_eq!(count_files(store.root()), 1);
        assert!(kept.exists());
        assert_eq!(std::fs::read(&kept).unwrap(), b"ABC");
    }

    #[tokio::test]
    async fn test_sweep_spares_fresh_temp_files_only() {
        let (_dir, store) = store().await;
        store.save(b"keep", "a.txt", DocumentKind::Other).await.unwrap();

        let shard = store.root().join("zz");
        std::fs::create_dir_all(&shard).unwrap();
        let fresh = shard.join(".tmp-1-0");
        let stale = shard.join(".tmp-1-1");
        std::fs::write(&fresh, b"partial").unwrap();
        std::fs::write(&stale, b"partial").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(SystemTime::now() - TMP_GRACE - Duration::from_secs(60))
            .unwrap();

        assert_eq!(store.sweep_orphans().await.unwrap(), 1);
        assert!(fresh.exists());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_sweep_on_missing_root_is_noop() {
        let (_dir, store) = store().await;
        assert_eq!(store.sweep_orphans().await.unwrap(), 0);
    }
}
