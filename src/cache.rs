//! SQLite-backed cache for belief probe samples.
//!
//! Keyed by (model, prompt version, template wording, claim, replicate):
//! re-running an estimate reuses prior provider calls, and a different
//! replicate index is a different key so replicates stay independent draws.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone)]
pub struct SampleCacheKey {
    pub model: String,
    pub prompt_version: String,
    pub template_hash: String,
    pub claim_hash: String,
    pub replicate: usize,
    pub key_hash: String,
}

impl SampleCacheKey {
    pub fn new(
        model: &str,
        prompt_version: &str,
        template_hash: &str,
        claim: &str,
        replicate: usize,
    ) -> Self {
        let claim_hash = hash_text(claim);
        let replicate_str = replicate.to_string();
        let key_hash = hash_fields(&[
            model,
            prompt_version,
            template_hash,
            &claim_hash,
            &replicate_str,
        ]);

        Self {
            model: model.to_string(),
            prompt_version: prompt_version.to_string(),
            template_hash: template_hash.to_string(),
            claim_hash,
            replicate,
            key_hash,
        }
    }
}

/// A cached probe outcome: a valid probability, or a stable refusal.
/// Transient provider faults are never cached.
#[derive(Debug, Clone)]
pub struct CachedSample {
    pub probability: Option<f64>,
    pub refused: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait SampleCache: Send + Sync {
    async fn get(&self, key: &SampleCacheKey) -> Result<Option<CachedSample>, CacheError>;
    async fn put(&self, key: &SampleCacheKey, value: &CachedSample) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteSampleCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSampleCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS sample_cache (\
               key_hash TEXT PRIMARY KEY,\
               model TEXT NOT NULL,\
               prompt_version TEXT NOT NULL,\
               template_hash TEXT NOT NULL,\
               claim_hash TEXT NOT NULL,\
               replicate INTEGER NOT NULL,\
               probability REAL,\
               refused INTEGER NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("CREDENCE_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".credence_sample_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl SampleCache for SqliteSampleCache {
    async fn get(&self, key: &SampleCacheKey) -> Result<Option<CachedSample>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT probability, refused FROM sample_cache WHERE key_hash = ?1",
                )?;
                let mut rows = stmt.query(params![key_hash])?;
                if let Some(row) = rows.next()? {
                    let entry = CachedSample {
                        probability: row.get::<_, Option<f64>>(0)?,
                        refused: row.get::<_, i64>(1)? != 0,
                    };
                    conn.execute(
                        "UPDATE sample_cache \
                         SET hit_count = hit_count + 1, updated_at = ?1 \
                         WHERE key_hash = ?2",
                        params![now_epoch(), key_hash],
                    )?;
                    Ok(Some(entry))
                } else {
                    Ok(None)
                }
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &SampleCacheKey, value: &CachedSample) -> Result<(), CacheError> {
        let key = key.clone();
        let value = value.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO sample_cache (\
                        key_hash, model, prompt_version, template_hash, claim_hash, replicate,\
                        probability, refused, created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)\
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        probability = excluded.probability,\
                        refused = excluded.refused,\
                        updated_at = excluded.updated_at",
                    params![
                        key.key_hash,
                        key.model,
                        key.prompt_version,
                        key.template_hash,
                        key.claim_hash,
                        key.replicate as i64,
                        value.probability,
                        if value.refused { 1 } else { 0 },
                        now,
                        now,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub model: String,
    pub prompt_version: String,
    pub template_hash: String,
    pub claim_hash: String,
    pub replicate: i64,
    pub probability: Option<f64>,
    pub refused: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteSampleCache {
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<(), CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, model, prompt_version, template_hash, claim_hash, replicate,\
                            probability, refused, created_at, updated_at, hit_count \
                     FROM sample_cache ORDER BY updated_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::fs::File::create(path)?;
                while let Some(row) = rows.next()? {
                    let record = CacheExportRow {
                        key_hash: row.get(0)?,
                        model: row.get(1)?,
                        prompt_version: row.get(2)?,
                        template_hash: row.get(3)?,
                        claim_hash: row.get(4)?,
                        replicate: row.get(5)?,
                        probability: row.get(6)?,
                        refused: row.get::<_, i64>(7)? != 0,
                        created_at: row.get(8)?,
                        updated_at: row.get(9)?,
                        hit_count: row.get(10)?,
                    };
                    let line = serde_json::to_string(&record)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    use std::io::Write;
                    writeln!(file, "{line}")?;
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if let Some(days) = max_age_days {
                    let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                    let removed = conn.execute(
                        "DELETE FROM sample_cache WHERE updated_at < ?1",
                        params![cutoff],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    if max_rows == 0 {
                        return Ok(CachePruneStats {
                            deleted,
                            remaining: 0,
                        });
                    }
                    let count: i64 =
                        conn.query_row("SELECT COUNT(*) FROM sample_cache", [], |row| row.get(0))?;
                    let keep = max_rows as i64;
                    if count > keep {
                        let removed = conn.execute(
                            "DELETE FROM sample_cache WHERE key_hash IN (\
                                SELECT key_hash FROM sample_cache \
                                ORDER BY updated_at DESC LIMIT -1 OFFSET ?1\
                             )",
                            params![keep],
                        )?;
                        deleted = deleted.saturating_add(removed);
                    }
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM sample_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
