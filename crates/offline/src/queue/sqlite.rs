//! SQLite-backed job queue.
//!
//! The queue lives in a small key-value table (`kv_store`). Pending jobs are a
//! single namespaced record holding the whole ordered list as JSON text;
//! dead letters are a second record. Every record carries a revision counter
//! used for compare-and-swap writes. Operations spanning both records run in
//! one transaction.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tradeflow_core::JobId;

use super::{
    DEAD_LETTERS_KEY, JOBS_KEY, JobQueue, QueueError, decode_list, encode_list, merge_residue,
    push_dead_letters, restore_dead_letter,
};
use crate::types::{DeadLetter, QueueEntry};

/// How many times a compare-and-swap write is retried before giving up.
const MAX_CAS_RETRIES: usize = 8;

/// SQLite-backed durable queue.
///
/// This struct is cheap to clone and is safe to share across tasks. The
/// connection pool is created lazily on first use.
#[derive(Debug, Clone)]
pub struct SqliteJobQueue {
    db_url: String,
    pool: Arc<tokio::sync::Mutex<Option<SqlitePool>>>,
}

impl SqliteJobQueue {
    /// Queue stored in the database at `db_url` (e.g. `sqlite:///tmp/q.db`).
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            pool: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Queue stored in the database file at `path`.
    pub fn at_path(path: impl AsRef<Path>) -> Self {
        Self::new(format!("sqlite://{}", path.as_ref().to_string_lossy()))
    }

    /// Queue stored at `{data_dir}/tradeflow/offline.db`.
    pub fn at_default_path() -> anyhow::Result<Self> {
        Ok(Self::at_path(default_db_path()?))
    }

    /// Private in-memory database (tests/dev).
    pub fn in_memory() -> Self {
        Self::new("sqlite::memory:")
    }

    /// Initialize the database connection (called lazily on first use).
    async fn ensure_initialized(&self) -> anyhow::Result<SqlitePool> {
        let mut pool_guard = self.pool.lock().await;
        if let Some(pool) = pool_guard.as_ref() {
            return Ok(pool.clone());
        }

        let options = SqliteConnectOptions::from_str(&self.db_url)
            .with_context(|| format!("invalid queue database URL '{}'", self.db_url))?
            .create_if_missing(true);

        // One connection: keeps `sqlite::memory:` a single database and
        // serializes writers within this process.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open queue database at '{}'", self.db_url))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key       TEXT PRIMARY KEY,
                value     TEXT NOT NULL,
                revision  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create kv_store table")?;

        *pool_guard = Some(pool.clone());
        Ok(pool)
    }

    async fn pool(&self) -> Result<SqlitePool, QueueError> {
        self.ensure_initialized()
            .await
            .map_err(|e| QueueError::Storage(format!("{e:#}")))
    }

    /// Read a record and its revision.
    async fn read(&self, key: &str) -> Result<Option<(String, i64)>, QueueError> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(storage_err)?;
        read_record(&mut conn, key).await
    }

    /// Write `value` only if the record is still at `expected` revision
    /// (`None` = record must not exist). Returns whether the write won.
    async fn compare_and_swap(
        &self,
        key: &str,
        value: &str,
        expected: Option<i64>,
    ) -> Result<bool, QueueError> {
        let pool = self.pool().await?;
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO kv_store (key, value, revision)
                    VALUES (?1, ?2, 1)
                    ON CONFLICT(key) DO NOTHING
                    "#,
                )
                .bind(key)
                .bind(value)
                .execute(&pool)
                .await
            }
            Some(revision) => {
                sqlx::query(
                    r#"
                    UPDATE kv_store
                    SET value = ?2,
                        revision = revision + 1
                    WHERE key = ?1
                      AND revision = ?3
                    "#,
                )
                .bind(key)
                .bind(value)
                .bind(revision)
                .execute(&pool)
                .await
            }
        }
        .map_err(storage_err)?;

        Ok(result.rows_affected() == 1)
    }

    /// Unconditional write.
    async fn upsert(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let pool = self.pool().await?;
        let mut conn = pool.acquire().await.map_err(storage_err)?;
        write_record(&mut conn, key, value).await
    }

    /// Read-modify-write the pending and dead-letter records in one
    /// transaction. Nothing is written if `apply` or any statement fails.
    async fn update_both<R, F>(&self, apply: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut Vec<QueueEntry>, &mut Vec<DeadLetter>) -> Result<R, QueueError> + Send,
    {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(storage_err)?;

        let jobs_raw = read_record(&mut tx, JOBS_KEY).await?;
        let dead_raw = read_record(&mut tx, DEAD_LETTERS_KEY).await?;
        let mut jobs: Vec<QueueEntry> =
            decode_list(JOBS_KEY, jobs_raw.as_ref().map(|(value, _)| value.as_str()))?;
        let mut dead: Vec<DeadLetter> =
            decode_list(DEAD_LETTERS_KEY, dead_raw.as_ref().map(|(value, _)| value.as_str()))?;

        let out = apply(&mut jobs, &mut dead)?;

        let jobs_encoded = encode_list(&jobs)?;
        let dead_encoded = encode_list(&dead)?;
        write_record(&mut tx, JOBS_KEY, &jobs_encoded).await?;
        write_record(&mut tx, DEAD_LETTERS_KEY, &dead_encoded).await?;
        tx.commit().await.map_err(storage_err)?;
        Ok(out)
    }

    /// Read-modify-write a JSON list record under compare-and-swap.
    async fn update_list<T, R, F>(&self, key: &str, mut apply: F) -> Result<R, QueueError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: FnMut(Vec<T>) -> Result<(Vec<T>, R), QueueError> + Send,
    {
        for attempt in 1..=MAX_CAS_RETRIES {
            let current = self.read(key).await?;
            let (raw, revision) = match &current {
                Some((raw, revision)) => (Some(raw.as_str()), Some(*revision)),
                None => (None, None),
            };

            let items: Vec<T> = decode_list(key, raw)?;
            let (updated, out) = apply(items)?;
            let encoded = encode_list(&updated)?;

            if self.compare_and_swap(key, &encoded, revision).await? {
                return Ok(out);
            }
            tracing::debug!(key, attempt, "queue record changed concurrently; retrying");
        }

        Err(QueueError::Storage(format!(
            "gave up updating '{key}' after {MAX_CAS_RETRIES} concurrent modifications"
        )))
    }

    /// Move an unparseable pending-jobs record aside and start from an empty
    /// queue.
    ///
    /// Returns the key the raw text was copied to, or `None` if the record
    /// was readable (nothing to recover).
    pub async fn recover_corrupted(&self) -> Result<Option<String>, QueueError> {
        let Some((raw, _)) = self.read(JOBS_KEY).await? else {
            return Ok(None);
        };
        if decode_list::<QueueEntry>(JOBS_KEY, Some(raw.as_str())).is_ok() {
            return Ok(None);
        }

        let backup_key = format!("{JOBS_KEY}:corrupted:{}", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        self.upsert(&backup_key, &raw).await?;
        self.upsert(JOBS_KEY, "[]").await?;

        tracing::warn!(backup_key = %backup_key, "corrupted queue record moved aside");
        Ok(Some(backup_key))
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn append(&self, entry: QueueEntry) -> Result<(), QueueError> {
        self.update_list(JOBS_KEY, |mut jobs: Vec<QueueEntry>| {
            if jobs.iter().any(|e| e.id() == entry.id()) {
                return Err(QueueError::Duplicate(entry.id()));
            }
            jobs.push(entry.clone());
            Ok((jobs, ()))
        })
        .await
    }

    async fn list(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let raw = self.read(JOBS_KEY).await?;
        decode_list(JOBS_KEY, raw.as_ref().map(|(value, _)| value.as_str()))
    }

    async fn save(&self, remaining: Vec<QueueEntry>) -> Result<(), QueueError> {
        let encoded = encode_list(&remaining)?;
        self.upsert(JOBS_KEY, &encoded).await
    }

    async fn save_residue(
        &self,
        snapshot: &[JobId],
        remaining: Vec<QueueEntry>,
    ) -> Result<(), QueueError> {
        self.update_list(JOBS_KEY, |current: Vec<QueueEntry>| {
            Ok((merge_residue(current, snapshot, remaining.clone()), ()))
        })
        .await
    }

    async fn commit_pass(
        &self,
        snapshot: &[JobId],
        remaining: Vec<QueueEntry>,
        dead: Vec<DeadLetter>,
    ) -> Result<(), QueueError> {
        self.update_both(|jobs, dead_letters| {
            let current = std::mem::take(jobs);
            *jobs = merge_residue(current, snapshot, remaining);
            push_dead_letters(dead_letters, dead);
            Ok(())
        })
        .await
    }

    async fn dead_letter(&self, letters: Vec<DeadLetter>) -> Result<(), QueueError> {
        self.update_list(DEAD_LETTERS_KEY, |mut dead: Vec<DeadLetter>| {
            push_dead_letters(&mut dead, letters.clone());
            Ok((dead, ()))
        })
        .await
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let raw = self.read(DEAD_LETTERS_KEY).await?;
        decode_list(
            DEAD_LETTERS_KEY,
            raw.as_ref().map(|(value, _)| value.as_str()),
        )
    }

    async fn requeue_dead_letter(&self, id: JobId) -> Result<QueueEntry, QueueError> {
        self.update_both(|jobs, dead| restore_dead_letter(jobs, dead, id))
            .await
    }

    async fn purge_dead_letters(&self) -> Result<usize, QueueError> {
        self.update_list(DEAD_LETTERS_KEY, |dead: Vec<DeadLetter>| {
            let count = dead.len();
            Ok((Vec::new(), count))
        })
        .await
    }
}

async fn read_record(
    conn: &mut SqliteConnection,
    key: &str,
) -> Result<Option<(String, i64)>, QueueError> {
    let row = sqlx::query("SELECT value, revision FROM kv_store WHERE key = ?1")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(storage_err)?;

    match row {
        Some(row) => {
            let value: String = row.try_get("value").map_err(storage_err)?;
            let revision: i64 = row.try_get("revision").map_err(storage_err)?;
            Ok(Some((value, revision)))
        }
        None => Ok(None),
    }
}

async fn write_record(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<(), QueueError> {
    sqlx::query(
        r#"
        INSERT INTO kv_store (key, value, revision)
        VALUES (?1, ?2, 1)
        ON CONFLICT(key) DO UPDATE
        SET value = excluded.value,
            revision = kv_store.revision + 1
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(&mut *conn)
    .await
    .map_err(storage_err)?;
    Ok(())
}

fn storage_err(err: sqlx::Error) -> QueueError {
    QueueError::Storage(err.to_string())
}

/// Resolve the path to the SQLite database holding the queue:
/// `{app_data_dir}/tradeflow/offline.db`.
pub fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

    let mut dir = base;
    dir.push("tradeflow");

    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create queue directory at {:?}", dir))?;

    dir.push("offline.db");
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Job, Request};
    use serde_json::json;

    fn entry(name: &str) -> QueueEntry {
        QueueEntry::new(
            Job::from_request(&Request::post("/api/items", json!({ "name": name }))).unwrap(),
        )
    }

    #[tokio::test]
    async fn append_then_list_round_trips_fields() {
        let queue = SqliteJobQueue::in_memory();
        let rice = entry("Rice");
        let beans = entry("Beans");

        queue.append(rice.clone()).await.unwrap();
        queue.append(beans.clone()).await.unwrap();

        let listed = queue.list().await.unwrap();
        assert_eq!(listed, vec![rice, beans]);
    }

    #[tokio::test]
    async fn empty_database_lists_nothing() {
        let queue = SqliteJobQueue::in_memory();
        assert!(queue.list().await.unwrap().is_empty());
        assert!(queue.list_dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clones_share_the_same_storage() {
        let queue = SqliteJobQueue::in_memory();
        let other = queue.clone();

        queue.append(entry("Rice")).await.unwrap();
        other.append(entry("Beans")).await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stale_revision_loses_the_swap() {
        let queue = SqliteJobQueue::in_memory();
        queue.append(entry("Rice")).await.unwrap();

        let (_, revision) = queue.read(JOBS_KEY).await.unwrap().unwrap();
        queue.append(entry("Beans")).await.unwrap();

        let won = queue.compare_and_swap(JOBS_KEY, "[]", Some(revision)).await.unwrap();
        assert!(!won);
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn residue_save_keeps_late_appends() {
        let queue = SqliteJobQueue::in_memory();
        let a = entry("A");
        let b = entry("B");
        queue.append(a.clone()).await.unwrap();
        queue.append(b.clone()).await.unwrap();

        let snapshot: Vec<JobId> = queue.list().await.unwrap().iter().map(QueueEntry::id).collect();

        let late = entry("Late");
        queue.append(late.clone()).await.unwrap();

        queue.save_residue(&snapshot, vec![b.clone()]).await.unwrap();
        assert_eq!(queue.list().await.unwrap(), vec![b, late]);
    }

    #[tokio::test]
    async fn corrupted_record_is_reported_and_recoverable() {
        let queue = SqliteJobQueue::in_memory();
        queue.upsert(JOBS_KEY, "{not json").await.unwrap();

        let err = queue.list().await.unwrap_err();
        assert!(matches!(err, QueueError::Corrupted { .. }));

        // Appending must not overwrite the unreadable backlog either.
        assert!(matches!(
            queue.append(entry("Rice")).await.unwrap_err(),
            QueueError::Corrupted { .. }
        ));

        let backup = queue.recover_corrupted().await.unwrap().unwrap();
        assert!(backup.starts_with("__offline_jobs__:corrupted:"));
        let (raw, _) = queue.read(&backup).await.unwrap().unwrap();
        assert_eq!(raw, "{not json");

        assert!(queue.list().await.unwrap().is_empty());
        assert_eq!(queue.recover_corrupted().await.unwrap(), None);
    }

    #[tokio::test]
    async fn dead_letter_lifecycle() {
        let queue = SqliteJobQueue::in_memory();
        let mut e = entry("Rice");
        e.attempts = 3;

        queue
            .dead_letter(vec![DeadLetter::new(e.clone(), "max attempts")])
            .await
            .unwrap();
        let dead = queue.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "max attempts");

        let requeued = queue.requeue_dead_letter(e.id()).await.unwrap();
        assert_eq!(requeued.attempts, 0);
        assert_eq!(queue.list().await.unwrap(), vec![requeued]);
        assert_eq!(queue.purge_dead_letters().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_requeue_keeps_the_dead_letter() {
        let queue = SqliteJobQueue::in_memory();
        let e = entry("Rice");
        queue
            .dead_letter(vec![DeadLetter::new(e.clone(), "max attempts")])
            .await
            .unwrap();
        queue.upsert(JOBS_KEY, "{broken").await.unwrap();

        let err = queue.requeue_dead_letter(e.id()).await.unwrap_err();
        assert!(matches!(err, QueueError::Corrupted { .. }));
        let dead = queue.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].entry.id(), e.id());

        queue.recover_corrupted().await.unwrap();
        let requeued = queue.requeue_dead_letter(e.id()).await.unwrap();
        assert_eq!(queue.list().await.unwrap(), vec![requeued]);
        assert!(queue.list_dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_pass_writes_both_records_or_neither() {
        let queue = SqliteJobQueue::in_memory();
        let kept = entry("Kept");
        let dropped = entry("Dropped");
        queue.append(kept.clone()).await.unwrap();
        queue.append(dropped.clone()).await.unwrap();
        let snapshot = vec![kept.id(), dropped.id()];

        // An unreadable dead-letter record aborts the whole commit.
        queue.upsert(DEAD_LETTERS_KEY, "[{oops").await.unwrap();
        let err = queue
            .commit_pass(&snapshot, vec![kept.clone()], vec![DeadLetter::new(dropped.clone(), "expired")])
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Corrupted { .. }));
        assert_eq!(queue.list().await.unwrap(), vec![kept.clone(), dropped.clone()]);

        queue.upsert(DEAD_LETTERS_KEY, "[]").await.unwrap();
        queue
            .commit_pass(&snapshot, vec![kept.clone()], vec![DeadLetter::new(dropped.clone(), "expired")])
            .await
            .unwrap();
        assert_eq!(queue.list().await.unwrap(), vec![kept]);
        let dead = queue.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].entry.id(), dropped.id());
    }

    #[tokio::test]
    async fn file_backed_queue_survives_reopen() {
        let path = std::env::temp_dir().join(format!("tradeflow-queue-{}.db", JobId::new()));
        let e = entry("Rice");

        {
            let queue = SqliteJobQueue::at_path(&path);
            queue.append(e.clone()).await.unwrap();
        }

        let reopened = SqliteJobQueue::at_path(&path);
        assert_eq!(reopened.list().await.unwrap(), vec![e]);

        let _ = std::fs::remove_file(&path);
    }
}
