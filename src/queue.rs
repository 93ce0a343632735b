//! Durable outbound queue (spec.md §4.3).
//!
//! Persists payloads in an embedded SQLite database in WAL mode, matching
//! the teacher's `db.rs` migration-versioned schema approach. `push` and
//! `mark` are called from different tasks and serialize through a single
//! `Mutex<Connection>` (spec.md §5 "single writer model").

use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::model::{OutboundJob, Topic};

const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Backoff rule (spec.md §4.3): `min(2^(attempts-1), 60)` seconds for
/// attempts 1-9, `300` seconds for attempts >= 10.
pub fn backoff_seconds(attempts: u32) -> i64 {
    if attempts == 0 {
        return 0;
    }
    if attempts >= 10 {
        return 300;
    }
    let delay = 1i64.checked_shl(attempts - 1).unwrap_or(i64::MAX);
    delay.min(60)
}

enum Backing {
    Disk(Mutex<Connection>),
    /// Fallback store when the on-disk database could not be opened at
    /// startup (spec.md §7 "Persistent store unavailable"). Does not survive
    /// restart.
    Memory(Mutex<Vec<OutboundJob>>),
}

pub struct Queue {
    backing: Backing,
    next_id: Mutex<i64>,
    max_bytes: u64,
    max_age_secs: i64,
    trim_batch_size: usize,
    db_path: Option<std::path::PathBuf>,
}

impl Queue {
    /// Open (or create) the queue database at `path`. Falls back to an
    /// in-memory store with a logged warning if the file cannot be opened,
    /// per spec.md §4.3 "Durability".
    pub fn open(
        path: &std::path::Path,
        max_bytes: u64,
        max_age_secs: i64,
        trim_batch_size: usize,
    ) -> Self {
        match open_and_migrate(path) {
            Ok(conn) => {
                let next_id = next_id_from(&conn);
                info!(path = %path.display(), "outbound queue opened");
                Queue {
                    backing: Backing::Disk(Mutex::new(conn)),
                    next_id: Mutex::new(next_id),
                    max_bytes,
                    max_age_secs,
                    trim_batch_size,
                    db_path: Some(path.to_path_buf()),
                }
            }
            Err(e) => {
                warn!(error = %e, path = %path.display(), "queue store unavailable, falling back to in-memory (no restart durability)");
                Queue {
                    backing: Backing::Memory(Mutex::new(Vec::new())),
                    next_id: Mutex::new(1),
                    max_bytes,
                    max_age_secs,
                    trim_batch_size,
                    db_path: None,
                }
            }
        }
    }

    /// Enqueue a payload durably. Returns the assigned job id.
    pub fn push(
        &self,
        topic: Topic,
        url: &str,
        body: Vec<u8>,
        headers: Vec<(String, String)>,
        now: i64,
    ) -> i64 {
        let id = {
            let mut guard = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
            let id = *guard;
            *guard += 1;
            id
        };
        let job = OutboundJob {
            id,
            topic,
            url: url.to_string(),
            body,
            headers,
            attempts: 0,
            next_eligible: now,
            created_at: now,
        };

        match &self.backing {
            Backing::Disk(conn) => {
                let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = insert_job(&guard, &job) {
                    warn!(error = %e, "failed to persist job, it is lost");
                }
            }
            Backing::Memory(jobs) => {
                jobs.lock().unwrap_or_else(|e| e.into_inner()).push(job);
            }
        }

        self.enforce_limits(now);
        id
    }

    /// Return at most one job whose `next_eligible <= now`, in ascending id
    /// order (FIFO on insert time, spec.md §4.3 "due").
    pub fn due(&self, now: i64) -> Option<OutboundJob> {
        match &self.backing {
            Backing::Disk(conn) => {
                let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
                due_from_disk(&guard, now)
            }
            Backing::Memory(jobs) => {
                let jobs = jobs.lock().unwrap_or_else(|e| e.into_inner());
                jobs.iter()
                    .filter(|j| j.next_eligible <= now)
                    .min_by_key(|j| j.id)
                    .cloned()
            }
        }
    }

    /// Mark a job as delivered (removes it) or failed (advances attempts and
    /// `next_eligible` per the backoff rule).
    pub fn mark(&self, id: i64, ok: bool, now: i64) {
        match &self.backing {
            Backing::Disk(conn) => {
                let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
                if ok {
                    let _ = guard.execute("DELETE FROM outbound_jobs WHERE id = ?1", params![id]);
                } else {
                    mark_failed_disk(&guard, id, now);
                }
            }
            Backing::Memory(jobs) => {
                let mut jobs = jobs.lock().unwrap_or_else(|e| e.into_inner());
                if ok {
                    jobs.retain(|j| j.id != id);
                } else if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
                    job.attempts += 1;
                    job.next_eligible = now + backoff_seconds(job.attempts);
                }
            }
        }
    }

    /// Number of jobs currently pending.
    pub fn depth(&self) -> u64 {
        match &self.backing {
            Backing::Disk(conn) => {
                let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
                guard
                    .query_row("SELECT COUNT(*) FROM outbound_jobs", [], |row| row.get(0))
                    .unwrap_or(0)
            }
            Backing::Memory(jobs) => jobs.lock().unwrap_or_else(|e| e.into_inner()).len() as u64,
        }
    }

    /// Evict by age then by byte size (spec.md §4.3 "Eviction"). Called
    /// opportunistically on every push and periodically (every 60s) by the
    /// eviction task.
    pub fn enforce_limits(&self, now: i64) {
        match &self.backing {
            Backing::Disk(conn) => {
                let guard = conn.lock().unwrap_or_else(|e| e.into_inner());
                let cutoff = now - self.max_age_secs;
                let aged = guard
                    .execute(
                        "DELETE FROM outbound_jobs WHERE created_at < ?1",
                        params![cutoff],
                    )
                    .unwrap_or(0);
                if aged > 0 {
                    info!(count = aged, "evicted aged-out jobs");
                }

                while self.on_disk_bytes() > self.max_bytes {
                    let deleted = guard
                        .execute(
                            "DELETE FROM outbound_jobs WHERE id IN (
                                SELECT id FROM outbound_jobs ORDER BY created_at ASC, id ASC LIMIT ?1
                            )",
                            params![self.trim_batch_size as i64],
                        )
                        .unwrap_or(0);
                    if deleted == 0 {
                        break;
                    }
                    info!(count = deleted, "evicted oldest jobs for size cap");
                    let _ = guard.execute_batch("VACUUM;");
                }
            }
            Backing::Memory(jobs) => {
                let mut jobs = jobs.lock().unwrap_or_else(|e| e.into_inner());
                let cutoff = now - self.max_age_secs;
                jobs.retain(|j| j.created_at >= cutoff);

                let mut total: u64 = jobs.iter().map(|j| j.body.len() as u64).sum();
                while total > self.max_bytes && !jobs.is_empty() {
                    jobs.sort_by_key(|j| (j.created_at, j.id));
                    let take = self.trim_batch_size.min(jobs.len());
                    let removed: Vec<_> = jobs.drain(0..take).collect();
                    total -= removed.iter().map(|j| j.body.len() as u64).sum::<u64>();
                }
            }
        }
    }

    fn on_disk_bytes(&self) -> u64 {
        self.db_path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

fn open_and_migrate(path: &std::path::Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;
    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < 1 {
        migrate_v1(conn)?;
    }
    Ok(())
}

fn migrate_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS outbound_jobs (
            id INTEGER PRIMARY KEY,
            topic TEXT NOT NULL,
            url TEXT NOT NULL,
            body BLOB NOT NULL,
            headers TEXT NOT NULL DEFAULT '[]',
            attempts INTEGER NOT NULL DEFAULT 0,
            next_eligible INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_outbound_jobs_next_eligible ON outbound_jobs(next_eligible);
        CREATE INDEX IF NOT EXISTS idx_outbound_jobs_created_at ON outbound_jobs(created_at);
        INSERT INTO schema_version (version) VALUES (1);",
    )
}

fn next_id_from(conn: &Connection) -> i64 {
    conn.query_row(
        "SELECT COALESCE(MAX(id), 0) + 1 FROM outbound_jobs",
        [],
        |row| row.get(0),
    )
    .unwrap_or(1)
}

fn insert_job(conn: &Connection, job: &OutboundJob) -> rusqlite::Result<()> {
    let headers = serde_json::to_string(&job.headers).unwrap_or_else(|_| "[]".to_string());
    conn.execute(
        "INSERT INTO outbound_jobs (id, topic, url, body, headers, attempts, next_eligible, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            job.id,
            job.topic.as_str(),
            job.url,
            job.body,
            headers,
            job.attempts,
            job.next_eligible,
            job.created_at,
        ],
    )?;
    Ok(())
}

fn due_from_disk(conn: &Connection, now: i64) -> Option<OutboundJob> {
    conn.query_row(
        "SELECT id, topic, url, body, headers, attempts, next_eligible, created_at
         FROM outbound_jobs
         WHERE next_eligible <= ?1
         ORDER BY id ASC
         LIMIT 1",
        params![now],
        row_to_job,
    )
    .optional()
    .unwrap_or(None)
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<OutboundJob> {
    let topic_str: String = row.get(1)?;
    let headers_json: String = row.get(4)?;
    let headers: Vec<(String, String)> = serde_json::from_str(&headers_json).unwrap_or_default();
    Ok(OutboundJob {
        id: row.get(0)?,
        topic: Topic::from_str_opt(&topic_str).unwrap_or(Topic::TransactionLine),
        url: row.get(2)?,
        body: row.get(3)?,
        headers,
        attempts: row.get(5)?,
        next_eligible: row.get(6)?,
        created_at: row.get(7)?,
    })
}

fn mark_failed_disk(conn: &Connection, id: i64, now: i64) {
    let attempts: Option<u32> = conn
        .query_row(
            "SELECT attempts FROM outbound_jobs WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or(None);
    let Some(attempts) = attempts else { return };
    let new_attempts = attempts + 1;
    let next_eligible = now + backoff_seconds(new_attempts);
    let _ = conn.execute(
        "UPDATE outbound_jobs SET attempts = ?1, next_eligible = ?2 WHERE id = ?3",
        params![new_attempts, next_eligible, id],
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn headers() -> Vec<(String, String)> {
        vec![("X-Device-ID".to_string(), "dev-1".to_string())]
    }

    #[test]
    fn backoff_rule_matches_spec_table() {
        assert_eq!(backoff_seconds(1), 1);
        assert_eq!(backoff_seconds(2), 2);
        assert_eq!(backoff_seconds(3), 4);
        assert_eq!(backoff_seconds(6), 32);
        assert_eq!(backoff_seconds(7), 60); // 2^6=64 clamped to 60
        assert_eq!(backoff_seconds(9), 60);
        assert_eq!(backoff_seconds(10), 300);
        assert_eq!(backoff_seconds(20), 300);
    }

    #[test]
    fn push_then_due_then_mark_ok_removes_job() {
        let dir = tempdir().unwrap();
        let q = Queue::open(&dir.path().join("q.sqlite3"), 1_000_000, 86_400, 50);
        let id = q.push(Topic::Transactions, "https://x/tx", b"{}".to_vec(), headers(), 1000);
        assert_eq!(q.depth(), 1);
        let job = q.due(1000).unwrap();
        assert_eq!(job.id, id);
        q.mark(id, true, 1001);
        assert_eq!(q.depth(), 0);
        assert!(q.due(2000).is_none());
    }

    #[test]
    fn due_never_returns_a_job_before_its_next_eligible() {
        let dir = tempdir().unwrap();
        let q = Queue::open(&dir.path().join("q.sqlite3"), 1_000_000, 86_400, 50);
        let id = q.push(Topic::Transactions, "https://x/tx", b"{}".to_vec(), headers(), 1000);
        q.mark(id, false, 1000); // attempts=1, next_eligible = 1001
        assert!(q.due(1000).is_none());
        let job = q.due(1001).unwrap();
        assert_eq!(job.attempts, 1);
    }

    #[test]
    fn failing_job_does_not_head_of_line_block() {
        let dir = tempdir().unwrap();
        let q = Queue::open(&dir.path().join("q.sqlite3"), 1_000_000, 86_400, 50);
        let first = q.push(Topic::Transactions, "https://x/tx", b"1".to_vec(), headers(), 1000);
        q.mark(first, false, 1000); // next_eligible = 1001
        let second = q.push(Topic::Transactions, "https://x/tx", b"2".to_vec(), headers(), 1000);
        let job = q.due(1000).unwrap();
        assert_eq!(job.id, second);
    }

    #[test]
    fn attempts_reach_300s_delay_at_10_failures() {
        let dir = tempdir().unwrap();
        let q = Queue::open(&dir.path().join("q.sqlite3"), 1_000_000, 86_400, 50);
        let id = q.push(Topic::Transactions, "https://x/tx", b"x".to_vec(), headers(), 0);
        let mut now = 0i64;
        for _ in 0..10 {
            q.mark(id, false, now);
            now += 1;
        }
        let job = q.due(i64::MAX).unwrap();
        assert_eq!(job.attempts, 10);
    }

    #[test]
    fn age_based_eviction_deletes_old_jobs_preserves_new() {
        let dir = tempdir().unwrap();
        let q = Queue::open(&dir.path().join("q.sqlite3"), 1_000_000, 10, 50);
        let old = q.push(Topic::Transactions, "https://x/tx", b"old".to_vec(), headers(), 0);
        let new = q.push(Topic::Transactions, "https://x/tx", b"new".to_vec(), headers(), 100);
        q.enforce_limits(100);
        assert!(q.due(100).map(|j| j.id) != Some(old));
        let remaining = q.due(100);
        assert_eq!(remaining.map(|j| j.id), Some(new));
    }

    #[test]
    fn falls_back_to_memory_when_disk_path_unwritable() {
        // A directory that does not exist and cannot be created (parent
        // missing) causes rusqlite::Connection::open to fail.
        let bogus = std::path::Path::new("/nonexistent-dir-xyz/q.sqlite3");
        let q = Queue::open(bogus, 1_000_000, 86_400, 50);
        let id = q.push(Topic::Transactions, "https://x/tx", b"{}".to_vec(), headers(), 0);
        assert_eq!(q.depth(), 1);
        assert_eq!(q.due(0).unwrap().id, id);
    }
}
