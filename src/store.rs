//! The persistent job record store (spec.md §4.1).
//!
//! Backed by a single SQLite file colocated with the log directory. A
//! `Mutex<Connection>` gives the "single writer at a time" serialization the
//! spec requires; SQLite itself allows only one writer regardless, but the
//! mutex also protects the read-modify-write sequencing `upsert` needs to
//! preserve each record's original insertion order.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::schema::{JobFilter, JobRecord, JobStatus};

/// SQLite-backed implementation of the record store.
pub struct RecordStore {
    conn: Mutex<Connection>,
}

impl RecordStore {
    /// Open (or create) `<base>/jobs.db`, creating `base` if needed.
    pub fn open(base: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(base).map_err(|source| StoreError::Io {
            path: base.to_path_buf(),
            source,
        })?;

        let db_path = base.join("jobs.db");
        let conn = Connection::open(&db_path).map_err(|source| StoreError::Open {
            path: db_path.clone(),
            source,
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=FULL;
             PRAGMA busy_timeout=5000;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS process_status (
                job_id      TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                last_update TEXT NOT NULL,
                last_pid    INTEGER NOT NULL,
                command     TEXT NOT NULL,
                cwd         TEXT NOT NULL,
                logdir      TEXT NOT NULL,
                logfile     TEXT NOT NULL,
                seq         INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_process_status_status
                ON process_status(status);",
        )?;

        Ok(RecordStore {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a new row, or replace every field of the existing row with the
    /// same `job_id`. `last_update` is stamped with the current wall clock.
    /// `seq` (insertion order) is preserved across updates — only assigned on
    /// first insert.
    pub fn upsert(&self, mut record: JobRecord) -> Result<(), StoreError> {
        if record.job_id.trim().is_empty() {
            return Err(StoreError::EmptyJobId);
        }
        record.last_update = crate::schema::now_iso8601();

        let conn = self.conn.lock().expect("record store mutex poisoned");

        let existing_seq: Option<i64> = conn
            .query_row(
                "SELECT seq FROM process_status WHERE job_id = ?1",
                params![record.job_id],
                |row| row.get(0),
            )
            .optional()?;

        let seq = match existing_seq {
            Some(seq) => seq,
            None => {
                let next: i64 = conn.query_row(
                    "SELECT COALESCE(MAX(seq), 0) + 1 FROM process_status",
                    [],
                    |row| row.get(0),
                )?;
                next
            }
        };

        conn.execute(
            "INSERT INTO process_status
                (job_id, status, last_update, last_pid, command, cwd, logdir, logfile, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(job_id) DO UPDATE SET
                status = excluded.status,
                last_update = excluded.last_update,
                last_pid = excluded.last_pid,
                command = excluded.command,
                cwd = excluded.cwd,
                logdir = excluded.logdir,
                logfile = excluded.logfile",
            params![
                record.job_id,
                record.status.as_str(),
                record.last_update,
                record.last_pid,
                record.command,
                record.cwd.to_string_lossy(),
                record.logdir.to_string_lossy(),
                record.logfile,
                seq,
            ],
        )?;

        Ok(())
    }

    /// Look up a single record by id.
    pub fn get(&self, job_id: &str) -> Result<JobRecord, StoreError> {
        let conn = self.conn.lock().expect("record store mutex poisoned");
        row_to_record(&conn, job_id)?.ok_or_else(|| StoreError::NotFound(job_id.to_string()))
    }

    /// Enumerate records matching `filter`, in insertion order (ties broken
    /// lexicographically by `job_id`, spec.md §4.1).
    pub fn list(&self, filter: &JobFilter) -> Result<Vec<JobRecord>, StoreError> {
        let conn = self.conn.lock().expect("record store mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT job_id, status, last_update, last_pid, command, cwd, logdir, logfile
             FROM process_status
             ORDER BY seq ASC, job_id ASC",
        )?;
        let rows = stmt.query_map([], map_row)?;

        let mut out = Vec::new();
        for row in rows {
            let record = row?;
            if filter.matches(&record) {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Read the captured stdout/stderr for `job_id`'s most recent spawn.
    /// Per-file I/O failures are degraded to an in-place sentinel string
    /// rather than propagated (spec.md §4.1: "never throws").
    pub fn logs(&self, job_id: &str) -> Result<(String, String), StoreError> {
        let record = self.get(job_id)?;
        let stdout = read_log_or_sentinel(&record.stdout_path());
        let stderr = read_log_or_sentinel(&record.stderr_path());
        Ok((stdout, stderr))
    }
}

fn read_log_or_sentinel(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("<error reading {}: {e}>", path.display()),
    }
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
    let status_str: String = row.get(1)?;
    let status = status_str.parse::<JobStatus>().unwrap_or(JobStatus::Failed);
    Ok(JobRecord {
        job_id: row.get(0)?,
        status,
        last_update: row.get(2)?,
        last_pid: row.get(3)?,
        command: row.get(4)?,
        cwd: PathBuf::from(row.get::<_, String>(5)?),
        logdir: PathBuf::from(row.get::<_, String>(6)?),
        logfile: row.get(7)?,
    })
}

fn row_to_record(conn: &Connection, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
    conn.query_row(
        "SELECT job_id, status, last_update, last_pid, command, cwd, logdir, logfile
         FROM process_status WHERE job_id = ?1",
        params![job_id],
        map_row,
    )
    .optional()
    .map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(job_id: &str, status: JobStatus) -> JobRecord {
        JobRecord {
            job_id: job_id.to_string(),
            status,
            last_update: String::new(),
            last_pid: 0,
            command: "echo hi".to_string(),
            cwd: PathBuf::from("/tmp"),
            logdir: PathBuf::from("/tmp/logs"),
            logfile: format!("job_{job_id}"),
        }
    }

    #[test]
    fn upsert_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        store.upsert(sample("j1", JobStatus::Starting)).unwrap();

        let got = store.get("j1").unwrap();
        assert_eq!(got.job_id, "j1");
        assert_eq!(got.status, JobStatus::Starting);
        assert!(!got.last_update.is_empty());
    }

    #[test]
    fn second_upsert_replaces_in_place_not_duplicate() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        store.upsert(sample("j1", JobStatus::Starting)).unwrap();
        store.upsert(sample("j1", JobStatus::Running)).unwrap();

        let all = store.list(&JobFilter::new()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, JobStatus::Running);
    }

    #[test]
    fn get_missing_job_is_not_found() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        let err = store.get("nope").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn empty_job_id_is_rejected() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        let err = store.upsert(sample("", JobStatus::Starting)).unwrap_err();
        assert!(matches!(err, StoreError::EmptyJobId));
    }

    #[test]
    fn list_preserves_insertion_order_with_lexicographic_tiebreak() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        store.upsert(sample("zebra", JobStatus::Running)).unwrap();
        store.upsert(sample("apple", JobStatus::Running)).unwrap();
        // Relaunch "zebra" — must keep its original position (seq unchanged).
        store.upsert(sample("zebra", JobStatus::Finished)).unwrap();

        let all = store.list(&JobFilter::new()).unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ids, vec!["zebra", "apple"]);
    }

    #[test]
    fn list_filter_ands_fields() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        store.upsert(sample("j1", JobStatus::Finished)).unwrap();
        store.upsert(sample("j2", JobStatus::Running)).unwrap();
        store.upsert(sample("j3", JobStatus::Finished)).unwrap();

        let finished = store
            .list(&JobFilter::new().with_status(JobStatus::Finished))
            .unwrap();
        let ids: Vec<&str> = finished.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ids, vec!["j1", "j3"]);
    }

    #[test]
    fn logs_reports_sentinel_for_missing_files() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        let mut record = sample("j1", JobStatus::Finished);
        record.logdir = dir.path().to_path_buf();
        store.upsert(record).unwrap();

        let (stdout, stderr) = store.logs("j1").unwrap();
        assert!(stdout.contains("error reading"));
        assert!(stderr.contains("error reading"));
    }

    #[test]
    fn logs_reads_real_file_contents() {
        let dir = tempdir().unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        let mut record = sample("j1", JobStatus::Finished);
        record.logdir = dir.path().to_path_buf();
        store.upsert(record).unwrap();

        std::fs::write(dir.path().join("job_j1.stdout"), "hello\n").unwrap();
        std::fs::write(dir.path().join("job_j1.stderr"), "").unwrap();

        let (stdout, stderr) = store.logs("j1").unwrap();
        assert_eq!(stdout, "hello\n");
        assert_eq!(stderr, "");
    }
}
