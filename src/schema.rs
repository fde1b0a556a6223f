//! The job record data model shared by the store, supervisor, and manager.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job. Wire values are stable (spec'd in §6): they are
/// the exact strings stored in the `process_status.status` column and
/// emitted in JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Running,
    Finished,
    Failed,
    FailedStart,
    Stopped,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Starting,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::FailedStart,
        JobStatus::Stopped,
    ];

    /// Non-terminal statuses (`starting`, `running`) are the only ones for
    /// which `last_pid` is guaranteed to identify a process believed alive.
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Starting | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Starting => "starting",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::FailedStart => "failed_start",
            JobStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by [`JobStatus::from_str`] for an unrecognized wire value.
#[derive(Debug, thiserror::Error)]
#[error("unrecognized job status: {0}")]
pub struct ParseJobStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseJobStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(JobStatus::Starting),
            "running" => Ok(JobStatus::Running),
            "finished" => Ok(JobStatus::Finished),
            "failed" => Ok(JobStatus::Failed),
            "failed_start" => Ok(JobStatus::FailedStart),
            "stopped" => Ok(JobStatus::Stopped),
            other => Err(ParseJobStatusError(other.to_string())),
        }
    }
}

/// One row of the persistent job table (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub status: JobStatus,
    /// ISO-8601 UTC timestamp of the last write to this record.
    pub last_update: String,
    /// OS pid of the most recent spawn for this job, or 0 if never spawned.
    pub last_pid: u32,
    pub command: String,
    pub cwd: PathBuf,
    pub logdir: PathBuf,
    pub logfile: String,
}

impl JobRecord {
    pub fn stdout_path(&self) -> PathBuf {
        self.logdir.join(format!("{}.stdout", self.logfile))
    }

    pub fn stderr_path(&self) -> PathBuf {
        self.logdir.join(format!("{}.stderr", self.logfile))
    }

    /// Wall-clock time elapsed since `last_update`. Returns `Duration::ZERO`
    /// if `last_update` can't be parsed as RFC3339 (never true for a record
    /// this crate wrote itself) or is in the future.
    pub fn age(&self) -> std::time::Duration {
        match chrono::DateTime::parse_from_rfc3339(&self.last_update) {
            Ok(last_update) => chrono::Utc::now()
                .signed_duration_since(last_update)
                .to_std()
                .unwrap_or(std::time::Duration::ZERO),
            Err(_) => std::time::Duration::ZERO,
        }
    }
}

/// A partial-record equality predicate for [`crate::store::RecordStore::list`].
///
/// Every `Some` field must match exactly; `None` fields are ignored. The
/// default (all `None`) matches every record.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub job_id: Option<String>,
    pub status: Option<JobStatus>,
    pub last_pid: Option<u32>,
    pub command: Option<String>,
    pub cwd: Option<PathBuf>,
    pub logdir: Option<PathBuf>,
    pub logfile: Option<String>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Returns true if `record` satisfies every `Some` field of this filter.
    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some(job_id) = &self.job_id {
            if job_id != &record.job_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if status != record.status {
                return false;
            }
        }
        if let Some(last_pid) = self.last_pid {
            if last_pid != record.last_pid {
                return false;
            }
        }
        if let Some(command) = &self.command {
            if command != &record.command {
                return false;
            }
        }
        if let Some(cwd) = &self.cwd {
            if cwd != &record.cwd {
                return false;
            }
        }
        if let Some(logdir) = &self.logdir {
            if logdir != &record.logdir {
                return false;
            }
        }
        if let Some(logfile) = &self.logfile {
            if logfile != &record.logfile {
                return false;
            }
        }
        true
    }
}

/// Current wall-clock time as an ISO-8601 UTC string (spec.md §6).
pub fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
