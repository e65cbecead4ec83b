//! Job records, log entries, and the update payload shared by the event bus
//! and subscriptions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// What a job asks the wrapped binary to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Text-to-image generation.
    Generate,
    /// Model weight conversion / quantization.
    Convert,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Generate => "generate",
            Self::Convert => "convert",
        };
        f.write_str(s)
    }
}

impl FromStr for JobKind {
    type Err = KindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "generate" => Ok(Self::Generate),
            "convert" => Ok(Self::Convert),
            other => Err(KindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobKind`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid job kind: {0:?}")]
pub struct KindParseError(pub String);

// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
///
/// ```text
/// pending -> running
/// pending -> cancelled
/// running -> completed | failed | cancelled
/// ```
///
/// Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether the status is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `from -> to` is an edge in the status graph.
    pub fn can_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Cancelled)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for JobStatus {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`JobStatus`] string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid job status: {0:?}")]
pub struct StatusParseError(pub String);

// ---------------------------------------------------------------------------

/// Which pipe of the child process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Structured progress parsed from a progress-bar line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub current: u64,
    pub total: u64,
    /// `100 * current / total`.
    pub percentage: f64,
    /// Free-text throughput label, e.g. `3.2it/s`.
    pub speed: String,
}

/// One normalized line of child output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub job_id: Uuid,
    /// Position in the job's log. A coalesced progress update keeps the
    /// `seq` of the entry it replaces.
    pub seq: usize,
    pub stream: StreamKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
}

/// A tracked invocation of the wrapped binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// `None` only for bare records created by a log arriving before the
    /// job itself.
    pub kind: Option<JobKind>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
    pub logs: Vec<LogEntry>,
    /// Bumped on every published mutation.
    pub revision: u64,
}

impl Job {
    pub(crate) fn new(id: Uuid, kind: Option<JobKind>) -> Self {
        Self {
            id,
            kind,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            logs: Vec::new(),
            revision: 0,
        }
    }

    /// Result split into its individual file references.
    pub fn result_files(&self) -> impl Iterator<Item = &str> {
        self.result
            .as_deref()
            .into_iter()
            .flat_map(|r| r.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

/// What subscribers of a job observe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobUpdate {
    /// A new log entry, or an in-place update of the tail progress entry.
    Log { entry: LogEntry },
    /// The job reached a terminal status.
    Finished {
        status: JobStatus,
        result: Option<String>,
    },
}

impl JobUpdate {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrips_through_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for to in [
                JobStatus::Pending,
                JobStatus::Running,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!JobStatus::can_transition(terminal, to));
            }
        }
        assert!(!JobStatus::can_transition(JobStatus::Pending, JobStatus::Completed));
        assert!(JobStatus::can_transition(JobStatus::Pending, JobStatus::Cancelled));
    }

    #[test]
    fn kind_parses() {
        assert_eq!("convert".parse::<JobKind>().unwrap(), JobKind::Convert);
        let err = "txt2vid".parse::<JobKind>().unwrap_err();
        assert_eq!(err.to_string(), "invalid job kind: \"txt2vid\"");
    }

    #[test]
    fn update_serializes_with_type_tag() {
        let update = JobUpdate::Finished {
            status: JobStatus::Failed,
            result: Some("boom".to_string()),
        };
        let v = serde_json::to_value(&update).unwrap();
        assert_eq!(v["type"], "finished");
        assert_eq!(v["status"], "failed");
        assert_eq!(v["result"], "boom");
    }

    #[test]
    fn result_files_splits_batch_results() {
        let mut job = Job::new(Uuid::now_v7(), Some(JobKind::Generate));
        job.result = Some("/output/txt2img/a.png,/output/txt2img/a_2.png".to_string());
        let files: Vec<&str> = job.result_files().collect();
        assert_eq!(files, vec!["/output/txt2img/a.png", "/output/txt2img/a_2.png"]);
    }
}
