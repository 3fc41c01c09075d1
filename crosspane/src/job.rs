//! The job model: what the engine schedules, journals and reports on.

use std::time::SystemTime;

use object_storage::{ErrorKind, ObjectUri, StorageMetadata, StoreError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Upload,
    Download,
    Copy,
    Move,
    Delete,
    Mkdir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled)
    }

    /// The legal transition matrix. Status moves monotonically:
    /// `pending → running → (paused ↔ running)* → terminal`, with
    /// cancellation possible from any non-terminal state. `paused →
    /// pending` is the requeue step of resume.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Paused)
                | (Pending, Canceled)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceled)
                | (Paused, Pending)
                | (Paused, Running)
                | (Paused, Canceled)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&StoreError> for JobError {
    fn from(err: &StoreError) -> Self {
        JobError {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub allow_foreign_mounts: bool,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: Option<StorageMetadata>,
    /// Server-side copies failing with `etagChanged` are retried only when
    /// the caller asked for it here.
    #[serde(default)]
    pub retry_etag_changed: bool,
}

/// What a caller submits to the engine.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub kind: JobKind,
    pub source: ObjectUri,
    pub destination: Option<ObjectUri>,
    pub options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub source: ObjectUri,
    pub destination: Option<ObjectUri>,
    pub status: JobStatus,
    pub progress: JobProgress,
    pub created_at: SystemTime,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
    pub error: Option<JobError>,
    #[serde(default)]
    pub options: JobOptions,
    /// Opaque backend data letting an interrupted transfer continue
    /// (resumable session URL, multipart upload id).
    #[serde(default)]
    pub resume_token: Option<String>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Job {
            id: Uuid::new_v4(),
            kind: spec.kind,
            source: spec.source,
            destination: spec.destination,
            status: JobStatus::Pending,
            progress: JobProgress::default(),
            created_at: SystemTime::now(),
            started_at: None,
            finished_at: None,
            error: None,
            options: spec.options,
            resume_token: None,
        }
    }

    /// Applies a status transition, maintaining the timestamp invariants:
    /// `started_at` is set once on the first move to running, and exactly
    /// one `finished_at` is set when a terminal state is reached.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), StoreError> {
        if !self.status.can_transition_to(next) {
            return Err(StoreError::new(
                ErrorKind::Internal,
                format!("illegal job transition {} -> {next}", self.status),
            ));
        }
        self.status = next;
        match next {
            JobStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(SystemTime::now());
                }
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled => {
                debug_assert!(self.finished_at.is_none());
                self.finished_at = Some(SystemTime::now());
            }
            JobStatus::Pending | JobStatus::Paused => {}
        }
        Ok(())
    }

    /// Startup recovery for a journal entry: pending and paused jobs are
    /// requeued, an interrupted running job survives only if the backend
    /// left a resume token behind.
    pub fn recover_after_restart(mut self) -> Self {
        match self.status {
            JobStatus::Pending | JobStatus::Paused => {
                self.status = JobStatus::Pending;
                self
            }
            JobStatus::Running => {
                if self.resume_token.is_some() {
                    self.status = JobStatus::Pending;
                } else {
                    self.status = JobStatus::Failed;
                    self.finished_at = Some(SystemTime::now());
                    self.error = Some(JobError {
                        kind: ErrorKind::Interrupted,
                        message: "interrupted: the engine stopped while this job was running"
                            .to_string(),
                    });
                }
                self
            }
            _ => self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> JobSpec {
        JobSpec {
            kind: JobKind::Copy,
            source: ObjectUri::parse("file:///tmp/a").unwrap(),
            destination: Some(ObjectUri::parse("file:///tmp/b").unwrap()),
            options: JobOptions::default(),
        }
    }

    #[test]
    fn lifecycle_timestamps() {
        let mut job = Job::new(spec());
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.started_at.is_none());

        job.transition(JobStatus::Running).unwrap();
        let started = job.started_at.expect("set on first run");

        job.transition(JobStatus::Paused).unwrap();
        job.transition(JobStatus::Running).unwrap();
        assert_eq!(job.started_at, Some(started), "started_at is set once");
        assert!(job.finished_at.is_none());

        job.transition(JobStatus::Completed).unwrap();
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut job = Job::new(spec());
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Canceled).unwrap();
        assert!(job.transition(JobStatus::Running).is_err());
        assert!(job.transition(JobStatus::Pending).is_err());
    }

    #[test]
    fn illegal_shortcuts_rejected() {
        let mut job = Job::new(spec());
        assert!(job.transition(JobStatus::Completed).is_err());
        let mut job = Job::new(spec());
        job.transition(JobStatus::Running).unwrap();
        assert!(job.transition(JobStatus::Pending).is_err());
    }

    #[test]
    fn recovery_rules() {
        let mut running = Job::new(spec());
        running.transition(JobStatus::Running).unwrap();
        let recovered = running.clone().recover_after_restart();
        assert_eq!(recovered.status, JobStatus::Failed);
        assert_eq!(recovered.error.as_ref().unwrap().kind, ErrorKind::Interrupted);
        assert!(recovered.finished_at.is_some());

        running.resume_token = Some("session-url".into());
        let recovered = running.recover_after_restart();
        assert_eq!(recovered.status, JobStatus::Pending);

        let mut paused = Job::new(spec());
        paused.transition(JobStatus::Running).unwrap();
        paused.transition(JobStatus::Paused).unwrap();
        assert_eq!(paused.recover_after_restart().status, JobStatus::Pending);

        let mut done = Job::new(spec());
        done.transition(JobStatus::Running).unwrap();
        done.transition(JobStatus::Completed).unwrap();
        assert_eq!(done.recover_after_restart().status, JobStatus::Completed);
    }

    #[test]
    fn journal_roundtrip() {
        let mut job = Job::new(spec());
        job.transition(JobStatus::Running).unwrap();
        job.resume_token = Some("upload-id-123".into());
        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: Job = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, job);
    }
}
