//! Durable job journal.
//!
//! The whole job table is serialized to one JSON document and rewritten
//! atomically: after every status change, and at most once per configured
//! interval while progress is streaming. Startup replays the journal
//! through the per-job recovery rules.

use std::sync::Mutex;

use tokio::time::Instant;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::job::Job;

#[derive(Serialize, Deserialize, Default)]
struct JournalDoc {
    jobs: Vec<Job>,
}

pub struct JobJournal {
    path: Utf8PathBuf,
    progress_interval: std::time::Duration,
    last_progress_write: Mutex<Option<Instant>>,
}

impl JobJournal {
    pub fn new(path: Utf8PathBuf, progress_interval: std::time::Duration) -> Self {
        Self {
            path,
            progress_interval,
            last_progress_write: Mutex::new(None),
        }
    }

    pub async fn load(&self) -> anyhow::Result<Vec<Job>> {
        let body = match tokio::fs::read(&self.path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let doc: JournalDoc = serde_json::from_slice(&body)?;
        Ok(doc.jobs)
    }

    /// Unconditional write, used on every status change.
    pub async fn persist(&self, jobs: Vec<Job>) {
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!("could not create journal directory {parent}: {e}");
                return;
            }
        }
        let doc = JournalDoc { jobs };
        let body = match serde_json::to_vec_pretty(&doc) {
            Ok(body) => body,
            Err(e) => {
                warn!("could not serialize the job journal: {e}");
                return;
            }
        };
        if let Err(e) = utils::crashsafe::overwrite(&self.path, &body).await {
            warn!("could not persist the job journal to {}: {e}", self.path);
        }
        *self.last_progress_write.lock().unwrap() = Some(Instant::now());
    }

    /// Rate-limited write for progress updates. Returns whether a write
    /// actually happened.
    pub async fn persist_throttled(&self, jobs: Vec<Job>) -> bool {
        {
            let last = self.last_progress_write.lock().unwrap();
            if let Some(last) = *last {
                if last.elapsed() < self.progress_interval {
                    return false;
                }
            }
        }
        self.persist(jobs).await;
        true
    }

    /// Sync check used by callers that want to skip cloning the job table
    /// when no write would happen anyway.
    pub fn would_write(&self) -> bool {
        let last = self.last_progress_write.lock().unwrap();
        match *last {
            Some(last) => last.elapsed() >= self.progress_interval,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use object_storage::ObjectUri;

    use super::*;
    use crate::job::{JobKind, JobOptions, JobSpec, JobStatus};

    fn job() -> Job {
        Job::new(JobSpec {
            kind: JobKind::Delete,
            source: ObjectUri::parse("s3://b/key").unwrap(),
            destination: None,
            options: JobOptions::default(),
        })
    }

    #[tokio::test]
    async fn load_absent_journal_is_empty() {
        let dir = camino_tempfile::tempdir().unwrap();
        let journal = JobJournal::new(dir.path().join("jobs.json"), Duration::from_secs(1));
        assert!(journal.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persist_then_load_roundtrips() {
        let dir = camino_tempfile::tempdir().unwrap();
        let journal = JobJournal::new(dir.path().join("jobs.json"), Duration::from_secs(1));

        let mut stored = job();
        stored.transition(JobStatus::Running).unwrap();
        journal.persist(vec![stored.clone()]).await;

        let loaded = journal.load().await.unwrap();
        assert_eq!(loaded, vec![stored]);
    }

    #[tokio::test(start_paused = true)]
    async fn progress_writes_are_throttled() {
        let dir = camino_tempfile::tempdir().unwrap();
        let journal = JobJournal::new(dir.path().join("jobs.json"), Duration::from_secs(1));

        assert!(journal.persist_throttled(vec![job()]).await);
        assert!(!journal.persist_throttled(vec![job()]).await);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(journal.persist_throttled(vec![job()]).await);
    }
}
