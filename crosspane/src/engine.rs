//! The job engine: accepts job definitions, schedules them on a bounded
//! worker pool, drives them to a terminal status, emits events, journals
//! every step and supports cancel/pause/resume.
//!
//! Cancellation is cooperative: `cancel` fires the job's token and returns
//! immediately; the worker observes it between chunks and polls, and the
//! job reaches `canceled` within one chunk's worth of work. Pausing rides
//! the same mechanism with a second token, so a paused job gives its
//! worker slot back and re-enters the ready queue on resume.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use object_storage::registry::StoreRegistry;
use object_storage::{
    DeleteOptions, ErrorKind, ObjectUri, ProgressSink, PutOptions, StoreError,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::events::{EventBus, JobEvent};
use crate::job::{Job, JobError, JobId, JobKind, JobSpec, JobStatus};
use crate::journal::JobJournal;
use crate::planner::{self, Strategy};

#[derive(Clone)]
pub struct JobEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<StoreRegistry>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    queue: Mutex<VecDeque<JobId>>,
    queue_notify: Notify,
    events: EventBus,
    journal: JobJournal,
    uri_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    scratch_in_use: AtomicU64,
    shutdown: CancellationToken,
}

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
    pause: CancellationToken,
}

impl JobEntry {
    fn new(job: Job) -> Self {
        JobEntry {
            job,
            cancel: CancellationToken::new(),
            pause: CancellationToken::new(),
        }
    }
}

impl JobEngine {
    /// Loads the journal, applies the restart recovery rules, re-enqueues
    /// surviving jobs and starts the worker pool.
    pub async fn new(config: EngineConfig, registry: Arc<StoreRegistry>) -> anyhow::Result<Self> {
        let journal = JobJournal::new(
            config.journal_path.clone(),
            config.journal_progress_interval,
        );

        let mut recovered: Vec<Job> = journal
            .load()
            .await?
            .into_iter()
            .map(Job::recover_after_restart)
            .collect();
        recovered.sort_by_key(|job| job.created_at);

        let mut jobs = HashMap::new();
        let mut queue = VecDeque::new();
        for job in &recovered {
            if job.status == JobStatus::Pending {
                queue.push_back(job.id);
            }
            jobs.insert(job.id, JobEntry::new(job.clone()));
        }
        if !queue.is_empty() {
            info!("re-enqueued {} jobs from the journal", queue.len());
        }

        let inner = Arc::new(EngineInner {
            events: EventBus::new(config.event_capacity),
            registry,
            jobs: Mutex::new(jobs),
            queue: Mutex::new(queue),
            queue_notify: Notify::new(),
            journal,
            uri_locks: Mutex::new(HashMap::new()),
            scratch_in_use: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            config,
        });
        inner.journal.persist(inner.snapshot()).await;

        for _ in 0..inner.config.workers.max(1) {
            let inner = Arc::clone(&inner);
            tokio::spawn(worker_loop(inner));
        }

        Ok(JobEngine { inner })
    }

    pub async fn enqueue(&self, spec: JobSpec) -> Result<JobId, StoreError> {
        let source_store = self.inner.registry.resolve(&spec.source)?;
        if let Some(destination) = &spec.destination {
            self.inner.registry.resolve(destination)?;
        }
        let strategy = planner::plan(
            spec.kind,
            &spec.source,
            spec.destination.as_ref(),
            &source_store,
        )?;

        // Cross-provider transfers need scratch space; refuse new ones
        // once the quota is spoken for.
        if strategy == Strategy::StreamThrough
            && self.inner.scratch_in_use.load(Ordering::SeqCst)
                >= self.inner.config.scratch_quota_bytes
        {
            return Err(StoreError::new(
                ErrorKind::OutOfScratch,
                "the scratch directory quota is exhausted; wait for running transfers to finish",
            ));
        }

        let job = Job::new(spec);
        let id = job.id;
        let kind = job.kind;
        {
            let mut jobs = self.inner.jobs.lock().unwrap();
            jobs.insert(id, JobEntry::new(job));
        }
        self.inner.events.emit(JobEvent::Created { id, kind });
        self.inner.push_ready(id);
        self.inner.journal.persist(self.inner.snapshot()).await;
        Ok(id)
    }

    /// Signals cancellation and returns immediately. A queued or paused
    /// job flips to `canceled` right here; a running one is interrupted by
    /// its worker within the grace window.
    pub async fn cancel(&self, id: JobId) -> Result<(), StoreError> {
        let emit = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            let entry = jobs
                .get_mut(&id)
                .ok_or_else(|| StoreError::new(ErrorKind::NotFound, format!("no job {id}")))?;
            match entry.job.status {
                JobStatus::Pending | JobStatus::Paused => {
                    entry.job.transition(JobStatus::Canceled)?;
                    true
                }
                JobStatus::Running => {
                    entry.cancel.cancel();
                    false
                }
                _ => false,
            }
        };
        if emit {
            self.inner.events.emit(JobEvent::Canceled { id });
            self.inner.journal.persist(self.inner.snapshot()).await;
        }
        Ok(())
    }

    pub async fn pause(&self, id: JobId) -> Result<(), StoreError> {
        let emit = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            let entry = jobs
                .get_mut(&id)
                .ok_or_else(|| StoreError::new(ErrorKind::NotFound, format!("no job {id}")))?;
            match entry.job.status {
                JobStatus::Pending => {
                    entry.job.transition(JobStatus::Paused)?;
                    true
                }
                JobStatus::Running => {
                    entry.pause.cancel();
                    false
                }
                _ => false,
            }
        };
        if emit {
            self.inner.events.emit(JobEvent::Paused { id });
            self.inner.journal.persist(self.inner.snapshot()).await;
        }
        Ok(())
    }

    /// Requeues a paused job at the tail of the ready queue.
    pub async fn resume(&self, id: JobId) -> Result<(), StoreError> {
        let requeue = {
            let mut jobs = self.inner.jobs.lock().unwrap();
            let entry = jobs
                .get_mut(&id)
                .ok_or_else(|| StoreError::new(ErrorKind::NotFound, format!("no job {id}")))?;
            match entry.job.status {
                JobStatus::Paused => {
                    entry.job.transition(JobStatus::Pending)?;
                    true
                }
                _ => false,
            }
        };
        if requeue {
            self.inner.push_ready(id);
            self.inner.journal.persist(self.inner.snapshot()).await;
        }
        Ok(())
    }

    pub fn get_job(&self, id: JobId) -> Option<Job> {
        self.inner.jobs.lock().unwrap().get(&id).map(|e| e.job.clone())
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .jobs
            .lock()
            .unwrap()
            .values()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Stops the worker pool. Running jobs keep their tokens; a subsequent
    /// engine start applies the journal recovery rules to them.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }
}

impl EngineInner {
    fn push_ready(&self, id: JobId) {
        self.queue.lock().unwrap().push_back(id);
        self.queue_notify.notify_one();
    }

    fn snapshot(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    /// Per-destination-uri serialization: two jobs writing the same uri
    /// run one after the other, disjoint uris run in parallel.
    fn uri_lock(&self, uri: &ObjectUri) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.uri_locks.lock().unwrap();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(uri.to_string()).or_default())
    }

    fn set_resume_token(self: &Arc<Self>, id: JobId, token: &str) {
        {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(entry) = jobs.get_mut(&id) {
                entry.job.resume_token = Some(token.to_string());
            }
        }
        // The token must hit disk before much of the transfer happens,
        // otherwise a crash forgets how to resume.
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.journal.persist(inner.snapshot()).await;
        });
    }
}

async fn worker_loop(inner: Arc<EngineInner>) {
    loop {
        let id = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            id = next_ready(&inner) => id,
        };
        run_job(&inner, id).await;
    }
}

async fn next_ready(inner: &EngineInner) -> JobId {
    loop {
        let notified = inner.queue_notify.notified();
        if let Some(id) = inner.queue.lock().unwrap().pop_front() {
            return id;
        }
        notified.await;
    }
}

async fn run_job(inner: &Arc<EngineInner>, id: JobId) {
    // Claim the job. Anything that is no longer pending was canceled or
    // paused while it sat in the queue.
    let (job, cancel, pause, resumed) = {
        let mut jobs = inner.jobs.lock().unwrap();
        let Some(entry) = jobs.get_mut(&id) else { return };
        if entry.job.status != JobStatus::Pending {
            return;
        }
        let resumed = entry.job.started_at.is_some();
        if entry.job.transition(JobStatus::Running).is_err() {
            return;
        }
        (
            entry.job.clone(),
            entry.cancel.clone(),
            entry.pause.clone(),
            resumed,
        )
    };
    if resumed {
        inner.events.emit(JobEvent::Resumed { id });
    } else {
        inner.events.emit(JobEvent::Started { id });
    }
    inner.journal.persist(inner.snapshot()).await;

    // Backend calls see one token; it fires on either cancel or pause.
    let op_cancel = CancellationToken::new();
    let forwarder = tokio::spawn({
        let op_cancel = op_cancel.clone();
        let cancel = cancel.clone();
        let pause = pause.clone();
        async move {
            tokio::select! {
                _ = cancel.cancelled() => op_cancel.cancel(),
                _ = pause.cancelled() => op_cancel.cancel(),
            }
        }
    });

    let progress = EngineProgress::new(Arc::clone(inner), id);
    let result = execute(inner, &job, &progress, &op_cancel).await;
    forwarder.abort();

    let event = {
        let mut jobs = inner.jobs.lock().unwrap();
        let Some(entry) = jobs.get_mut(&id) else { return };
        match &result {
            Ok(()) => {
                entry.job.error = None;
                entry.job.resume_token = None;
                match entry.job.transition(JobStatus::Completed) {
                    Ok(()) => Some(JobEvent::Completed { id }),
                    Err(_) => None,
                }
            }
            Err(_) if cancel.is_cancelled() => match entry.job.transition(JobStatus::Canceled) {
                Ok(()) => Some(JobEvent::Canceled { id }),
                Err(_) => None,
            },
            Err(_) if pause.is_cancelled() => {
                // The pause token is spent; arm a fresh one for the next run.
                entry.pause = CancellationToken::new();
                match entry.job.transition(JobStatus::Paused) {
                    Ok(()) => Some(JobEvent::Paused { id }),
                    Err(_) => None,
                }
            }
            Err(e) => {
                entry.job.error = Some(JobError::from(e));
                match entry.job.transition(JobStatus::Failed) {
                    Ok(()) => Some(JobEvent::Failed {
                        id,
                        kind: e.kind(),
                        message: e.to_string(),
                    }),
                    Err(_) => None,
                }
            }
        }
    };
    if let Some(event) = event {
        inner.events.emit(event);
    }
    inner.journal.persist(inner.snapshot()).await;
}

fn is_retryable(err: &StoreError, job: &Job) -> bool {
    err.is_transient() || (err.kind() == ErrorKind::EtagChanged && job.options.retry_etag_changed)
}

async fn execute(
    inner: &Arc<EngineInner>,
    job: &Job,
    progress: &EngineProgress,
    cancel: &CancellationToken,
) -> Result<(), StoreError> {
    let source_store = inner.registry.resolve(&job.source)?;
    let strategy = planner::plan(job.kind, &job.source, job.destination.as_ref(), &source_store)?;

    let lock_target = job.destination.clone().unwrap_or_else(|| job.source.clone());
    let uri_lock = inner.uri_lock(&lock_target);
    let _uri_guard = tokio::select! {
        guard = uri_lock.lock() => guard,
        _ = cancel.cancelled() => return Err(StoreError::cancelled()),
    };

    // The transfer phase retries transient failures with backoff; a
    // checksum mismatch gets exactly one extra attempt.
    let retry = &inner.config.retry;
    let mut attempt: u32 = 0;
    let mut checksum_retries: u32 = 0;
    loop {
        match execute_transfer(inner, job, strategy, progress, cancel).await {
            Ok(()) => break,
            Err(e) if cancel.is_cancelled() => return Err(e),
            Err(e) if e.kind() == ErrorKind::ChecksumMismatch && checksum_retries == 0 => {
                checksum_retries += 1;
                warn!("job {}: checksum mismatch, retrying the transfer once: {e}", job.id);
            }
            Err(e) if is_retryable(&e, job) && attempt + 1 < retry.max_attempts => {
                attempt += 1;
                if attempt >= retry.warn_threshold {
                    warn!("job {}: attempt {attempt} failed, backing off: {e}", job.id);
                } else {
                    info!("job {}: attempt {attempt} failed, backing off: {e}", job.id);
                }
                utils::backoff::exponential_backoff(
                    attempt,
                    retry.base_millis,
                    retry.max_millis,
                    cancel,
                )
                .await;
                if cancel.is_cancelled() {
                    return Err(StoreError::cancelled());
                }
            }
            Err(e) => return Err(e),
        }
    }

    // Move epilogue. The destination is committed at this point; source
    // deletion runs once, un-retried, and its failure is reported in a way
    // that makes clear both copies exist.
    if job.kind == JobKind::Move && !matches!(strategy, Strategy::Direct | Strategy::LocalCopy) {
        if let Err(e) = source_store
            .delete(&job.source, &DeleteOptions::default(), cancel)
            .await
        {
            return Err(StoreError::new(
                e.kind(),
                format!(
                    "the move copied {} to {} but failed to delete the source; \
                     both source and destination exist now: {e}",
                    job.source,
                    job.destination.as_ref().expect("moves have a destination"),
                ),
            ));
        }
    }
    Ok(())
}

async fn execute_transfer(
    inner: &Arc<EngineInner>,
    job: &Job,
    strategy: Strategy,
    progress: &EngineProgress,
    cancel: &CancellationToken,
) -> Result<(), StoreError> {
    let source_store = inner.registry.resolve(&job.source)?;
    match strategy {
        Strategy::Direct => match job.kind {
            JobKind::Delete => {
                source_store
                    .delete(
                        &job.source,
                        &DeleteOptions {
                            recursive: job.options.recursive,
                            allow_foreign_mounts: job.options.allow_foreign_mounts,
                        },
                        cancel,
                    )
                    .await
            }
            JobKind::Mkdir => source_store.mkdir(&job.source, cancel).await,
            kind => Err(StoreError::new(
                ErrorKind::Internal,
                format!("{kind:?} cannot execute as a direct call"),
            )),
        },
        Strategy::LocalCopy => {
            let destination = job.destination.as_ref().expect("planned with destination");
            if job.kind == JobKind::Move {
                source_store
                    .move_object(&job.source, destination, progress, cancel)
                    .await?;
            } else {
                source_store
                    .copy(&job.source, destination, progress, cancel)
                    .await?;
            }
            Ok(())
        }
        Strategy::Upload => {
            let destination = job.destination.as_ref().expect("planned with destination");
            let destination_store = inner.registry.resolve(destination)?;
            let opts = put_options(inner, job);
            destination_store
                .put(&job.source.local_path(), destination, &opts, progress, cancel)
                .await?;
            Ok(())
        }
        Strategy::Download => {
            let destination = job.destination.as_ref().expect("planned with destination");
            source_store
                .get(&job.source, &destination.local_path(), progress, cancel)
                .await
        }
        Strategy::ServerSide => {
            let destination = job.destination.as_ref().expect("planned with destination");
            match source_store
                .copy(&job.source, destination, progress, cancel)
                .await
            {
                Ok(_) => Ok(()),
                // No server-side path on this backend: go through scratch.
                Err(e) if e.kind() == ErrorKind::NotImplemented => {
                    stream_through(inner, job, progress, cancel).await
                }
                Err(e) => Err(e),
            }
        }
        Strategy::StreamThrough => stream_through(inner, job, progress, cancel).await,
    }
}

/// Download-then-upload through the scratch directory, with the scratch
/// bytes reserved against the quota for the duration.
async fn stream_through(
    inner: &Arc<EngineInner>,
    job: &Job,
    progress: &EngineProgress,
    cancel: &CancellationToken,
) -> Result<(), StoreError> {
    let destination = job.destination.as_ref().expect("planned with destination");
    let source_store = inner.registry.resolve(&job.source)?;
    let destination_store = inner.registry.resolve(destination)?;

    let size = source_store.stat(&job.source, cancel).await?.size;
    let _reservation = ScratchReservation::take(inner, size)?;

    tokio::fs::create_dir_all(&inner.config.scratch_dir)
        .await
        .map_err(|e| {
            StoreError::new(
                ErrorKind::Internal,
                format!("could not create the scratch directory: {e}"),
            )
        })?;
    let temp_path = inner.config.scratch_dir.join(format!("{}.stream", job.id));

    let result = async {
        source_store
            .get(&job.source, &temp_path, progress, cancel)
            .await?;
        let opts = put_options(inner, job);
        destination_store
            .put(&temp_path, destination, &opts, progress, cancel)
            .await?;
        Ok(())
    }
    .await;

    match tokio::fs::remove_file(&temp_path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("could not remove scratch file {temp_path}: {e}"),
    }
    result
}

fn put_options(inner: &Arc<EngineInner>, job: &Job) -> PutOptions {
    // Pick the freshest resume token: a previous attempt in this very
    // process may have stored one after our snapshot was taken.
    let resume_token = inner
        .jobs
        .lock()
        .unwrap()
        .get(&job.id)
        .and_then(|entry| entry.job.resume_token.clone());

    let sink_inner = Arc::clone(inner);
    let id = job.id;
    PutOptions {
        content_type: job.options.content_type.clone(),
        metadata: job.options.metadata.clone(),
        resume_token,
        resume_sink: Some(Arc::new(move |token: &str| {
            sink_inner.set_resume_token(id, token);
        })),
        part_concurrency: Some(inner.config.part_concurrency),
    }
}

struct ScratchReservation {
    inner: Arc<EngineInner>,
    bytes: u64,
}

impl ScratchReservation {
    fn take(inner: &Arc<EngineInner>, bytes: u64) -> Result<Self, StoreError> {
        let previous = inner.scratch_in_use.fetch_add(bytes, Ordering::SeqCst);
        if previous + bytes > inner.config.scratch_quota_bytes {
            inner.scratch_in_use.fetch_sub(bytes, Ordering::SeqCst);
            return Err(StoreError::new(
                ErrorKind::OutOfScratch,
                format!(
                    "the transfer needs {bytes} scratch bytes but the quota is exhausted; \
                     wait for running transfers to finish"
                ),
            ));
        }
        Ok(ScratchReservation {
            inner: Arc::clone(inner),
            bytes,
        })
    }
}

impl Drop for ScratchReservation {
    fn drop(&mut self) {
        self.inner.scratch_in_use.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// Progress sink handed to the backends for one job run: clamps values to
/// stay monotonic across the phases of a stream-through, throttles the
/// event stream, and lets the journal persist at its own cadence.
struct EngineProgress {
    inner: Arc<EngineInner>,
    id: JobId,
    high_water: AtomicU64,
    last_event: Mutex<Option<tokio::time::Instant>>,
}

impl EngineProgress {
    fn new(inner: Arc<EngineInner>, id: JobId) -> Self {
        EngineProgress {
            inner,
            id,
            high_water: AtomicU64::new(0),
            last_event: Mutex::new(None),
        }
    }
}

impl ProgressSink for EngineProgress {
    fn report(&self, bytes_done: u64, bytes_total: Option<u64>) {
        let clamped = self.high_water.fetch_max(bytes_done, Ordering::SeqCst).max(bytes_done);

        {
            let mut jobs = self.inner.jobs.lock().unwrap();
            if let Some(entry) = jobs.get_mut(&self.id) {
                entry.job.progress.bytes_done = clamped;
                if bytes_total.is_some() {
                    entry.job.progress.bytes_total = bytes_total;
                }
            }
        }

        let complete = bytes_total == Some(clamped);
        let should_emit = complete || {
            let mut last = self.last_event.lock().unwrap();
            let now = tokio::time::Instant::now();
            match *last {
                Some(prev) if now - prev < self.inner.config.progress_event_interval => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };
        if should_emit {
            self.inner.events.emit(JobEvent::Progress {
                id: self.id,
                bytes_done: clamped,
                bytes_total,
            });
        }

        if self.inner.journal.would_write() {
            let inner = Arc::clone(&self.inner);
            let jobs = inner.snapshot();
            tokio::spawn(async move {
                inner.journal.persist_throttled(jobs).await;
            });
        }
    }
}
