//! The core behind the dual-pane shells: object-store access through the
//! scheme registry, the transfer job engine, and the opaque state store.
//!
//! The TUI and the desktop shell both talk to [`CoreApi`] and nothing
//! else. Calls look synchronous; every long-running transfer goes through
//! the job engine, which owns all concurrency.
#![deny(unsafe_code)]

pub mod config;
pub mod engine;
pub mod events;
pub mod job;
pub mod journal;
pub mod planner;
pub mod providers;
pub mod state_store;

use std::sync::Arc;

use camino::Utf8PathBuf;
use object_storage::registry::{RegistryEntry, StoreRegistry};
use object_storage::{
    GenericObjectStore, ListOptions, ListPage, ObjectInfo, ObjectUri, Scheme, StoreError,
};
use tokio_util::sync::CancellationToken;

pub use config::EngineConfig;
pub use engine::JobEngine;
pub use events::JobEvent;
pub use job::{Job, JobId, JobKind, JobOptions, JobSpec, JobStatus};
pub use state_store::StateStore;

/// Everything a shell needs, in one handle. Cheap to clone.
#[derive(Clone)]
pub struct CoreApi {
    registry: Arc<StoreRegistry>,
    engine: JobEngine,
    state: Arc<StateStore>,
}

impl CoreApi {
    pub async fn new(
        config: EngineConfig,
        registry: Arc<StoreRegistry>,
        state_path: Utf8PathBuf,
    ) -> anyhow::Result<Self> {
        let engine = JobEngine::new(config, Arc::clone(&registry)).await?;
        Ok(CoreApi {
            registry,
            engine,
            state: Arc::new(StateStore::new(state_path)),
        })
    }

    // --- providers ---

    pub fn list_providers(&self) -> Vec<RegistryEntry> {
        self.registry.entries()
    }

    pub fn set_provider(
        &self,
        scheme: Scheme,
        store: Arc<GenericObjectStore>,
        profile_id: impl Into<String>,
    ) {
        self.registry.register(scheme, store, profile_id);
    }

    pub fn set_provider_enabled(&self, scheme: Scheme, enabled: bool) -> Result<(), StoreError> {
        self.registry.set_enabled(scheme, enabled)
    }

    /// Builds the backend for a stored profile and installs it.
    pub async fn register_profile(
        &self,
        profile: &credstore::ProviderProfile,
    ) -> anyhow::Result<()> {
        providers::register_profile(&self.registry, profile).await
    }

    // --- direct listings (cheap, not jobs) ---

    pub async fn list(
        &self,
        uri: &ObjectUri,
        opts: &ListOptions,
        cancel: &CancellationToken,
    ) -> Result<ListPage, StoreError> {
        self.registry.resolve(uri)?.list(uri, opts, cancel).await
    }

    pub async fn stat(
        &self,
        uri: &ObjectUri,
        cancel: &CancellationToken,
    ) -> Result<ObjectInfo, StoreError> {
        self.registry.resolve(uri)?.stat(uri, cancel).await
    }

    // --- jobs ---

    pub async fn enqueue_job(&self, spec: JobSpec) -> Result<JobId, StoreError> {
        self.engine.enqueue(spec).await
    }

    pub async fn cancel_job(&self, id: JobId) -> Result<(), StoreError> {
        self.engine.cancel(id).await
    }

    pub async fn pause_job(&self, id: JobId) -> Result<(), StoreError> {
        self.engine.pause(id).await
    }

    pub async fn resume_job(&self, id: JobId) -> Result<(), StoreError> {
        self.engine.resume(id).await
    }

    pub fn get_job(&self, id: JobId) -> Option<Job> {
        self.engine.get_job(id)
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.engine.list_jobs()
    }

    pub fn subscribe_job_events(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.engine.subscribe()
    }

    // --- shell state ---

    pub async fn load_state(&self) -> anyhow::Result<Option<Vec<u8>>> {
        self.state.load().await
    }

    pub async fn save_state(&self, body: &[u8]) -> anyhow::Result<()> {
        self.state.save(body).await
    }
}
