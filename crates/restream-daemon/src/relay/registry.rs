//! In-memory registry of stream jobs.
//!
//! Jobs are inserted once and kept for the lifetime of the daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::info;

use super::job::{StatusSnapshot, StreamJob};
use super::launcher::ProcessLauncher;

/// Errors from registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Stream not found: {id}")]
    NotFound { id: String },

    #[error("Stream already registered: {id}")]
    DuplicateId { id: String },
}

/// Thread-safe registry of stream jobs, shared by all request handlers.
#[derive(Clone)]
pub struct StreamRegistry {
    jobs: Arc<RwLock<HashMap<String, Arc<StreamJob>>>>,
    launcher: Arc<ProcessLauncher>,
}

impl StreamRegistry {
    pub fn new(launcher: ProcessLauncher) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            launcher: Arc::new(launcher),
        }
    }

    /// Register a new `preparing` job. Does not start it.
    pub async fn create(
        &self,
        source_path: PathBuf,
        destination_key: String,
        title: Option<String>,
    ) -> Arc<StreamJob> {
        let job = Arc::new(StreamJob::new(source_path, destination_key, title));
        self.jobs
            .write()
            .await
            .insert(job.id().to_string(), Arc::clone(&job));
        info!(stream_id = %job.id(), title = %job.title(), "Stream registered");
        job
    }

    /// Register a new `preparing` job under an id allocated by the caller,
    /// e.g. one already embedded in the stored upload's filename.
    pub async fn create_with_id(
        &self,
        id: String,
        source_path: PathBuf,
        destination_key: String,
        title: Option<String>,
    ) -> Result<Arc<StreamJob>, RegistryError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&id) {
            return Err(RegistryError::DuplicateId { id });
        }
        let job = Arc::new(StreamJob::with_id(
            id.clone(),
            source_path,
            destination_key,
            title,
        ));
        jobs.insert(id, Arc::clone(&job));
        drop(jobs);
        info!(stream_id = %job.id(), title = %job.title(), "Stream registered");
        Ok(job)
    }

    /// Start `job` on its own task and return immediately.
    pub fn start_async(&self, job: Arc<StreamJob>) -> JoinHandle<()> {
        let launcher = Arc::clone(&self.launcher);
        tokio::spawn(async move { job.start(&launcher).await })
    }

    /// Snapshots of every registered job, in no particular order.
    pub async fn list(&self) -> Vec<StatusSnapshot> {
        let jobs = self.jobs().await;
        let mut snapshots = Vec::with_capacity(jobs.len());
        for job in jobs {
            snapshots.push(job.snapshot().await);
        }
        snapshots
    }

    pub async fn get(&self, id: &str) -> Result<Arc<StreamJob>, RegistryError> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
    }

    /// Stop one job. `Ok(false)` means it had no running relay.
    pub async fn stop_one(&self, id: &str) -> Result<bool, RegistryError> {
        let job = self.get(id).await?;
        Ok(job.stop().await)
    }

    /// Stop every job that is `streaming` and return how many were stopped.
    ///
    /// Jobs still `starting` are skipped: their relay is not yet registered on
    /// the job and cannot be signalled.
    pub async fn stop_all(&self) -> usize {
        let mut stopped = 0;
        for job in self.jobs().await {
            if job.stop_if_streaming().await {
                stopped += 1;
            }
        }
        info!(stopped, "Stopped all streaming jobs");
        stopped
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }

    /// Clone the job handles out so per-job locks are never taken under the map lock.
    async fn jobs(&self) -> Vec<Arc<StreamJob>> {
        self.jobs.read().await.values().cloned().collect()
    }
}
