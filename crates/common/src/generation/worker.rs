//! Worker pool
//!
//! Runs jobs off the request path. Concurrency is bounded by a semaphore and a
//! job id already executing in this process is never started a second time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::error::GenerationError;
use super::orchestrator::{JobOrchestrator, JobReport};

#[derive(Clone)]
pub struct WorkerPool {
    orchestrator: Arc<JobOrchestrator>,
    permits: Arc<Semaphore>,
    running: Arc<Mutex<HashSet<Uuid>>>,
}

/// Removes the job from the running set when the run ends, even on panic
struct RunningGuard {
    running: Arc<Mutex<HashSet<Uuid>>>,
    job_id: Uuid,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.job_id);
    }
}

impl WorkerPool {
    pub fn new(orchestrator: Arc<JobOrchestrator>, max_concurrent_jobs: usize) -> Self {
        info!(max_concurrent_jobs, "Generation worker pool ready");
        Self {
            orchestrator,
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn orchestrator(&self) -> &Arc<JobOrchestrator> {
        &self.orchestrator
    }

    /// Jobs currently executing in this process
    pub fn in_flight(&self) -> usize {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Run a job once a slot is free
    ///
    /// Returns `None` when the job is already running in this process.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn run(&self, job_id: Uuid) -> Result<Option<JobReport>, GenerationError> {
        let inserted = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id);
        if !inserted {
            debug!("Job already running in this process");
            return Ok(None);
        }
        let _guard = RunningGuard {
            running: self.running.clone(),
            job_id,
        };

        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GenerationError::Store {
                message: "worker pool is shut down".to_string(),
            })?;

        self.orchestrator.run(job_id).await.map(Some)
    }

    /// Run a job in the background
    pub fn spawn(&self, job_id: Uuid) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            match pool.run(job_id).await {
                Ok(Some(report)) => debug!(job_id = %job_id, status = %report.status, "Background job done"),
                Ok(None) => {}
                Err(e) => error!(job_id = %job_id, code = e.code(), error = %e, "Background job errored"),
            }
        })
    }
}
