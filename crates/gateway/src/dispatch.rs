//! Hands accepted jobs to whatever will run them
//!
//! With a generation queue configured, jobs go to SQS for the generation
//! worker. Otherwise they run on an in-process [`WorkerPool`].

use std::sync::Arc;

use tracing::{info, warn};
use zistudy_common::{
    config::{AppConfig, ProcessType},
    errors::{AppError, Result},
    generation::GenerationJob,
    queue::{GenerationJobMessage, Queue, QueueOptions},
    JobOrchestrator, WorkerPool,
};

pub enum Dispatcher {
    Queue(Queue),
    InProcess(WorkerPool),
}

impl Dispatcher {
    pub async fn from_config(config: &AppConfig, orchestrator: Arc<JobOrchestrator>) -> Result<Self> {
        if let Some(options) = QueueOptions::generation(&config.queue) {
            info!(queue_url = %options.url, "Dispatching generation jobs through SQS");
            return Ok(Self::Queue(Queue::new(options).await?));
        }

        if config.server.process_type != ProcessType::ApiWithWorker {
            warn!(
                process_type = ?config.server.process_type,
                "No generation queue configured; running jobs in process"
            );
        }
        Ok(Self::InProcess(WorkerPool::new(
            orchestrator,
            config.generation.max_concurrent_jobs,
        )))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Queue(_) => "queue",
            Self::InProcess(_) => "in_process",
        }
    }

    /// Start processing a freshly queued job
    ///
    /// On a failed send the caller fails the job and reports it as unavailable.
    pub async fn dispatch(&self, job: &GenerationJob) -> Result<()> {
        match self {
            Self::Queue(queue) => {
                let message = GenerationJobMessage {
                    job_id: job.id,
                    owner_id: job.owner_id.clone(),
                };
                queue.send(&message).await.map_err(|e| AppError::ServiceUnavailable {
                    message: format!("Job {} accepted but could not be enqueued: {}", job.id, e),
                })?;
            }
            Self::InProcess(pool) => {
                pool.spawn(job.id);
            }
        }
        Ok(())
    }
}
