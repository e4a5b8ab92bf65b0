//! Generation worker processor
//!
//! Turns one SQS message into one orchestrator run and decides what happens
//! to the message afterwards.

use aws_sdk_sqs::types::Message;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use zistudy_common::{
    generation::{GenerationError, JobReport},
    metrics,
    queue::{GenerationJobMessage, Queue},
    WorkerPool,
};

/// What to do with a message once its run returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The job is terminal; redelivery would be a no-op
    Delete,
    /// Leave the message to reappear after its visibility timeout
    Release,
}

impl Disposition {
    pub fn for_run(result: &Result<Option<JobReport>, GenerationError>) -> Self {
        match result {
            Ok(Some(report)) if report.status.is_terminal() => Disposition::Delete,
            // Claimed elsewhere, already running here, or a store failure
            _ => Disposition::Release,
        }
    }
}

/// Result of handling one message, for the poll loop's circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Ok,
    Failed,
}

pub struct GenerationProcessor {
    queue: Queue,
    pool: WorkerPool,
    heartbeat: Duration,
    visibility_timeout: i32,
}

impl GenerationProcessor {
    /// `visibility_timeout_secs` is re-applied every half timeout while a job runs
    pub fn new(queue: Queue, pool: WorkerPool, visibility_timeout_secs: u64) -> Self {
        let visibility_timeout = i32::try_from(visibility_timeout_secs).unwrap_or(i32::MAX).max(2);
        Self {
            queue,
            pool,
            heartbeat: Duration::from_secs((visibility_timeout / 2) as u64),
            visibility_timeout,
        }
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Handle one received message
    #[instrument(skip(self, message), fields(message_id = ?message.message_id))]
    pub async fn handle(&self, message: Message) -> Handled {
        let Some(receipt) = message.receipt_handle.clone() else {
            warn!("Message without receipt handle, skipping");
            return Handled::Ok;
        };

        let job = match Queue::parse_message::<GenerationJobMessage>(&message) {
            Ok(job) => job,
            Err(e) => {
                warn!(error = %e, "Unreadable generation message, dead-lettering");
                metrics::record_queue_message("malformed");
                if let Err(e) = self.queue.dead_letter(&message).await {
                    error!(error = %e, "Failed to dead-letter message");
                    return Handled::Failed;
                }
                if let Err(e) = self.queue.delete(&receipt).await {
                    error!(error = %e, "Failed to delete message");
                }
                return Handled::Ok;
            }
        };

        info!(job_id = %job.job_id, owner = %job.owner_id, "Received generation job");
        let result = self.run_with_heartbeat(&job, &receipt).await;

        match Disposition::for_run(&result) {
            Disposition::Delete => {
                metrics::record_queue_message("processed");
                if let Err(e) = self.queue.delete(&receipt).await {
                    error!(job_id = %job.job_id, error = %e, "Failed to delete message");
                }
                Handled::Ok
            }
            Disposition::Release => match result {
                Err(e) => {
                    metrics::record_queue_message("failed");
                    error!(
                        job_id = %job.job_id,
                        code = e.code(),
                        error = %e,
                        "Failed to run generation job"
                    );
                    // Message will be re-delivered or moved to DLQ
                    Handled::Failed
                }
                Ok(_) => {
                    metrics::record_queue_message("deferred");
                    debug!(job_id = %job.job_id, "Job is running elsewhere, releasing message");
                    Handled::Ok
                }
            },
        }
    }

    /// Run the job while keeping the message invisible to other consumers
    async fn run_with_heartbeat(
        &self,
        job: &GenerationJobMessage,
        receipt: &str,
    ) -> Result<Option<JobReport>, GenerationError> {
        let run = self.pool.run(job.job_id);
        tokio::pin!(run);

        let mut ticker = tokio::time::interval(self.heartbeat);
        // The first tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.extend_visibility(receipt, self.visibility_timeout).await {
                        warn!(job_id = %job.job_id, error = %e, "Failed to extend message visibility");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use zistudy_common::generation::JobStatus;

    fn report(status: JobStatus) -> JobReport {
        JobReport {
            job_id: Uuid::new_v4(),
            status,
            attempts: 1,
            card_ids: Vec::new(),
            error_code: None,
        }
    }

    #[test]
    fn test_terminal_jobs_are_deleted() {
        for status in JobStatus::TERMINAL {
            assert_eq!(Disposition::for_run(&Ok(Some(report(status)))), Disposition::Delete);
        }
    }

    #[test]
    fn test_running_jobs_are_released() {
        assert_eq!(
            Disposition::for_run(&Ok(Some(report(JobStatus::InProgress)))),
            Disposition::Release
        );
        assert_eq!(Disposition::for_run(&Ok(None)), Disposition::Release);
    }

    #[test]
    fn test_store_errors_are_released() {
        let err = GenerationError::Store {
            message: "connection reset".to_string(),
        };
        assert_eq!(Disposition::for_run(&Err(err)), Disposition::Release);
    }
}
