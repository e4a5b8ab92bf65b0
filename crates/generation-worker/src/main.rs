//! ZiStudy Generation Worker
//!
//! Processes generation jobs from the SQS queue:
//! 1. Receives a job reference from the queue
//! 2. Runs the job through the orchestrator on a bounded pool
//! 3. Deletes the message once the job is terminal
//!
//! Messages for jobs that fail to run stay on the queue; the redrive policy
//! moves them to the DLQ after repeated failures.

mod processor;

use crate::processor::{GenerationProcessor, Handled};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use zistudy_common::{
    config::AppConfig,
    generation::create_client,
    queue::{Queue, QueueOptions},
    telemetry, DbPool, JobOrchestrator, Repository, WorkerPool, VERSION,
};

const MAX_FAILURES: u32 = 5;
const CIRCUIT_BREAK_DURATION: Duration = Duration::from_secs(30);
const RECEIVE_ERROR_PAUSE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;
    let config = Arc::new(config);

    telemetry::init_tracing(&config.observability);
    info!("Starting ZiStudy Generation Worker v{}", VERSION);

    telemetry::install_metrics_exporter(&config.observability)?;

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    let store = Arc::new(Repository::new(db));

    let provider = create_client(&config.generation)?;
    info!(
        provider = %config.generation.provider,
        model = %provider.model_name(),
        "Generative client ready"
    );

    let orchestrator = Arc::new(JobOrchestrator::from_config(
        &config,
        store.clone(),
        store,
        provider,
    ));
    let pool = WorkerPool::new(orchestrator, config.generation.max_concurrent_jobs);

    let Some(options) = QueueOptions::generation(&config.queue) else {
        warn!("queue.generation_queue_url not set, waiting for shutdown signal...");
        tokio::signal::ctrl_c().await?;
        info!("Generation worker shutting down");
        return Ok(());
    };

    let envelope = config.generation.job_time_envelope();
    if Duration::from_secs(config.queue.visibility_timeout_secs) < envelope {
        info!(
            envelope_secs = envelope.as_secs(),
            visibility_secs = config.queue.visibility_timeout_secs,
            "Jobs may outlive the visibility timeout; it is extended while they run"
        );
    }

    info!(url = %options.url, "Connecting to generation queue...");
    let processor = GenerationProcessor::new(
        Queue::new(options).await?,
        pool,
        config.queue.visibility_timeout_secs,
    );

    info!("Generation worker ready, starting queue polling...");

    // Circuit breaker state
    let mut consecutive_failures = 0;

    loop {
        // Circuit breaker check
        if consecutive_failures >= MAX_FAILURES {
            warn!(
                failures = consecutive_failures,
                "Circuit breaker open, pausing..."
            );
            tokio::time::sleep(CIRCUIT_BREAK_DURATION).await;
            consecutive_failures = 0;
            info!("Circuit breaker reset, resuming...");
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            result = processor.queue().receive() => {
                match result {
                    Ok(messages) if messages.is_empty() => {}
                    Ok(messages) => {
                        // The pool's permits bound how many of these actually run at once
                        let outcomes = join_all(messages.into_iter().map(|m| processor.handle(m))).await;
                        for outcome in outcomes {
                            match outcome {
                                Handled::Ok => consecutive_failures = 0,
                                Handled::Failed => consecutive_failures += 1,
                            }
                        }
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(error = %e, "Failed to receive messages from queue");
                        tokio::time::sleep(RECEIVE_ERROR_PAUSE).await;
                    }
                }
            }
        }
    }

    info!(in_flight = processor.pool().in_flight(), "Generation worker shutting down");
    Ok(())
}
