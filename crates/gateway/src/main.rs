//! ZiStudy API Gateway
//!
//! The entry point for study card generation requests.
//! Handles:
//! - Authentication and per-owner job access
//! - Rate limiting on submissions
//! - Job submission, status and cancellation
//! - Observability (logging, metrics)

mod dispatch;
mod handlers;
mod middleware;

use axum::{
    extract::DefaultBodyLimit,
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use zistudy_common::{
    auth::JwtManager,
    config::AppConfig,
    generation::create_client,
    telemetry, DbPool, JobOrchestrator, Repository,
};

use crate::dispatch::Dispatcher;
use crate::middleware::rate_limit::{rate_limit_middleware, RateLimit};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repo: Repository,
    pub orchestrator: Arc<JobOrchestrator>,
    pub dispatcher: Arc<Dispatcher>,
}

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
    info!("Starting ZiStudy API Gateway v{}", zistudy_common::VERSION);

    telemetry::install_metrics_exporter(&config.observability)?;

    // Initialize database connection
    info!("Connecting to database...");
    let db = DbPool::new(&config.database).await?;
    let repo = Repository::new(db);
    let store = Arc::new(repo.clone());

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
    let dispatcher = Arc::new(Dispatcher::from_config(&config, orchestrator.clone()).await?);

    // Create app state
    let state = AppState {
        config: config.clone(),
        repo,
        orchestrator,
        dispatcher,
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Duration::from_secs(
            config.server.shutdown_timeout_secs,
        )))
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    let config = state.config.clone();

    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Submissions are the only expensive route
    let mut generate = post(handlers::generation::generate);
    if config.rate_limit.enabled {
        let limit = RateLimit::new(config.rate_limit.requests_per_second, config.rate_limit.burst);
        generate = generate.layer(from_fn_with_state(limit, rate_limit_middleware));
    }

    // API routes
    let api_routes = Router::new()
        // Health endpoints (no auth)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))

        // Generation endpoints
        .route("/ai/study-cards/generate", generate)

        // Job endpoints
        .route("/jobs/{id}", get(handlers::jobs::get_job))
        .route("/jobs/{id}/cancel", post(handlers::jobs::cancel_job));

    let mut app = Router::new()
        .nest("/v1", api_routes)
        .layer(from_fn(middleware::metrics::track_requests))
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes))
        .layer(TimeoutLayer::new(config.request_timeout()));

    match config.auth.jwt_secret.as_deref().filter(|s| !s.is_empty()) {
        Some(secret) => {
            let manager = Arc::new(JwtManager::new(secret, config.auth.jwt_expiration_secs));
            app = app.layer(Extension(manager));
        }
        None => warn!("auth.jwt_secret not set; all jobs belong to the anonymous owner"),
    }

    app.layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
///
/// In-process jobs are not awaited; they stay `in_progress` and the
/// deadline only bounds how long open connections get to drain.
async fn shutdown_signal(drain: Duration) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }

    tokio::spawn(async move {
        tokio::time::sleep(drain).await;
        warn!(seconds = drain.as_secs(), "Drain deadline passed, exiting");
        std::process::exit(0);
    });
}
