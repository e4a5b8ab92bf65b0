//! ZiStudy Common Library
//!
//! Shared code for the gateway and the generation worker:
//! - The study card generation pipeline
//! - Database models and repository
//! - Error types and handling
//! - Configuration management
//! - Authentication utilities
//! - Metrics, logging and queue plumbing

pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod generation;
pub mod metrics;
pub mod queue;
pub mod telemetry;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, Repository};
pub use errors::{AppError, Result};
pub use generation::{GenerationError, JobOrchestrator, WorkerPool};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
