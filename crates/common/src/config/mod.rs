//! Configuration management for ZiStudy services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::generation::PdfMode;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Queue configuration (SQS)
    #[serde(default)]
    pub queue: QueueConfig,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Generative model and retry policy
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Uploaded document limits and PDF handling
    #[serde(default)]
    pub documents: DocumentConfig,
}

/// Which roles a process takes on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessType {
    /// HTTP only; jobs are dispatched through the queue
    Api,
    /// Queue consumer only
    Worker,
    /// HTTP plus an in-process worker pool
    ApiWithWorker,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum request body size (multipart uploads included)
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Process role
    #[serde(default = "default_process_type")]
    pub process_type: ProcessType,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Replica for existing-card lookups; job state always uses the primary
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// SQS generation queue URL
    pub generation_queue_url: Option<String>,

    /// Dead letter queue URL
    pub dlq_url: Option<String>,

    /// Maximum messages to receive per poll
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: u32,

    /// Long polling timeout in seconds
    #[serde(default = "default_queue_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Visibility timeout in seconds
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// JWT secret for token validation
    pub jwt_secret: Option<String>,

    /// JWT expiration in seconds
    #[serde(default = "default_jwt_expiration")]
    pub jwt_expiration_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Generation submissions per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    /// Generative provider: gemini, mock
    #[serde(default = "default_generation_provider")]
    pub provider: String,

    /// API key for the provider
    pub api_key: Option<String>,

    /// API base URL
    #[serde(default = "default_generation_endpoint")]
    pub endpoint: String,

    /// Default model identifier
    #[serde(default = "default_generation_model")]
    pub model: String,

    /// Default sampling temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Cards generated when the request omits a count
    #[serde(default = "default_card_count")]
    pub default_card_count: u32,

    /// Hard ceiling on cards per request
    #[serde(default = "default_max_card_count")]
    pub max_card_count: u32,

    /// Attempts allowed for malformed or insufficient output
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-attempt model call timeout in seconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_secs: u64,

    /// Provider outages tolerated per job before failing
    #[serde(default = "default_provider_retry_budget")]
    pub provider_retry_budget: u32,

    /// Whether a provider outage also uses up one of `max_attempts`
    #[serde(default)]
    pub provider_failures_consume_attempt: bool,

    /// First provider retry delay in milliseconds
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Cap on provider retry delay in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Jobs executed concurrently per process
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Output token ceiling per call
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DocumentConfig {
    /// Default PDF ingestion mode
    #[serde(default = "default_pdf_mode")]
    pub pdf_mode: PdfMode,

    /// Maximum bytes per uploaded document
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: usize,

    /// Maximum bytes across all documents of one request
    #[serde(default = "default_max_total_document_bytes")]
    pub max_total_document_bytes: usize,

    /// Character budget for extracted text across all documents
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,

    /// Segment size for extracted page text
    #[serde(default = "default_segment_chars")]
    pub segment_chars: usize,

    /// Native mode: documents above this size are uploaded instead of inlined
    #[serde(default = "default_inline_threshold")]
    pub inline_threshold_bytes: usize,

    /// Timeout for parsing one document, in seconds
    #[serde(default = "default_parse_timeout")]
    pub parse_timeout_secs: u64,

    /// Inline-extract mode: embedded page images sent per job
    #[serde(default = "default_max_images")]
    pub max_images: usize,

    /// Embedded images above this size are skipped
    #[serde(default = "default_max_image_bytes")]
    pub max_image_bytes: usize,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_body_bytes() -> usize { 160 * 1024 * 1024 }
fn default_process_type() -> ProcessType { ProcessType::Api }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_queue_batch_size() -> u32 { 10 }
fn default_queue_poll_timeout() -> u64 { 20 }
fn default_visibility_timeout() -> u64 { 900 }
fn default_jwt_expiration() -> u64 { 900 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "zistudy".to_string() }
fn default_rate_limit() -> u32 { 5 }
fn default_burst() -> u32 { 10 }
fn default_enabled() -> bool { true }
fn default_generation_provider() -> String { "gemini".to_string() }
fn default_generation_endpoint() -> String { "https://generativelanguage.googleapis.com/v1beta".to_string() }
fn default_generation_model() -> String { "gemini-2.5-pro".to_string() }
fn default_temperature() -> f32 { 0.35 }
fn default_card_count() -> u32 { 8 }
fn default_max_card_count() -> u32 { 20 }
fn default_max_attempts() -> u32 { 3 }
fn default_attempt_timeout() -> u64 { 60 }
fn default_provider_retry_budget() -> u32 { 2 }
fn default_backoff_initial_ms() -> u64 { 500 }
fn default_backoff_max_ms() -> u64 { 8_000 }
fn default_max_concurrent_jobs() -> usize { 4 }
fn default_max_output_tokens() -> u32 { 6000 }
fn default_pdf_mode() -> PdfMode { PdfMode::Native }
fn default_max_document_bytes() -> usize { 150 * 1024 * 1024 }
fn default_max_total_document_bytes() -> usize { 150 * 1024 * 1024 }
fn default_max_context_chars() -> usize { 18_000 }
fn default_segment_chars() -> usize { 1_200 }
fn default_inline_threshold() -> usize { 20 * 1024 * 1024 }
fn default_parse_timeout() -> u64 { 30 }
fn default_max_images() -> usize { 16 }
fn default_max_image_bytes() -> usize { 4 * 1024 * 1024 }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?

            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__GENERATION__MAX_ATTEMPTS=4
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl GenerationConfig {
    /// Per-attempt model call timeout
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Upper bound on how long the attempt loop of one job may run
    pub fn job_time_envelope(&self) -> Duration {
        let calls = self.max_attempts + self.provider_retry_budget;
        self.attempt_timeout() * calls + Duration::from_millis(self.backoff_max_ms) * self.provider_retry_budget
    }
}

impl DocumentConfig {
    /// Document parsing timeout
    pub fn parse_timeout(&self) -> Duration {
        Duration::from_secs(self.parse_timeout_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            generation_queue_url: None,
            dlq_url: None,
            batch_size: default_queue_batch_size(),
            poll_timeout_secs: default_queue_poll_timeout(),
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_expiration_secs: default_jwt_expiration(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            api_key: None,
            endpoint: default_generation_endpoint(),
            model: default_generation_model(),
            default_temperature: default_temperature(),
            default_card_count: default_card_count(),
            max_card_count: default_max_card_count(),
            max_attempts: default_max_attempts(),
            attempt_timeout_secs: default_attempt_timeout(),
            provider_retry_budget: default_provider_retry_budget(),
            provider_failures_consume_attempt: false,
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            pdf_mode: default_pdf_mode(),
            max_document_bytes: default_max_document_bytes(),
            max_total_document_bytes: default_max_total_document_bytes(),
            max_context_chars: default_max_context_chars(),
            segment_chars: default_segment_chars(),
            inline_threshold_bytes: default_inline_threshold(),
            parse_timeout_secs: default_parse_timeout(),
            max_images: default_max_images(),
            max_image_bytes: default_max_image_bytes(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                request_timeout_secs: default_request_timeout(),
                shutdown_timeout_secs: default_shutdown_timeout(),
                max_body_bytes: default_max_body_bytes(),
                process_type: default_process_type(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/zistudy".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
            },
            queue: QueueConfig::default(),
            auth: AuthConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
            generation: GenerationConfig::default(),
            documents: DocumentConfig::default(),
        }
    }
}
