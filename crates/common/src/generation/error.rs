//! Failure taxonomy for the generation pipeline
//!
//! Stage-level errors stay close to where they originate; only outcome-changing
//! failures are lifted into [`GenerationError`], whose [`GenerationError::code`] is
//! persisted on failed jobs.

use thiserror::Error;

/// A request that must be rejected before any model call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("invalid {field}: {message}")]
    Field { field: String, message: String },

    #[error("topic at position {index} is blank")]
    BlankTopic { index: usize },

    #[error("document {name} is {size} bytes, limit is {limit} bytes")]
    DocumentTooLarge {
        name: String,
        size: usize,
        limit: usize,
    },

    #[error("documents total {size} bytes, limit is {limit} bytes")]
    DocumentsTooLarge { size: usize, limit: usize },
}

impl RequestError {
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        RequestError::Field {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// A candidate card that does not satisfy its variant's schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("schema mismatch at {path}: {message}")]
pub struct SchemaError {
    pub path: String,
    pub message: String,
}

impl SchemaError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Prefix the path with the candidate's position in the response
    pub fn at_index(self, index: usize) -> Self {
        Self {
            path: format!("cards[{}].{}", index, self.path),
            message: self.message,
        }
    }
}

/// A document that could not be turned into model context; recorded, never fatal
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported document {name}: {reason}")]
pub struct DocumentError {
    pub name: String,
    pub reason: String,
}

/// Failures talking to the generative model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Timeout, transport failure, throttling or 5xx; retryable
    #[error("provider unavailable: {message}")]
    Unavailable { message: String },

    /// Non-retryable 4xx
    #[error("provider rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The call succeeded but carried no usable output
    #[error("provider returned unusable output: {message}")]
    Unusable { message: String },
}

/// Failures of the response reconciler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("malformed model output: {message}")]
    MalformedOutput { message: String },

    #[error("generation exhausted after {attempts} attempt(s) without an accepted card")]
    GenerationExhausted { attempts: u32 },
}

/// Outcome-changing pipeline failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GenerationError {
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),

    #[error(transparent)]
    UnsupportedDocument(#[from] DocumentError),

    #[error("provider unavailable: {message}")]
    ProviderUnavailable { message: String },

    #[error("provider rejected the request: {message}")]
    ProviderRejected { message: String },

    #[error("malformed model output: {message}")]
    MalformedOutput { message: String },

    #[error(transparent)]
    SchemaMismatch(#[from] SchemaError),

    #[error("generation exhausted after {attempts} attempt(s) without an accepted card")]
    GenerationExhausted { attempts: u32 },

    #[error("persisting cards failed: {message}")]
    PersistenceFailed { message: String },

    #[error("job store error: {message}")]
    Store { message: String },

    #[error("job was still in progress {elapsed_secs}s after it started")]
    TimedOut { elapsed_secs: u64 },

    #[error("job could not be handed to a worker: {message}")]
    DispatchFailed { message: String },
}

impl GenerationError {
    /// Stable machine-readable code stored on failed jobs
    pub fn code(&self) -> &'static str {
        match self {
            GenerationError::InvalidRequest(_) => "INVALID_REQUEST",
            GenerationError::UnsupportedDocument(_) => "UNSUPPORTED_DOCUMENT",
            GenerationError::ProviderUnavailable { .. } => "PROVIDER_UNAVAILABLE",
            GenerationError::ProviderRejected { .. } => "PROVIDER_REJECTED",
            GenerationError::MalformedOutput { .. } => "MALFORMED_OUTPUT",
            GenerationError::SchemaMismatch(_) => "SCHEMA_MISMATCH",
            GenerationError::GenerationExhausted { .. } => "GENERATION_EXHAUSTED",
            GenerationError::PersistenceFailed { .. } => "PERSISTENCE_FAILED",
            GenerationError::Store { .. } => "JOB_STORE_ERROR",
            GenerationError::TimedOut { .. } => "JOB_TIMED_OUT",
            GenerationError::DispatchFailed { .. } => "DISPATCH_FAILED",
        }
    }
}

impl From<ProviderError> for GenerationError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Unavailable { message } => GenerationError::ProviderUnavailable { message },
            ProviderError::Rejected { status, message } => GenerationError::ProviderRejected {
                message: format!("{status}: {message}"),
            },
            ProviderError::Unusable { message } => GenerationError::MalformedOutput { message },
        }
    }
}

impl From<ReconcileError> for GenerationError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::MalformedOutput { message } => GenerationError::MalformedOutput { message },
            ReconcileError::GenerationExhausted { attempts } => {
                GenerationError::GenerationExhausted { attempts }
            }
        }
    }
}

impl From<crate::errors::AppError> for GenerationError {
    fn from(err: crate::errors::AppError) -> Self {
        GenerationError::Store {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            GenerationError::from(RequestError::BlankTopic { index: 0 }).code(),
            "INVALID_REQUEST"
        );
        assert_eq!(
            GenerationError::from(ReconcileError::GenerationExhausted { attempts: 3 }).code(),
            "GENERATION_EXHAUSTED"
        );
        assert_eq!(
            GenerationError::from(SchemaError::new("card_type", "bad")).code(),
            "SCHEMA_MISMATCH"
        );
    }

    #[test]
    fn test_provider_errors_map_by_kind() {
        let unusable = ProviderError::Unusable {
            message: "blocked".into(),
        };
        assert_eq!(GenerationError::from(unusable).code(), "MALFORMED_OUTPUT");

        let rejected = ProviderError::Rejected {
            status: 400,
            message: "bad key".into(),
        };
        assert_eq!(GenerationError::from(rejected).code(), "PROVIDER_REJECTED");
    }

    #[test]
    fn test_schema_error_path_is_indexed() {
        let err = SchemaError::new("payload.question", "must not be blank").at_index(2);
        assert_eq!(err.path, "cards[2].payload.question");
        assert!(err.to_string().contains("cards[2].payload.question"));
    }
}
