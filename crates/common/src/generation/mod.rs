//! Study card generation pipeline
//!
//! Turns a [`GenerationRequest`] into a validated, deduplicated and persisted batch of
//! study cards. The pieces, leaves first:
//! - [`schema`]: request and candidate validation
//! - [`pdf`]: uploaded document preparation (native passthrough or text extraction)
//! - [`prompt`]: prompt assembly with prior-card summaries
//! - [`client`]: the generative model client
//! - [`reconciler`]: parse/repair/validate model output across attempts
//! - [`persister`]: transactional card writes and the retention note
//! - [`orchestrator`]: the per-job state machine
//! - [`worker`]: bounded pool that runs jobs off the request path

pub mod client;
pub mod error;
pub mod orchestrator;
pub mod pdf;
pub mod persister;
pub mod prompt;
pub mod reconciler;
pub mod schema;
pub mod store;
pub mod types;
pub mod worker;

#[cfg(test)]
pub(crate) mod fixtures;

pub use client::{create_client, GenerationClient, GenerativeClient, RawResponse};
pub use error::{
    DocumentError, GenerationError, ProviderError, ReconcileError, RequestError, SchemaError,
};
pub use orchestrator::{JobOrchestrator, JobReport};
pub use pdf::{DocumentContext, DocumentExtractor};
pub use persister::{CardPersister, CardStore, ExistingCard, NewStudyCard, PersistedBatch, Provenance};
pub use prompt::{PromptAssembler, PromptPayload};
pub use reconciler::{AcceptedBatch, ResponseReconciler};
pub use schema::{validate_candidate, validate_request, RequestLimits, ValidRequest};
pub use store::{JobOutcome, JobStore};
pub use types::*;
pub use worker::WorkerPool;
