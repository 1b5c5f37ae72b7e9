//! Injected collaborator seams for the work pipeline.
//!
//! The runtime never calls a concrete external API. Fetching and analysis
//! are supplied by collaborators behind these traits; failure modes that
//! require pipeline-level handling are explicit variants rather than
//! control-flow exceptions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure modes a fetch can report back to the pipeline.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The provider answered with a rate-limit signal (e.g. a 429-class
    /// response). The pipeline records the back-off and requeues the subject.
    #[error(
        "error-overseer-pipeline-1 Provider rate limited: {provider}: retry after {reset_seconds}s"
    )]
    RateLimited { provider: String, reset_seconds: u64 },

    /// The collaborator's session/authorization expired. The pipeline pauses
    /// on the session gate until validity is restored.
    #[error("error-overseer-pipeline-2 Session expired while fetching {subject}")]
    SessionExpired { subject: String },

    /// Any other per-subject failure. The subject is recorded and skipped;
    /// the run continues.
    #[error("error-overseer-pipeline-3 Fetch failed: {subject}: {details}")]
    Failed { subject: String, details: String },
}

/// External-resource access for one subject.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Rate-limit key of the provider behind this fetcher.
    fn provider(&self) -> &str;

    async fn fetch(&self, subject: &str) -> Result<Value, FetchError>;
}

/// Outcome of evaluating one fetched subject.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    pub message: String,
    pub score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Accept,
    Reject,
    Skip,
}

/// The one capability interface every concrete strategy implements.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, subject: &str, payload: &Value) -> anyhow::Result<Evaluation>;
}
