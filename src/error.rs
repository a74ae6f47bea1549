/*
 * Podcast Seeder CLI - Rust Edition
 * Copyright (c) 2024 Podcast Seeder Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use thiserror::Error;

/// Typed error taxonomy for the processing core. The orchestrator matches on
/// kind to decide retry vs fail vs fatal.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Network hiccup, 5xx, or other transient transport failure. Retried.
    #[error("transient error: {0}")]
    Transient(String),

    /// Provider signaled a per-minute rate limit. The caller rotates keys.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Provider signaled a daily/total quota limit. The caller rotates keys.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Every configured API key is ineligible. Fatal signal to back off the batch.
    #[error("no API key available for model '{model}'")]
    NoKeyAvailable { model: String },

    /// LLM response did not contain parseable JSON of the expected shape.
    /// Treated as a zero-extraction outcome, never fails the stage.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Transcript or registry input the parser rejects. Fails the episode.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Disk full, pool exhausted, or similar. Stage fails but is retryable on
    /// the next run because checkpoint state is unchanged.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A circuit breaker is open for the dependency.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Job deadline exceeded.
    #[error("timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Missing env var, invalid podcast_id, unknown storage mode. Fails at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Storage-layer failure from the graph backend.
    #[error("storage error: {0}")]
    Storage(String),

    /// Asserted precondition failed. The worker aborts; the episode is failed.
    #[error("invariant violation: {0}")]
    Invariant(String),

    /// The shutdown flag was observed at a stage or retry boundary.
    #[error("cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Errors the orchestrator retries through the backoff policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::Transient(_)
                | PipelineError::RateLimited(_)
                | PipelineError::QuotaExceeded(_)
                | PipelineError::ServiceUnavailable(_)
                | PipelineError::Timeout { .. }
        )
    }

    /// Errors that abort the whole run rather than a single episode.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Config(_) | PipelineError::NoKeyAvailable { .. }
        )
    }

    /// Short machine-readable kind tag used in metrics and failure records.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Transient(_) => "transient",
            PipelineError::RateLimited(_) => "rate_limited",
            PipelineError::QuotaExceeded(_) => "quota_exceeded",
            PipelineError::NoKeyAvailable { .. } => "no_key_available",
            PipelineError::MalformedResponse(_) => "malformed_response",
            PipelineError::MalformedInput(_) => "malformed_input",
            PipelineError::ResourceExhausted(_) => "resource_exhausted",
            PipelineError::ServiceUnavailable(_) => "service_unavailable",
            PipelineError::Timeout { .. } => "timeout",
            PipelineError::Config(_) => "config",
            PipelineError::Storage(_) => "storage",
            PipelineError::Invariant(_) => "invariant",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Io(_) => "io",
            PipelineError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(PipelineError::Transient("x".into()).is_recoverable());
        assert!(PipelineError::RateLimited("x".into()).is_recoverable());
        assert!(!PipelineError::MalformedInput("x".into()).is_recoverable());
        assert!(!PipelineError::Config("x".into()).is_recoverable());
    }

    #[test]
    fn fatal_kinds() {
        assert!(PipelineError::Config("missing".into()).is_fatal());
        assert!(PipelineError::NoKeyAvailable { model: "m".into() }.is_fatal());
        assert!(!PipelineError::Transient("x".into()).is_fatal());
    }
}
