//! Error kinds surfaced by the controller's collaborators. None of them are fatal to the loop.

use thiserror::Error;

/// The embedded config snapshot of a deployment could not be read.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("deployment {deployment} has no {annotation} annotation")]
    MissingAnnotation { deployment: String, annotation: &'static str },
    #[error("deployment {deployment} carries a malformed config snapshot: {source}")]
    Malformed {
        deployment: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a [`crate::ChangeStrategy`].
#[derive(Debug, Error)]
pub enum StrategyError {
    /// Optimistic-concurrency rejection: someone else already wrote a newer version.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("api error: {0}")]
    Api(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StrategyError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StrategyError::Conflict(_))
    }
}
