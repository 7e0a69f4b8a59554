//! Seam for the external enforcement filter.
//!
//! Placeholder resolution and the actual matching rules live outside this crate. The
//! transformer only needs to know whether a record passes.

use thiserror::Error;

use crate::headers::MessageHeaders;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnforcementError {
    #[error("Unresolved placeholder: {0}")]
    UnresolvedPlaceholder(String),

    #[error("Enforcement input '{input}' does not match any of {filters:?}")]
    Mismatch { input: String, filters: Vec<String> },
}

/// Decides whether a consumed record may enter the pipeline.
pub trait EnforcementFilter: Send + Sync {
    /// `topic` and `headers` are those of the consumed record
    fn evaluate(&self, topic: &str, headers: &MessageHeaders) -> Result<(), EnforcementError>;
}

impl<F> EnforcementFilter for F
where
    F: Fn(&str, &MessageHeaders) -> Result<(), EnforcementError> + Send + Sync,
{
    fn evaluate(&self, topic: &str, headers: &MessageHeaders) -> Result<(), EnforcementError> {
        self(topic, headers)
    }
}
