//! Error types and diagnostics for the engine.

use std::fmt;

use thiserror::Error;
use virtstate_client::ClientError;

/// One problem report: a short summary plus supporting detail.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub summary: String,
    pub detail: String,
}

/// Accumulator for problem reports.
///
/// Validation and multi-step paths (file upload loops) collect every
/// problem they find instead of stopping at the first, so the caller can
/// surface them all at once. The top-level lifecycle operation decides
/// fatality by calling [`Diagnostics::into_result`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, summary: impl Into<String>, detail: impl Into<String>) {
        self.entries.push(Diagnostic {
            summary: summary.into(),
            detail: detail.into(),
        });
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    /// Fatal if any entry was collected.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Diagnostics(self))
        }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            if entry.detail.is_empty() {
                write!(f, "{}", entry.summary)?;
            } else {
                write!(f, "{}: {}", entry.summary, entry.detail)?;
            }
        }
        Ok(())
    }
}

/// Errors produced by engine operations.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Plan-time invariant violation; no remote call was issued.
    #[error("Invalid configuration: {0}")]
    Validation(Diagnostics),

    /// A remote call failed; wrapped with the instance and the step.
    #[error("Failed to {context} instance {instance:?}: {source}")]
    Remote {
        instance: String,
        context: String,
        #[source]
        source: ClientError,
    },

    /// The instance no longer exists where one was required.
    #[error("Instance {instance:?} no longer exists")]
    NotFound { instance: String },

    /// A poll reached its ceiling before the target state was observed.
    #[error("Timed out waiting for instance {instance:?} to reach {target:?}")]
    PollTimeout { instance: String, target: String },

    /// The caller-supplied deadline expired mid-operation.
    #[error("Operation on instance {instance:?} cancelled: caller deadline expired")]
    Cancelled { instance: String },

    /// No server registered under the requested remote name.
    #[error("Unknown remote {0:?}")]
    UnknownRemote(String),

    /// A local file (backup archive or file content source) could not be read.
    #[error("Failed to read local file {path:?}: {source}")]
    LocalFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Accumulated non-validation problems turned fatal.
    #[error("{0}")]
    Diagnostics(Diagnostics),
}

impl EngineError {
    /// Shorthand for a single-entry validation error.
    pub fn validation(summary: impl Into<String>, detail: impl Into<String>) -> Self {
        let mut diags = Diagnostics::new();
        diags.add_error(summary, detail);
        EngineError::Validation(diags)
    }

    /// Wrap a client error with the instance and operation context.
    pub fn remote(instance: &str, context: &str, source: ClientError) -> Self {
        EngineError::Remote {
            instance: instance.to_string(),
            context: context.to_string(),
            source,
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_diagnostics_are_not_fatal() {
        assert!(Diagnostics::new().into_result().is_ok());
    }

    #[test]
    fn test_diagnostics_accumulate_and_display() {
        let mut diags = Diagnostics::new();
        diags.add_error("Failed to upload file to instance \"c1\"", "disk full");
        diags.add_error("Failed to delete file from instance \"c1\"", "missing");
        assert_eq!(diags.entries().len(), 2);

        let err = diags.into_result().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("disk full"));
        assert!(msg.contains("missing"));
    }
}
