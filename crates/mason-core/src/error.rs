use serde::{Deserialize, Serialize};

/// The subsystem a [`DomainError`] originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDomain {
    /// Source tracking or fetching.
    Source,
    /// Element-level failures.
    Element,
    /// Failures inside the build scratch directory.
    Sandbox,
    /// Artifact cache failures.
    Artifact,
    /// Project configuration failures.
    Project,
    /// Pipeline assembly failures.
    Stream,
    /// Worker-process plumbing failures.
    Worker,
}

impl ErrorDomain {
    /// Stable lowercase name, as carried on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorDomain::Source => "source",
            ErrorDomain::Element => "element",
            ErrorDomain::Sandbox => "sandbox",
            ErrorDomain::Artifact => "artifact",
            ErrorDomain::Project => "project",
            ErrorDomain::Stream => "stream",
            ErrorDomain::Worker => "worker",
        }
    }
}

/// A recognized, structured failure raised by an action or a queue hook.
///
/// Domain errors are the retryable failure class: a worker that fails with
/// one reports `(domain, reason)` back to the parent and the job may be
/// re-spawned. Anything else escaping an action is treated as a bug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct DomainError {
    /// Originating subsystem.
    pub domain: ErrorDomain,
    /// Machine-readable reason tag, for tests and diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable description.
    pub message: String,
    /// Optional multi-line detail (e.g. captured command output).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DomainError {
    /// Create an error with a message only.
    pub fn new(domain: ErrorDomain, message: impl Into<String>) -> Self {
        DomainError {
            domain,
            reason: None,
            message: message.into(),
            detail: None,
        }
    }

    /// Attach a machine-readable reason tag.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attach a detail block.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
