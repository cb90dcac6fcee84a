//! Error types for catalog, constraint and document handling.

use thiserror::Error;

/// Errors raised for malformed planning input.
///
/// An empty batch or an expired window is never reported through this type;
/// those are ordinary outcomes of selection.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PlanError {
    /// The service is not present in the catalog.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The version is not in the service's version list.
    #[error("unknown version {version} for service {service}")]
    UnknownVersion { service: String, version: String },

    /// The requested version does not come after the current head.
    #[error("version {target} is not ahead of {current} for service {service}")]
    NotAhead {
        service: String,
        current: String,
        target: String,
    },

    /// A service was declared without any versions.
    #[error("service {0} has no versions")]
    EmptyVersions(String),

    /// A version appears twice in one service's list.
    #[error("duplicate version {version} for service {service}")]
    DuplicateVersion { service: String, version: String },

    /// A constraint pairs a service with itself.
    #[error("constraint relates service {0} to itself")]
    SelfConstraint(String),

    /// No expected duration was given for a service.
    #[error("missing upgrade duration for service {0}")]
    MissingDuration(String),

    /// The expected duration is negative or not a number.
    #[error("invalid upgrade duration {seconds} for service {service}")]
    InvalidDuration { service: String, seconds: f64 },

    /// Parallelism must admit at least one task.
    #[error("parallelism must be at least 1")]
    InvalidParallelism,

    /// The schedule or fleet document is structurally valid JSON but semantically wrong.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// JSON decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl PlanError {
    /// Returns true if the error names a service or version the catalog does not know.
    pub fn is_unknown_reference(&self) -> bool {
        matches!(
            self,
            PlanError::UnknownService(_) | PlanError::UnknownVersion { .. }
        )
    }
}

impl From<serde_json::Error> for PlanError {
    fn from(err: serde_json::Error) -> Self {
        PlanError::Serialization(err.to_string())
    }
}
