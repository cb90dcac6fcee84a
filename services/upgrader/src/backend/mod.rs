//! Deployment backend interface.
//!
//! The backend is the tool that actually changes a service's running version
//! and reports whether the result became healthy:
//! - `apply`: roll the service to a target version
//! - `check_ready`: wait, bounded by a timeout, for the rollout to be healthy
//! - `rollback`: best-effort return to the origin version
//!
//! A simulated backend is provided for tests and dry runs; the Helm backend
//! drives a Kubernetes cluster through `helm` and `kubectl`.

mod helm;
mod simulated;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use helm::HelmBackend;
pub use simulated::{BackendCall, ScriptedOutcome, SimulatedBackend};

/// One service's version change, as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub service: String,

    /// Namespace (region) the service runs in.
    pub namespace: String,

    /// Version before the upgrade.
    pub origin: String,

    /// Version being rolled out.
    pub target: String,
}

impl Deployment {
    pub fn new(
        service: impl Into<String>,
        namespace: impl Into<String>,
        origin: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            namespace: namespace.into(),
            origin: origin.into(),
            target: target.into(),
        }
    }
}

/// Result of a readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub ready: bool,
    pub elapsed: Duration,
}

/// Deployment backend errors.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend command could not be started.
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The backend command exited unsuccessfully.
    #[error("{command} exited with status {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    /// The backend refused the operation.
    #[error("backend rejected {operation} for {service}: {message}")]
    Rejected {
        operation: &'static str,
        service: String,
        message: String,
    },
}

/// Deployment backend interface.
#[async_trait]
pub trait DeploymentBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Roll `deployment.service` to `deployment.target`.
    async fn apply(&self, deployment: &Deployment) -> Result<(), BackendError>;

    /// Wait at most `timeout` for the rollout to become healthy.
    async fn check_ready(
        &self,
        deployment: &Deployment,
        timeout: Duration,
    ) -> Result<Readiness, BackendError>;

    /// Return `deployment.service` to `deployment.origin`.
    async fn rollback(&self, deployment: &Deployment) -> Result<(), BackendError>;
}
