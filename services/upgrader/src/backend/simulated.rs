//! Simulated deployment backend.
//!
//! Stands in for a real cluster in tests and dry runs. Readiness is decided
//! by a seeded coin flip unless a service has a scripted outcome, which keeps
//! simulated runs reproducible.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::{BackendError, Deployment, DeploymentBackend, Readiness};

/// Forced outcome for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Rollout becomes ready after the configured latency.
    Ready,
    /// Rollout reports unhealthy after the configured latency.
    Unhealthy,
    /// `apply` itself fails.
    ApplyError,
    /// Readiness never resolves; only the caller's timeout ends the wait.
    Hang,
}

/// A recorded backend invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Apply { service: String, target: String },
    CheckReady { service: String },
    Rollback { service: String, origin: String },
}

/// Simulated backend.
pub struct SimulatedBackend {
    success_rate: f64,
    rng: Mutex<StdRng>,
    apply_latency: Duration,
    default_ready_latency: Duration,
    ready_latency: HashMap<String, Duration>,
    scripted: HashMap<String, ScriptedOutcome>,
    fail_rollbacks: bool,
    calls: Mutex<Vec<BackendCall>>,
}

impl SimulatedBackend {
    /// Create a simulated backend that always becomes ready.
    pub fn new(seed: u64) -> Self {
        Self {
            success_rate: 1.0,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            apply_latency: Duration::ZERO,
            default_ready_latency: Duration::ZERO,
            ready_latency: HashMap::new(),
            scripted: HashMap::new(),
            fail_rollbacks: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Probability that an unscripted readiness check succeeds.
    pub fn with_success_rate(mut self, rate: f64) -> Self {
        self.success_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_apply_latency(mut self, latency: Duration) -> Self {
        self.apply_latency = latency;
        self
    }

    pub fn with_default_ready_latency(mut self, latency: Duration) -> Self {
        self.default_ready_latency = latency;
        self
    }

    pub fn with_ready_latency(mut self, service: impl Into<String>, latency: Duration) -> Self {
        self.ready_latency.insert(service.into(), latency);
        self
    }

    pub fn with_outcome(mut self, service: impl Into<String>, outcome: ScriptedOutcome) -> Self {
        self.scripted.insert(service.into(), outcome);
        self
    }

    /// Make every rollback fail.
    pub fn failing_rollbacks(mut self) -> Self {
        self.fail_rollbacks = true;
        self
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Services that were rolled back, in order.
    pub fn rollbacks(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::Rollback { service, .. } => Some(service),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: BackendCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn outcome_for(&self, service: &str) -> ScriptedOutcome {
        if let Some(outcome) = self.scripted.get(service) {
            return *outcome;
        }
        let healthy = self
            .rng
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .random_bool(self.success_rate);
        if healthy {
            ScriptedOutcome::Ready
        } else {
            ScriptedOutcome::Unhealthy
        }
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl DeploymentBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn apply(&self, deployment: &Deployment) -> Result<(), BackendError> {
        self.record(BackendCall::Apply {
            service: deployment.service.clone(),
            target: deployment.target.clone(),
        });

        info!(
            service = %deployment.service,
            from = %deployment.origin,
            to = %deployment.target,
            namespace = %deployment.namespace,
            "[SIM] Applying version"
        );
        tokio::time::sleep(self.apply_latency).await;

        if self.scripted.get(&deployment.service) == Some(&ScriptedOutcome::ApplyError) {
            return Err(BackendError::Rejected {
                operation: "apply",
                service: deployment.service.clone(),
                message: "simulated apply failure".to_string(),
            });
        }
        Ok(())
    }

    async fn check_ready(
        &self,
        deployment: &Deployment,
        timeout: Duration,
    ) -> Result<Readiness, BackendError> {
        self.record(BackendCall::CheckReady {
            service: deployment.service.clone(),
        });

        let outcome = self.outcome_for(&deployment.service);
        if outcome == ScriptedOutcome::Hang {
            debug!(service = %deployment.service, "[SIM] Readiness hangs");
            std::future::pending::<()>().await;
        }

        let latency = self
            .ready_latency
            .get(&deployment.service)
            .copied()
            .unwrap_or(self.default_ready_latency);

        // Like `kubectl rollout status --timeout`, give up once the timeout passes.
        if latency > timeout {
            tokio::time::sleep(timeout).await;
            return Ok(Readiness {
                ready: false,
                elapsed: timeout,
            });
        }

        tokio::time::sleep(latency).await;
        let ready = outcome == ScriptedOutcome::Ready;
        debug!(service = %deployment.service, ready, "[SIM] Readiness checked");
        Ok(Readiness {
            ready,
            elapsed: latency,
        })
    }

    async fn rollback(&self, deployment: &Deployment) -> Result<(), BackendError> {
        self.record(BackendCall::Rollback {
            service: deployment.service.clone(),
            origin: deployment.origin.clone(),
        });

        info!(
            service = %deployment.service,
            to = %deployment.origin,
            "[SIM] Rolling back"
        );
        if self.fail_rollbacks {
            return Err(BackendError::Rejected {
                operation: "rollback",
                service: deployment.service.clone(),
                message: "simulated rollback failure".to_string(),
            });
        }
        Ok(())
    }
}
