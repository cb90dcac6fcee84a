//! Helm/kubectl deployment backend.
//!
//! Each service is installed as the Helm release `<service>-<origin>` from the
//! chart at `<chart_root>/<service>/<version>`, with a deployment named
//! `<service>-deployment`. Readiness is `kubectl rollout status` bounded by
//! the remaining window time.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{BackendError, Deployment, DeploymentBackend, Readiness};

/// Backend that shells out to `helm` and `kubectl`.
#[derive(Debug, Clone)]
pub struct HelmBackend {
    chart_root: PathBuf,
    pull_secret: Option<String>,
    helm_bin: String,
    kubectl_bin: String,
}

impl HelmBackend {
    pub fn new(chart_root: impl Into<PathBuf>) -> Self {
        Self {
            chart_root: chart_root.into(),
            pull_secret: None,
            helm_bin: "helm".to_string(),
            kubectl_bin: "kubectl".to_string(),
        }
    }

    /// Attach this image-pull secret to the default service account and the deployment.
    pub fn with_pull_secret(mut self, secret: impl Into<String>) -> Self {
        self.pull_secret = Some(secret.into());
        self
    }

    /// Override the `helm` and `kubectl` executables.
    pub fn with_binaries(mut self, helm: impl Into<String>, kubectl: impl Into<String>) -> Self {
        self.helm_bin = helm.into();
        self.kubectl_bin = kubectl.into();
        self
    }

    fn release_name(deployment: &Deployment) -> String {
        format!("{}-{}", deployment.service, deployment.origin)
    }

    fn deployment_name(deployment: &Deployment) -> String {
        format!("{}-deployment", deployment.service)
    }

    fn chart_path(&self, service: &str, version: &str) -> PathBuf {
        self.chart_root.join(service).join(version)
    }

    fn upgrade_args(&self, deployment: &Deployment) -> Vec<String> {
        vec![
            "upgrade".to_string(),
            Self::release_name(deployment),
            self.chart_path(&deployment.service, &deployment.target)
                .display()
                .to_string(),
            "--install".to_string(),
            "--namespace".to_string(),
            deployment.namespace.clone(),
            "--create-namespace".to_string(),
            "--force".to_string(),
            "--set".to_string(),
            format!("upgrade_path={}-{}", deployment.origin, deployment.target),
        ]
    }

    fn rollback_args(&self, deployment: &Deployment) -> Vec<String> {
        vec![
            "upgrade".to_string(),
            Self::release_name(deployment),
            self.chart_path(&deployment.service, &deployment.origin)
                .display()
                .to_string(),
            "--namespace".to_string(),
            deployment.namespace.clone(),
            "--set".to_string(),
            format!("upgrade_path={}-{}", deployment.origin, deployment.origin),
            "--force".to_string(),
        ]
    }

    fn rollout_args(deployment: &Deployment, timeout: Duration) -> Vec<String> {
        // kubectl only takes whole seconds; never ask for zero.
        let secs = timeout.as_secs().max(1);
        vec![
            "rollout".to_string(),
            "status".to_string(),
            format!("deployment/{}", Self::deployment_name(deployment)),
            "-n".to_string(),
            deployment.namespace.clone(),
            format!("--timeout={secs}s"),
        ]
    }

    async fn run(program: &str, args: &[String]) -> Result<Output, BackendError> {
        debug!(program, args = ?args, "Running backend command");
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| BackendError::Spawn {
                command: program.to_string(),
                source,
            })
    }

    /// Run a command and fail on a non-zero exit.
    async fn run_checked(program: &str, args: &[String]) -> Result<Output, BackendError> {
        let output = Self::run(program, args).await?;
        if !output.status.success() {
            return Err(BackendError::CommandFailed {
                command: format!("{program} {}", args.join(" ")),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    async fn release_exists(&self, namespace: &str, release: &str) -> Result<bool, BackendError> {
        let args = ["list", "-q", "-n", namespace].map(String::from);
        let output = Self::run(&self.helm_bin, &args).await?;
        Ok(output.status.success()
            && String::from_utf8_lossy(&output.stdout)
                .lines()
                .any(|line| line.trim() == release))
    }

    fn service_account_patch_args(deployment: &Deployment, secret: &str) -> Vec<String> {
        vec![
            "patch".to_string(),
            "serviceaccount".to_string(),
            "default".to_string(),
            "-n".to_string(),
            deployment.namespace.clone(),
            "-p".to_string(),
            serde_json::json!({ "imagePullSecrets": [{ "name": secret }] }).to_string(),
        ]
    }

    fn deployment_patch_args(deployment: &Deployment, secret: &str) -> Vec<String> {
        vec![
            "patch".to_string(),
            "deployment".to_string(),
            Self::deployment_name(deployment),
            "-n".to_string(),
            deployment.namespace.clone(),
            "-p".to_string(),
            serde_json::json!({
                "spec": { "template": { "spec": { "imagePullSecrets": [{ "name": secret }] } } }
            })
            .to_string(),
        ]
    }

    /// Give the namespace's default service account the pull secret, so the
    /// first pods of the upgrade can pull. Failures are logged, not fatal.
    async fn patch_service_account(&self, deployment: &Deployment) {
        let Some(secret) = &self.pull_secret else {
            return;
        };
        let args = Self::service_account_patch_args(deployment, secret);
        if let Err(e) = Self::run_checked(&self.kubectl_bin, &args).await {
            warn!(namespace = %deployment.namespace, error = %e, "Failed to patch service account");
        }
    }

    /// Pin the pull secret on the upgraded deployment's pod template.
    async fn patch_deployment(&self, deployment: &Deployment) {
        let Some(secret) = &self.pull_secret else {
            return;
        };
        let args = Self::deployment_patch_args(deployment, secret);
        if let Err(e) = Self::run_checked(&self.kubectl_bin, &args).await {
            warn!(service = %deployment.service, error = %e, "Failed to patch deployment");
        }
    }
}

#[async_trait]
impl DeploymentBackend for HelmBackend {
    fn name(&self) -> &'static str {
        "helm"
    }

    async fn apply(&self, deployment: &Deployment) -> Result<(), BackendError> {
        let started = Instant::now();
        self.patch_service_account(deployment).await;
        Self::run_checked(&self.helm_bin, &self.upgrade_args(deployment)).await?;
        info!(
            service = %deployment.service,
            from = %deployment.origin,
            to = %deployment.target,
            namespace = %deployment.namespace,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Helm upgrade applied"
        );

        self.patch_deployment(deployment).await;
        Ok(())
    }

    async fn check_ready(
        &self,
        deployment: &Deployment,
        timeout: Duration,
    ) -> Result<Readiness, BackendError> {
        let started = Instant::now();
        let output = Self::run(&self.kubectl_bin, &Self::rollout_args(deployment, timeout)).await?;
        let elapsed = started.elapsed();

        let ready = output.status.success();
        if ready {
            info!(
                service = %deployment.service,
                elapsed_ms = elapsed.as_millis() as u64,
                "Rollout ready"
            );
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                service = %deployment.service,
                elapsed_ms = elapsed.as_millis() as u64,
                stderr = %stderr.trim(),
                "Rollout not ready"
            );
        }
        Ok(Readiness { ready, elapsed })
    }

    async fn rollback(&self, deployment: &Deployment) -> Result<(), BackendError> {
        let release = Self::release_name(deployment);
        if !self
            .release_exists(&deployment.namespace, &release)
            .await?
        {
            warn!(release = %release, namespace = %deployment.namespace, "Release not found, skipping rollback");
            return Ok(());
        }

        Self::run_checked(&self.helm_bin, &self.rollback_args(deployment)).await?;
        info!(
            service = %deployment.service,
            to = %deployment.origin,
            namespace = %deployment.namespace,
            "Rolled back"
        );
        Ok(())
    }
}
