//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fleetup_plan::{FleetDocument, FleetPlan, ScheduleDocument};

use crate::backend::{DeploymentBackend, HelmBackend, SimulatedBackend};
use crate::window::SchedulerConfig;

/// fleetup - staged, constraint-aware upgrades for service fleets.
#[derive(Debug, Parser)]
#[command(name = "fleetup")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, env = "FLEETUP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, global = true, env = "FLEETUP_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upgrade a fleet window by window, choosing each round's batch.
    Plan(PlanArgs),

    /// Run a pre-planned schedule document.
    Execute(ExecuteArgs),

    /// Print the batch the selector would pick right now.
    Select(SelectArgs),
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Fleet document (versions, incompatible pairs, durations, parallelism).
    #[arg(long, env = "FLEETUP_FLEET")]
    pub fleet: PathBuf,

    /// Length of each window in seconds.
    #[arg(long, env = "FLEETUP_WINDOW_SECS", default_value_t = 20.0)]
    pub window_secs: f64,

    /// Stop after this many windows.
    #[arg(long, env = "FLEETUP_MAX_WINDOWS")]
    pub max_windows: Option<u32>,

    /// Override the document's parallelism.
    #[arg(long, env = "FLEETUP_PARALLELISM")]
    pub parallelism: Option<usize>,

    /// Seconds to pause between windows.
    #[arg(long, env = "FLEETUP_WINDOW_GAP_SECS", default_value_t = 0.0)]
    pub window_gap_secs: f64,

    /// Ask on stdin before every round.
    #[arg(long, env = "FLEETUP_CONFIRM")]
    pub confirm: bool,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Debug, Args)]
pub struct ExecuteArgs {
    /// Schedule document.
    #[arg(long, env = "FLEETUP_SCHEDULE")]
    pub schedule: PathBuf,

    /// Maximum concurrently running tasks across all windows.
    #[arg(long, env = "FLEETUP_PARALLELISM", default_value_t = 3)]
    pub parallelism: usize,

    #[command(flatten)]
    pub run: RunArgs,
}

#[derive(Debug, Args)]
pub struct SelectArgs {
    #[arg(long, env = "FLEETUP_FLEET")]
    pub fleet: PathBuf,

    /// Time left in the window, in seconds.
    #[arg(long, env = "FLEETUP_REMAINING_SECS", default_value_t = 20.0)]
    pub remaining_secs: f64,
}

/// Options shared by commands that touch a backend.
#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub backend: BackendArgs,

    /// Serve the status API on this address.
    #[arg(long, env = "FLEETUP_API_ADDR")]
    pub api_addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Simulated,
    Helm,
}

#[derive(Debug, Args)]
pub struct BackendArgs {
    #[arg(long, env = "FLEETUP_BACKEND", value_enum, default_value_t = BackendKind::Simulated)]
    pub backend: BackendKind,

    /// Root directory of `<service>/<version>` Helm charts.
    #[arg(long, env = "FLEETUP_CHART_ROOT", default_value = "/srv/charts")]
    pub chart_root: PathBuf,

    /// Image-pull secret to patch onto upgraded workloads.
    #[arg(long, env = "FLEETUP_PULL_SECRET")]
    pub pull_secret: Option<String>,

    /// Readiness success probability of the simulated backend.
    #[arg(long, env = "FLEETUP_SUCCESS_RATE", default_value_t = 0.5)]
    pub success_rate: f64,

    /// Seed of the simulated backend.
    #[arg(long, env = "FLEETUP_SEED", default_value_t = 0)]
    pub seed: u64,

    /// Simulated readiness latency in seconds.
    #[arg(long, env = "FLEETUP_SIM_LATENCY_SECS", default_value_t = 1.0)]
    pub sim_latency_secs: f64,
}

/// Parse a non-negative seconds flag.
pub fn seconds(name: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).with_context(|| format!("invalid --{name}: {value}"))
}

impl BackendArgs {
    pub fn build(&self) -> Result<Arc<dyn DeploymentBackend>> {
        let backend: Arc<dyn DeploymentBackend> = match self.backend {
            BackendKind::Simulated => {
                if !(0.0..=1.0).contains(&self.success_rate) {
                    anyhow::bail!("--success-rate must be within [0, 1], got {}", self.success_rate);
                }
                Arc::new(
                    SimulatedBackend::new(self.seed)
                        .with_success_rate(self.success_rate)
                        .with_default_ready_latency(seconds(
                            "sim-latency-secs",
                            self.sim_latency_secs,
                        )?),
                )
            }
            BackendKind::Helm => {
                let mut helm = HelmBackend::new(&self.chart_root);
                if let Some(secret) = &self.pull_secret {
                    helm = helm.with_pull_secret(secret);
                }
                Arc::new(helm)
            }
        };
        Ok(backend)
    }
}

impl ExecuteArgs {
    pub fn parallelism(&self) -> Result<usize> {
        if self.parallelism == 0 {
            anyhow::bail!("--parallelism must be at least 1");
        }
        Ok(self.parallelism)
    }
}

impl PlanArgs {
    pub fn scheduler_config(&self) -> Result<SchedulerConfig> {
        let window_length = seconds("window-secs", self.window_secs)?;
        if window_length.is_zero() {
            anyhow::bail!("--window-secs must be positive");
        }
        if self.parallelism == Some(0) {
            anyhow::bail!("--parallelism must be at least 1");
        }
        Ok(SchedulerConfig {
            window_length,
            max_windows: self.max_windows,
            parallelism: self.parallelism,
            window_gap: seconds("window-gap-secs", self.window_gap_secs)?,
            ..Default::default()
        })
    }
}

/// Load and validate a fleet document.
pub fn load_fleet(path: &Path) -> Result<FleetPlan> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fleet document {}", path.display()))?;
    FleetDocument::from_json(&raw)
        .and_then(FleetDocument::into_plan)
        .with_context(|| format!("invalid fleet document {}", path.display()))
}

/// Load a schedule document. Times are validated when the run starts.
pub fn load_schedule(path: &Path) -> Result<ScheduleDocument> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read schedule document {}", path.display()))?;
    ScheduleDocument::from_json(&raw)
        .with_context(|| format!("invalid schedule document {}", path.display()))
}
