//! fleetup
//!
//! Upgrades a fleet of independently versioned services in bounded time
//! windows, never letting two incompatible versions run side by side.
//!
//! ## Modes
//!
//! - **plan**: each round asks the selector for the best legal batch
//! - **execute**: runs a pre-planned schedule document
//! - **select**: prints one selection and exits

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleetup_plan::BatchSelector;
use fleetup_upgrader::{
    api,
    catalog::VersionCatalog,
    config::{self, Cli, Command, LogFormat, RunArgs},
    gate::ConsolePrompt,
    schedule::ScheduleRunner,
    state::StateStore,
    TaskExecutor, WindowScheduler,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Start the status API if an address is configured.
fn start_api(
    run: &RunArgs,
    store: &Arc<StateStore>,
    shutdown: &watch::Receiver<bool>,
) -> Option<JoinHandle<std::io::Result<()>>> {
    let addr = run.api_addr?;
    let store = Arc::clone(store);
    let shutdown = shutdown.clone();
    Some(tokio::spawn(async move {
        api::serve(addr, store, shutdown).await
    }))
}

/// Keep serving status until Ctrl+C, then stop the API.
async fn linger(api: Option<JoinHandle<std::io::Result<()>>>, shutdown: watch::Sender<bool>) {
    let Some(mut handle) = api else {
        return;
    };

    info!("Run finished, status API stays up until Ctrl+C");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = &mut handle => {
            report_api_exit(result);
            return;
        }
    }
    let _ = shutdown.send(true);

    match tokio::time::timeout(Duration::from_secs(5), handle).await {
        Ok(result) => report_api_exit(result),
        Err(_) => warn!("Status API did not stop in time"),
    }
}

fn report_api_exit(result: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => info!("Status API stopped"),
        Ok(Err(e)) => error!(error = %e, "Status API error"),
        Err(e) => error!(error = %e, "Status API task panicked"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    match cli.command {
        Command::Select(args) => {
            let plan = config::load_fleet(&args.fleet)?;
            let remaining = config::seconds("remaining-secs", args.remaining_secs)?;
            let batch = BatchSelector::new().select(
                &plan.catalog,
                &plan.constraints,
                &plan.durations,
                remaining,
                plan.parallelism,
            )?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
        }

        Command::Plan(args) => {
            let plan = config::load_fleet(&args.fleet)?;
            let scheduler_config = args.scheduler_config()?;
            let backend = args.run.backend.build()?;
            info!(
                services = plan.catalog.len(),
                constraints = plan.constraints.len(),
                backend = backend.name(),
                "Fleet loaded"
            );

            let store = Arc::new(StateStore::new());
            let catalog = Arc::new(VersionCatalog::new(plan.catalog.clone()));
            let executor = TaskExecutor::new(backend, Arc::clone(&catalog), Arc::clone(&store));
            let api = start_api(&args.run, &store, &shutdown_rx);

            let mut scheduler = WindowScheduler::new(executor, plan, scheduler_config);
            if args.confirm {
                scheduler = scheduler.with_gate(Arc::new(ConsolePrompt::new()));
            }

            let reports = tokio::select! {
                reports = scheduler.run() => reports.context("upgrade run failed")?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, in-flight tasks are abandoned");
                    let _ = shutdown_tx.send(true);
                    return Ok(());
                }
            };

            let summary = store.summary().await;
            let remaining: Vec<String> = catalog
                .snapshot()
                .await
                .pending_services()
                .map(String::from)
                .collect();
            info!(
                windows = reports.len(),
                succeeded = summary.succeeded,
                failed = summary.failed,
                complete = remaining.is_empty(),
                pending_services = ?remaining,
                "Upgrade run finished"
            );
            println!("{}", serde_json::to_string_pretty(&reports)?);

            linger(api, shutdown_tx).await;
        }

        Command::Execute(args) => {
            let document = config::load_schedule(&args.schedule)?;
            let parallelism = args.parallelism()?;
            let backend = args.run.backend.build()?;
            let catalog = Arc::new(VersionCatalog::new(
                document.catalog().context("invalid schedule document")?,
            ));

            let store = Arc::new(StateStore::new());
            let executor = TaskExecutor::new(backend, catalog, Arc::clone(&store));
            let api = start_api(&args.run, &store, &shutdown_rx);

            let runner = ScheduleRunner::new(executor, document, parallelism)?;
            let reports = tokio::select! {
                reports = runner.run() => reports.context("schedule run failed")?,
                _ = tokio::signal::ctrl_c() => {
                    warn!("Interrupted, in-flight tasks are abandoned");
                    let _ = shutdown_tx.send(true);
                    return Ok(());
                }
            };

            let summary = store.summary().await;
            info!(
                windows = reports.len(),
                succeeded = summary.succeeded,
                failed = summary.failed,
                pending = summary.pending,
                "Schedule finished"
            );
            println!("{}", serde_json::to_string_pretty(&reports)?);

            linger(api, shutdown_tx).await;
        }
    }

    Ok(())
}
