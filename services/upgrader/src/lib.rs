//! Runtime side of fleetup.
//!
//! Where `fleetup-plan` decides what a round should do, this crate does it:
//!
//! - **Catalog**: live version lists, one lock per service
//! - **Backend**: the tool that applies, checks and rolls back versions
//! - **Executor**: one concurrent upgrade task per admitted service
//! - **Window scheduler**: rounds of select, execute, drain
//! - **Schedule runner**: pre-planned windows from a schedule document
//! - **State store / API**: task lifecycle for observers
//!
//! ## Round flow
//!
//! ```text
//! snapshot catalog -> select batch -> spawn tasks -> join all -> next round
//!                                        |
//!                        apply -> wait -> check ready (bounded by window)
//!                                        |
//!                          advance catalog  |  roll back
//! ```

pub mod api;
pub mod backend;
pub mod catalog;
pub mod config;
pub mod executor;
pub mod gate;
pub mod schedule;
pub mod state;
pub mod window;

pub use executor::{ExecutorError, TaskExecutor, TaskResult, UpgradeTask};
pub use window::{CloseReason, SchedulerConfig, WindowReport, WindowScheduler};
