//! Input documents.
//!
//! Two JSON documents drive a run:
//!
//! - The **fleet document** describes the fleet for optimizer-driven windows:
//!   version lists, incompatible pairs, expected durations and parallelism.
//! - The **schedule document** lists pre-planned time windows, each with a
//!   start time, a length and the tasks to run inside it.
//!
//! Both are loaded once per run and never mutated afterwards.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::constraints::{ConstraintSet, Incompatibility};
use crate::error::PlanError;
use crate::selector::DurationTable;
use crate::versions::{CatalogSnapshot, VersionList};

/// Fleet description for optimizer-driven scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetDocument {
    /// Versions per service, current version first.
    pub available_versions: BTreeMap<String, Vec<String>>,

    #[serde(default)]
    pub incompatible_pairs: Vec<Incompatibility>,

    /// Expected upgrade duration per service, in seconds.
    pub upgrade_duration: BTreeMap<String, f64>,

    /// Maximum number of concurrently upgrading services.
    #[serde(alias = "parellel")]
    pub parallel: usize,
}

/// A validated fleet document.
#[derive(Debug, Clone)]
pub struct FleetPlan {
    pub catalog: CatalogSnapshot,
    pub constraints: ConstraintSet,
    pub durations: DurationTable,
    pub parallelism: usize,
}

impl FleetDocument {
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validate every cross reference and build the planning inputs.
    pub fn into_plan(self) -> Result<FleetPlan, PlanError> {
        if self.parallel == 0 {
            return Err(PlanError::InvalidParallelism);
        }

        let catalog = CatalogSnapshot::from_lists(self.available_versions)?;
        let constraints = ConstraintSet::new(self.incompatible_pairs);
        constraints.validate(&catalog)?;

        let durations = DurationTable::from_secs(self.upgrade_duration);
        durations.validate(&catalog)?;

        Ok(FleetPlan {
            catalog,
            constraints,
            durations,
            parallelism: self.parallel,
        })
    }
}

/// Root of a schedule document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleDocument {
    pub upgrade_schedule: UpgradeSchedule,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpgradeSchedule {
    #[serde(default)]
    pub time_windows: Vec<TimeWindow>,
}

/// Window length: either a number of seconds or a string like `"300s"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WindowLength {
    Seconds(u64),
    Text(String),
}

impl WindowLength {
    pub fn to_duration(&self) -> Result<Duration, PlanError> {
        let seconds = match self {
            WindowLength::Seconds(secs) => *secs,
            WindowLength::Text(text) => {
                let trimmed = text.trim();
                let digits = trimmed.strip_suffix('s').unwrap_or(trimmed);
                digits.parse::<u64>().map_err(|_| {
                    PlanError::InvalidDocument(format!("invalid window length: {text:?}"))
                })?
            }
        };
        Ok(Duration::from_secs(seconds))
    }
}

/// One scheduled maintenance window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeWindow {
    pub window_id: String,

    /// `YYYY.MM.DD.HH:MM`, or `HH:MM` for a time today.
    pub window_start_time: String,

    pub window_time: WindowLength,

    #[serde(default)]
    pub tasks: Vec<ScheduledTask>,
}

impl TimeWindow {
    /// Absolute start time; `HH:MM` is resolved against `today`.
    pub fn start_at(&self, today: NaiveDate) -> Result<NaiveDateTime, PlanError> {
        let text = self.window_start_time.trim();
        if let Ok(at) = NaiveDateTime::parse_from_str(text, "%Y.%m.%d.%H:%M") {
            return Ok(at);
        }
        NaiveTime::parse_from_str(text, "%H:%M")
            .map(|time| today.and_time(time))
            .map_err(|_| {
                PlanError::InvalidDocument(format!(
                    "window {}: invalid start time {:?}",
                    self.window_id, self.window_start_time
                ))
            })
    }

    pub fn length(&self) -> Result<Duration, PlanError> {
        self.window_time.to_duration()
    }

    /// `(start, end)` of the window.
    pub fn bounds(&self, today: NaiveDate) -> Result<(NaiveDateTime, NaiveDateTime), PlanError> {
        let start = self.start_at(today)?;
        let length = TimeDelta::from_std(self.length()?).map_err(|_| {
            PlanError::InvalidDocument(format!("window {}: length out of range", self.window_id))
        })?;
        Ok((start, start + length))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionPair {
    pub from: String,
    pub to: String,
}

/// Planned timeline of a task, in seconds from the window start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
}

fn default_region() -> String {
    "default".to_string()
}

/// One pre-planned upgrade inside a window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Service name.
    pub name: String,

    pub version: VersionPair,

    /// Deployment namespace.
    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default)]
    pub timeline: Timeline,

    /// Delay after window start before the upgrade begins. Defaults to
    /// `timeline.start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<f64>,
}

impl ScheduledTask {
    pub fn offset(&self) -> Result<Duration, PlanError> {
        let seconds = self.start_offset.unwrap_or(self.timeline.start);
        Duration::try_from_secs_f64(seconds).map_err(|_| {
            PlanError::InvalidDocument(format!("task {}: invalid start offset {seconds}", self.name))
        })
    }

    /// Wait between apply and readiness check: `timeline.end - timeline.start`.
    pub fn readiness_delay(&self) -> Result<Duration, PlanError> {
        let span = self.timeline.end - self.timeline.start;
        Duration::try_from_secs_f64(span).map_err(|_| {
            PlanError::InvalidDocument(format!(
                "task {}: timeline ends before it starts ({} > {})",
                self.name, self.timeline.start, self.timeline.end
            ))
        })
    }

    /// Planned duration, used for status reporting.
    pub fn expected_duration(&self) -> Duration {
        self.readiness_delay().unwrap_or_default()
    }
}

impl ScheduleDocument {
    pub fn from_json(json: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn windows(&self) -> &[TimeWindow] {
        &self.upgrade_schedule.time_windows
    }

    /// Reject malformed times, lengths, offsets, timelines and duplicate
    /// services within one window.
    pub fn validate(&self, today: NaiveDate) -> Result<(), PlanError> {
        for window in self.windows() {
            window.bounds(today)?;
            if window.length()?.is_zero() {
                return Err(PlanError::InvalidDocument(format!(
                    "window {}: zero length",
                    window.window_id
                )));
            }

            let mut seen = std::collections::HashSet::new();
            for task in &window.tasks {
                if task.name.is_empty() {
                    return Err(PlanError::InvalidDocument(format!(
                        "window {}: task without a name",
                        window.window_id
                    )));
                }
                if !seen.insert(task.name.as_str()) {
                    return Err(PlanError::InvalidDocument(format!(
                        "window {}: service {} scheduled twice",
                        window.window_id, task.name
                    )));
                }
                if task.version.from == task.version.to {
                    return Err(PlanError::InvalidDocument(format!(
                        "task {}: from and to are both {}",
                        task.name, task.version.from
                    )));
                }
                task.offset()?;
                task.readiness_delay()?;
            }
        }
        Ok(())
    }

    /// Version lists implied by the schedule, in order of appearance.
    ///
    /// A service upgraded `v1 -> v2` in one window and `v2 -> v3` in a later
    /// one yields `[v1, v2, v3]`.
    pub fn catalog(&self) -> Result<CatalogSnapshot, PlanError> {
        let mut lists: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for task in self.windows().iter().flat_map(|w| &w.tasks) {
            let list = lists.entry(task.name.clone()).or_default();
            for version in [&task.version.from, &task.version.to] {
                if !list.contains(version) {
                    list.push(version.clone());
                }
            }
        }

        let mut snapshot = CatalogSnapshot::new();
        for (service, versions) in lists {
            let list = VersionList::new(&service, versions)?;
            snapshot.insert(service, list);
        }
        Ok(snapshot)
    }
}
