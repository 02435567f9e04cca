use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use super::state::{ControlAction, JobStatus};
use crate::collab::StrategyAnalysis;
use crate::error::{OptimizerError, Result};

/// Flat parameter mapping handed to the evaluator.
pub type Params = BTreeMap<String, Value>;

/// Named numeric results reported by the evaluator.
pub type Metrics = BTreeMap<String, f64>;

/// Maximum number of narration lines kept per job.
pub const LOG_CAPACITY: usize = 500;
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_TARGET_METRIC: &str = "totalReturn";
pub const DEFAULT_LANGUAGE: &str = "zh-CN";

/// Input accepted by [`JobRegistry::create`](crate::registry::JobRegistry::create).
///
/// Absent fields fall back to [`JobDefaults`]; nothing else is validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub config: Params,
    #[serde(default)]
    pub strategy_code: Option<String>,
    #[serde(default)]
    pub target_metric: Option<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl JobSpec {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| OptimizerError::Config(format!("invalid job spec: {e}")))
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| OptimizerError::Config(format!("invalid job spec: {e}")))
    }

    /// Reads a spec from a `.toml` file, or JSON for any other extension.
    pub fn from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml(&contents),
            _ => Self::from_json(&contents),
        }
    }
}

/// Values applied to absent [`JobSpec`] fields.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub max_iterations: u32,
    pub target_metric: String,
    pub language: String,
    pub model: Option<String>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            target_metric: DEFAULT_TARGET_METRIC.to_string(),
            language: DEFAULT_LANGUAGE.to_string(),
            model: None,
        }
    }
}

/// One recorded evaluation. Iteration 0 is the baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub params: Params,
    pub metrics: Metrics,
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestResult {
    pub params: Params,
    pub metrics: Metrics,
}

/// Ring buffer of timestamped narration lines, oldest evicted first.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn push(&mut self, message: &str) {
        let ts = Local::now().format("%H:%M:%S");
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(format!("[{ts}] {message}"));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.entries.iter().cloned().collect()
    }
}

/// Cooperative control signals shared between the control surface and the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlSignals {
    /// One-way cancellation flag.
    pub stop: bool,
    /// Pause gate; `true` means the gate is closed.
    pub paused: bool,
}

/// Mutable part of a job. Only the runner touches history, best result and config.
#[derive(Debug)]
pub(crate) struct JobState {
    pub status: JobStatus,
    pub current_iteration: u32,
    pub config: Params,
    pub history: Vec<IterationRecord>,
    pub best_result: Option<BestResult>,
    pub logs: LogBuffer,
    pub error: Option<String>,
    pub analysis: Option<StrategyAnalysis>,
    /// Strategy source handed to the evaluator, resolved once with the analysis.
    pub source_artifact: Option<String>,
    pub market_context: Option<Value>,
}

/// Read-only view of a job handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: String,
    pub status: JobStatus,
    pub target_metric: String,
    pub current_iteration: u32,
    pub max_iterations: u32,
    pub history: Vec<IterationRecord>,
    pub logs: Vec<String>,
    pub best_result: Option<BestResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A single optimization run.
#[derive(Debug)]
pub struct Job {
    pub id: String,
    pub target_metric: String,
    pub max_iterations: u32,
    pub model: Option<String>,
    pub language: String,
    pub strategy_code: Option<String>,
    pub created_at: DateTime<Utc>,
    state: Mutex<JobState>,
    signals: watch::Sender<ControlSignals>,
}

impl Job {
    pub fn new(spec: JobSpec, defaults: &JobDefaults) -> Self {
        let (signals, _) = watch::channel(ControlSignals::default());
        Self {
            id: Uuid::new_v4().to_string(),
            target_metric: spec
                .target_metric
                .unwrap_or_else(|| defaults.target_metric.clone()),
            max_iterations: spec.max_iterations.unwrap_or(defaults.max_iterations),
            model: spec.model.or_else(|| defaults.model.clone()),
            language: spec.language.unwrap_or_else(|| defaults.language.clone()),
            strategy_code: spec.strategy_code.filter(|c| !c.trim().is_empty()),
            created_at: Utc::now(),
            state: Mutex::new(JobState {
                status: JobStatus::Pending,
                current_iteration: 0,
                config: spec.config,
                history: Vec::new(),
                best_result: None,
                logs: LogBuffer::with_capacity(LOG_CAPACITY),
                error: None,
                analysis: None,
                source_artifact: None,
                market_context: None,
            }),
            signals,
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` with exclusive access to the mutable state.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut JobState) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.lock();
        JobSnapshot {
            id: self.id.clone(),
            status: state.status,
            target_metric: self.target_metric.clone(),
            current_iteration: state.current_iteration,
            max_iterations: self.max_iterations,
            history: state.history.clone(),
            logs: state.logs.to_vec(),
            best_result: state.best_result.clone(),
            error: state.error.clone(),
            created_at: self.created_at,
        }
    }

    pub fn status(&self) -> JobStatus {
        self.lock().status
    }

    /// Appends a narration line and mirrors it to the tracing output.
    pub fn log(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(job_id = %self.id, "{message}");
        self.lock().logs.push(message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!(job_id = %self.id, "{message}");
        self.lock().logs.push(message);
    }

    /// Moves to `next` if the state machine allows it. Returns whether it moved.
    pub fn transition(&self, next: JobStatus) -> bool {
        let mut state = self.lock();
        if state.status.can_transition_to(next) {
            tracing::debug!(job_id = %self.id, from = %state.status, to = %next, "status change");
            state.status = next;
            true
        } else {
            false
        }
    }

    /// Marks the job failed with `error`, unless it already reached a terminal state.
    pub fn fail(&self, error: String) -> bool {
        let mut state = self.lock();
        if state.status.can_transition_to(JobStatus::Failed) {
            state.status = JobStatus::Failed;
            state.error = Some(error);
            true
        } else {
            false
        }
    }

    pub fn signals(&self) -> ControlSignals {
        *self.signals.borrow()
    }

    pub fn is_stopped(&self) -> bool {
        self.signals.borrow().stop
    }

    /// Blocks while the pause gate is closed. Returns `false` if the job was
    /// stopped, either before or while waiting.
    pub async fn wait_while_paused(&self) -> bool {
        let mut rx = self.signals.subscribe();
        match rx.wait_for(|s| s.stop || !s.paused).await {
            Ok(signals) => !signals.stop,
            Err(_) => false,
        }
    }

    /// Applies an external control action. Every action is idempotent.
    pub fn apply(&self, action: ControlAction) {
        match action {
            ControlAction::Pause => {
                let mut state = self.lock();
                if state.status == JobStatus::Running {
                    self.signals.send_modify(|s| s.paused = true);
                    state.status = JobStatus::Paused;
                    state.logs.push("Job paused by user.");
                    tracing::info!(job_id = %self.id, "job paused");
                }
            }
            ControlAction::Resume => {
                self.signals.send_modify(|s| s.paused = false);
                let mut state = self.lock();
                if state.status == JobStatus::Paused {
                    state.status = JobStatus::Running;
                    state.logs.push("Job resumed.");
                    tracing::info!(job_id = %self.id, "job resumed");
                }
            }
            ControlAction::Stop => {
                let mut state = self.lock();
                if !state.status.is_terminal() {
                    self.signals.send_modify(|s| s.stop = true);
                    state.status = JobStatus::Cancelled;
                    state.logs.push("Job cancelled by user.");
                    tracing::info!(job_id = %self.id, "job cancelled");
                }
            }
        }
    }

    pub fn set_current_iteration(&self, iteration: u32) {
        self.lock().current_iteration = iteration.min(self.max_iterations);
    }

    /// Appends a history record. Records must arrive in increasing iteration order.
    pub fn record(&self, record: IterationRecord) {
        let mut state = self.lock();
        debug_assert!(
            state
                .history
                .last()
                .is_none_or(|last| last.iteration < record.iteration),
            "history must stay strictly ordered"
        );
        state.history.push(record);
    }
}
