mod job;
mod state;

pub use job::{
    BestResult, ControlSignals, DEFAULT_LANGUAGE, DEFAULT_MAX_ITERATIONS, DEFAULT_TARGET_METRIC,
    IterationRecord, Job, JobDefaults, JobSnapshot, JobSpec, LOG_CAPACITY, LogBuffer, Metrics,
    Params,
};
pub use state::{ControlAction, JobStatus};
