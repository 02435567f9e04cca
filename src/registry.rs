//! Control surface: creates jobs, hands out snapshots and applies control actions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::orchestrator::Runner;
use crate::state_machine::{ControlAction, Job, JobDefaults, JobSnapshot, JobSpec};

/// Thread-safe table of jobs keyed by id.
///
/// Constructed and owned by the host process. Jobs are never removed here.
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Arc<Job>>>,
    runner: Arc<Runner>,
    defaults: JobDefaults,
}

impl JobRegistry {
    pub fn new(runner: Runner, defaults: JobDefaults) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            runner: Arc::new(runner),
            defaults,
        }
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, Arc<Job>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a job and starts its runner on a detached Tokio task.
    ///
    /// Returns immediately; the task is never joined. Must be called from
    /// within a Tokio runtime.
    pub fn create(&self, spec: JobSpec) -> String {
        let job = Arc::new(Job::new(spec, &self.defaults));
        let id = job.id.clone();
        self.jobs().insert(id.clone(), job.clone());
        tracing::info!(job_id = %id, target = %job.target_metric, max_iterations = job.max_iterations, "job created");

        let runner = self.runner.clone();
        tokio::spawn(async move { runner.run(job).await });
        id
    }

    pub fn get(&self, id: &str) -> Option<JobSnapshot> {
        let job = self.jobs().get(id).cloned()?;
        Some(job.snapshot())
    }

    /// Snapshots of every tracked job, oldest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let jobs: Vec<Arc<Job>> = self.jobs().values().cloned().collect();
        let mut snapshots: Vec<JobSnapshot> = jobs.iter().map(|j| j.snapshot()).collect();
        snapshots.sort_by_key(|s| s.created_at);
        snapshots
    }

    /// Applies `action` to the job. Returns `false` only when the id is unknown.
    pub fn control(&self, id: &str, action: ControlAction) -> bool {
        let Some(job) = self.jobs().get(id).cloned() else {
            tracing::warn!(job_id = %id, %action, "control on unknown job");
            return false;
        };
        job.apply(action);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::collab::Collaborators;
    use crate::orchestrator::testing::*;
    use crate::state_machine::JobStatus;

    struct Fixture {
        registry: JobRegistry,
        suggester: Arc<ScriptedSuggester>,
        evaluator: Arc<ScriptedEvaluator>,
        cleaner: Arc<CountingCleaner>,
    }

    fn fixture(suggester: ScriptedSuggester, evaluator: ScriptedEvaluator) -> Fixture {
        let suggester = Arc::new(suggester);
        let evaluator = Arc::new(evaluator);
        let cleaner = Arc::new(CountingCleaner::default());
        let collab = Collaborators::new(suggester.clone(), evaluator.clone())
            .with_cleaner(cleaner.clone());
        Fixture {
            registry: JobRegistry::new(Runner::new(collab), JobDefaults::default()),
            suggester,
            evaluator,
            cleaner,
        }
    }

    async fn wait_for_status(registry: &JobRegistry, id: &str, status: JobStatus) -> JobSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snap = registry.get(id).unwrap();
                if snap.status == status {
                    return snap;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not reach expected status")
    }

    #[tokio::test]
    async fn create_runs_job_to_completion() {
        let f = fixture(
            ScriptedSuggester::new(vec![
                params(json!({"stopLossPct": 0.03})),
                params(json!({"stopLossPct": 0.04})),
                params(json!({"stopLossPct": 0.06})),
            ]),
            ScriptedEvaluator::new(vec![Some(0.10), Some(0.05), Some(0.20), Some(0.15)]),
        );
        let spec = JobSpec::from_json(
            r#"{"config": {"stopLossPct": 0.05}, "max_iterations": 3}"#,
        )
        .unwrap();
        let id = f.registry.create(spec);

        let snap = wait_for_status(&f.registry, &id, JobStatus::Completed).await;
        assert_eq!(snap.id, id);
        assert_eq!(snap.history.len(), 4);
        assert_eq!(snap.current_iteration, snap.max_iterations);
        assert_eq!(snap.best_result.unwrap().metrics["totalReturn"], 20.0);
        assert_eq!(snap.target_metric, "totalReturn");
    }

    #[tokio::test]
    async fn create_applies_defaults() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(ScriptedSuggester::default(), ScriptedEvaluator::gated(vec![], gate));
        let id = f.registry.create(JobSpec::default());
        let snap = f.registry.get(&id).unwrap();
        assert_eq!(snap.max_iterations, 10);
        assert_eq!(snap.target_metric, "totalReturn");
        assert!(matches!(snap.status, JobStatus::Pending | JobStatus::Running));
    }

    #[tokio::test]
    async fn unknown_job() {
        let f = fixture(ScriptedSuggester::default(), ScriptedEvaluator::default());
        assert!(f.registry.get("nope").is_none());
        assert!(!f.registry.control("nope", ControlAction::Stop));
    }

    #[tokio::test]
    async fn stop_right_after_create_never_suggests() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(
            ScriptedSuggester::new(vec![params(json!({"a": 2}))]),
            ScriptedEvaluator::gated(vec![Some(0.1)], gate.clone()),
        );
        let id = f
            .registry
            .create(JobSpec::from_json(r#"{"config": {"a": 1}, "max_iterations": 3}"#).unwrap());
        assert!(f.registry.control(&id, ControlAction::Stop));
        gate.add_permits(10);

        let snap = wait_for_status(&f.registry, &id, JobStatus::Cancelled).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.cleaner.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(f.suggester.calls(), 0);
        assert!(f.evaluator.calls() <= 1);
        assert!(snap.history.len() <= 1);
        assert_eq!(f.registry.get(&id).unwrap().status, JobStatus::Cancelled);
        assert_eq!(f.cleaner.calls(), 1);
    }

    #[tokio::test]
    async fn control_actions_are_idempotent() {
        let gate = Arc::new(Semaphore::new(0));
        let f = fixture(
            ScriptedSuggester::new(vec![params(json!({"a": 2}))]),
            ScriptedEvaluator::gated(vec![Some(0.1)], gate.clone()),
        );
        let id = f
            .registry
            .create(JobSpec::from_json(r#"{"config": {"a": 1}, "max_iterations": 2}"#).unwrap());
        wait_for_status(&f.registry, &id, JobStatus::Running).await;

        assert!(f.registry.control(&id, ControlAction::Pause));
        assert!(f.registry.control(&id, ControlAction::Pause));
        assert_eq!(f.registry.get(&id).unwrap().status, JobStatus::Paused);

        assert!(f.registry.control(&id, ControlAction::Resume));
        assert!(f.registry.control(&id, ControlAction::Resume));
        assert_eq!(f.registry.get(&id).unwrap().status, JobStatus::Running);

        assert!(f.registry.control(&id, ControlAction::Stop));
        assert!(f.registry.control(&id, ControlAction::Stop));
        gate.add_permits(10);
        let snap = wait_for_status(&f.registry, &id, JobStatus::Cancelled).await;
        assert!(snap.logs.iter().any(|l| l.contains("Job cancelled by user.")));
    }

    #[tokio::test]
    async fn list_returns_every_job() {
        let f = fixture(
            ScriptedSuggester::new(vec![params(json!({"a": 2}))]),
            ScriptedEvaluator::default(),
        );
        let first = f.registry.create(JobSpec::from_json(r#"{"config": {"a": 1}, "max_iterations": 1}"#).unwrap());
        let second = f.registry.create(JobSpec::from_json(r#"{"config": {"a": 1}, "max_iterations": 1}"#).unwrap());
        let ids: Vec<String> = f.registry.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&first) && ids.contains(&second));
    }
}
