use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::collab::{
    Collaborators, EvaluationRequest, EvaluationResult, StrategyAnalysis, SuggestionRequest,
};
use crate::error::{FailureKind, Result};
use crate::metrics::{beats, display_value, format_trade, market_synopsis, summarize_trades, to_percentage};
use crate::state_machine::{BestResult, IterationRecord, Job, JobStatus, Params};

const BASELINE_REASONING: &str = "Baseline run";
const NO_CODE_SUMMARY: &str = "No strategy code provided.";
const FAILED_ANALYSIS_SUMMARY: &str = "Analysis failed.";

/// Splits a suggested delta into keys present in `config` and unknown keys.
pub fn filter_allowed(suggested: Params, config: &Params) -> (Params, Vec<String>) {
    let mut rejected = Vec::new();
    let allowed = suggested
        .into_iter()
        .filter(|(k, _)| {
            let known = config.contains_key(k);
            if !known {
                rejected.push(k.clone());
            }
            known
        })
        .collect();
    (allowed, rejected)
}

/// Drives one job from `pending` to a terminal state.
///
/// Phases run strictly in order on the job's own task: one-time strategy
/// analysis, the baseline evaluation, then up to `max_iterations` rounds of
/// suggest → evaluate → record. Stop and pause are observed only at the
/// checkpoint at the top of each round.
pub struct Runner {
    collab: Collaborators,
}

impl Runner {
    pub fn new(collab: Collaborators) -> Self {
        Self { collab }
    }

    /// Runs the job to completion and always releases evaluator-side caches.
    pub async fn run(&self, job: Arc<Job>) {
        self.drive(&job).await;
        self.cleanup(&job).await;
    }

    async fn drive(&self, job: &Job) {
        if job.is_stopped() || !job.transition(JobStatus::Running) {
            job.log("Job cancelled before start.");
            return;
        }
        job.log(format!(
            "Starting optimization. Target: {}, Max Iterations: {}, Model: {}",
            job.target_metric,
            job.max_iterations,
            job.model.as_deref().unwrap_or("Default")
        ));

        self.prepare_context(job).await;
        if job.is_stopped() {
            return;
        }

        let Some(mut last) = self.run_baseline(job).await else {
            return;
        };

        for i in 1..=job.max_iterations {
            if job.is_stopped() {
                break;
            }
            if job.signals().paused {
                job.log("Waiting for resume...");
            }
            if !job.wait_while_paused().await {
                break;
            }

            job.set_current_iteration(i);
            job.log(format!("--- Iteration {i} ---"));
            if let Some(result) = self.run_round(job, i, &last).await {
                last = result;
            }
        }

        if job.transition(JobStatus::Completed) {
            let best = job.with_state(|s| {
                display_value(s.best_result.as_ref().map(|b| &b.metrics), &job.target_metric)
            });
            job.log(format!(
                "Optimization complete. Best {}: {best}",
                job.target_metric
            ));
        }
    }

    /// Analyzes the strategy code once; merges discovered tunables into the
    /// config without overwriting caller-supplied values.
    async fn prepare_context(&self, job: &Job) {
        if job.with_state(|s| s.analysis.is_some()) {
            return;
        }

        let code = job.strategy_code.clone().or_else(|| {
            job.with_state(|s| {
                s.config
                    .get("strategy_code")
                    .and_then(Value::as_str)
                    .filter(|c| !c.trim().is_empty())
                    .map(str::to_string)
            })
        });

        let analysis = match &code {
            None => StrategyAnalysis {
                summary: NO_CODE_SUMMARY.into(),
                ..Default::default()
            },
            Some(code) => {
                job.log("Agent is analyzing strategy code (One-time)...");
                let started = Instant::now();
                match self.collab.analyzer.analyze(code, job.model.as_deref()).await {
                    Ok(analysis) => {
                        job.log(format!(
                            "Strategy analysis complete ({:.1}s)",
                            started.elapsed().as_secs_f64()
                        ));
                        job.log(format!("Strategy Analysis: {}", analysis.summary));
                        analysis
                    }
                    Err(e) => {
                        job.warn(format!("Strategy analysis failed: {e}"));
                        StrategyAnalysis {
                            summary: FAILED_ANALYSIS_SUMMARY.into(),
                            ..Default::default()
                        }
                    }
                }
            }
        };

        job.with_state(|s| {
            for (key, value) in &analysis.params {
                s.config.entry(key.clone()).or_insert_with(|| value.clone());
            }
            s.source_artifact = analysis.rewritten_code.clone().or(code);
            s.analysis = Some(analysis);
        });
    }

    async fn evaluate(&self, job: &Job, params: &Params) -> Result<EvaluationResult> {
        let (source, strategy_keys) = job.with_state(|s| {
            let keys: Vec<String> = s
                .analysis
                .as_ref()
                .map(|a| a.params.keys().cloned().collect())
                .unwrap_or_default();
            (s.source_artifact.clone(), keys)
        });
        let request = EvaluationRequest::from_params(&job.id, params, source, &strategy_keys);
        self.collab.evaluator.evaluate(&request).await
    }

    /// Iteration 0. Failure here ends the job as `failed`.
    async fn run_baseline(&self, job: &Job) -> Option<EvaluationResult> {
        job.log("Running baseline backtest...");
        let params = job.with_state(|s| s.config.clone());

        let result = match self.evaluate(job, &params).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(job_id = %job.id, kind = %FailureKind::Fatal, error = %e, "baseline evaluation failed");
                job.log(format!("Baseline failed: {e}"));
                job.fail(e.to_string());
                return None;
            }
        };

        if let Some(line) = result.market_context.as_ref().and_then(market_synopsis) {
            job.log(line);
        }

        let metrics = to_percentage(&result.metrics);
        job.record(IterationRecord {
            iteration: 0,
            params: params.clone(),
            metrics: metrics.clone(),
            reasoning: BASELINE_REASONING.into(),
        });
        let baseline_value = display_value(Some(&metrics), &job.target_metric);
        job.with_state(|s| {
            s.market_context = result.market_context.clone();
            s.best_result = Some(BestResult { params, metrics });
        });
        job.log(format!(
            "Baseline Result: {}={baseline_value}",
            job.target_metric
        ));
        self.log_trades(job, &result);

        Some(result)
    }

    fn suggestion_request(&self, job: &Job, i: u32, last: &EvaluationResult) -> SuggestionRequest {
        job.with_state(|s| SuggestionRequest {
            iteration: i,
            target_metric: job.target_metric.clone(),
            history: s.history.clone(),
            best_result: s.best_result.clone(),
            market_context: s.market_context.clone(),
            recent_trades_summary: summarize_trades(&last.trade_events),
            strategy_summary: s
                .analysis
                .as_ref()
                .map_or_else(|| NO_CODE_SUMMARY.to_string(), |a| a.summary.clone()),
            language: job.language.clone(),
            model: job.model.clone(),
            allowed_keys: s.config.keys().cloned().collect(),
        })
    }

    /// One optimization round. Returns the evaluation result when the round
    /// produced a history record; every failure here is isolated to the round.
    async fn run_round(&self, job: &Job, i: u32, last: &EvaluationResult) -> Option<EvaluationResult> {
        let request = self.suggestion_request(job, i, last);
        let best_value = display_value(
            request.best_result.as_ref().map(|b| &b.metrics),
            &job.target_metric,
        );
        job.log(format!(
            "Agent is analyzing history (Current best {}: {best_value})...",
            job.target_metric
        ));

        let started = Instant::now();
        let suggestion = match self.collab.suggester.suggest(&request).await {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(job_id = %job.id, iteration = i, error = %e, "suggester failed");
                job.warn(format!("Iteration {i} Error: {e}"));
                return None;
            }
        };
        job.log(format!(
            "Agent analysis took {:.1}s",
            started.elapsed().as_secs_f64()
        ));

        let base = job.with_state(|s| s.config.clone());
        let (delta, rejected) = filter_allowed(suggestion.suggested_params, &base);
        if !rejected.is_empty() {
            job.warn(format!(
                "Ignoring suggested keys not in config: {}",
                rejected.join(", ")
            ));
        }
        if delta.is_empty() {
            tracing::warn!(job_id = %job.id, iteration = i, kind = %FailureKind::EmptySuggestion, "no usable suggestion");
            job.warn("Agent failed to suggest parameters. Skipping iteration.");
            return None;
        }
        job.log(format!("Agent Hypothesis: {}", suggestion.reasoning));

        let mut merged = base;
        merged.extend(delta.clone());
        job.log(format!(
            "Running backtest with params: {}",
            serde_json::to_string(&merged).unwrap_or_default()
        ));
        let strategy_params: Params = job.with_state(|s| {
            s.analysis
                .as_ref()
                .map(|a| {
                    a.params
                        .keys()
                        .filter_map(|k| merged.get(k).map(|v| (k.clone(), v.clone())))
                        .collect()
                })
                .unwrap_or_default()
        });
        if !strategy_params.is_empty() {
            job.log(format!(
                "Optimized Strategy Params: {}",
                serde_json::to_string(&strategy_params).unwrap_or_default()
            ));
        }

        let started = Instant::now();
        let result = match self.evaluate(job, &merged).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(job_id = %job.id, iteration = i, kind = %FailureKind::Recoverable, error = %e, "round evaluation failed");
                job.warn(format!("Iteration {i} Error: {e}"));
                return None;
            }
        };
        job.log(format!(
            "Backtest execution took {:.1}s",
            started.elapsed().as_secs_f64()
        ));
        self.log_trades(job, &result);

        let metrics = to_percentage(&result.metrics);
        job.record(IterationRecord {
            iteration: i,
            params: delta,
            metrics: metrics.clone(),
            reasoning: suggestion.reasoning,
        });

        let target = &job.target_metric;
        let current = display_value(Some(&metrics), target);
        let (improved, previous) = job.with_state(|s| {
            let best = s.best_result.as_ref().map(|b| &b.metrics);
            let previous = display_value(best, target);
            if beats(&metrics, best, target) {
                s.best_result = Some(BestResult {
                    params: merged,
                    metrics,
                });
                (true, previous)
            } else {
                (false, previous)
            }
        });
        if improved {
            job.log(format!("New Best Found! {target}: {previous} -> {current}"));
        } else {
            job.log(format!("Result ({current}) did not beat best ({previous})."));
        }

        Some(result)
    }

    fn log_trades(&self, job: &Job, result: &EvaluationResult) {
        if result.trade_events.is_empty() {
            job.log("No trades executed.");
            return;
        }
        job.log(format!("Total Trades: {}", result.trade_events.len()));
        for (idx, trade) in result.trade_events.iter().enumerate() {
            job.log(format_trade(idx, trade));
        }
    }

    async fn cleanup(&self, job: &Job) {
        match self.collab.cleaner.cleanup(&job.id).await {
            Ok(()) => tracing::info!(job_id = %job.id, "cleaned up evaluator cache"),
            Err(e) => {
                tracing::error!(job_id = %job.id, kind = %FailureKind::Cleanup, error = %e, "cache cleanup failed");
                job.warn(format!("Cache cleanup failed: {e}"));
            }
        }
    }
}
