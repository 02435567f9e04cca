use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use backtune::anthropic::AnthropicClient;
use backtune::cli::{Cli, Command};
use backtune::collab::Collaborators;
use backtune::config::AppConfig;
use backtune::evaluator::{HttpEvaluator, SyntheticEvaluator};
use backtune::observability;
use backtune::orchestrator::Runner;
use backtune::registry::JobRegistry;
use backtune::state_machine::{ControlAction, JobSnapshot, JobSpec, Params};
use backtune::suggester::{HeuristicSuggester, LlmCodeAnalyzer, LlmSuggester};
use backtune::ui::JobProgress;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    observability::init(cli.verbose);

    let config = AppConfig::load().context("failed to load backtune.toml")?;

    let (collab, mut spec) = match &cli.command {
        Command::Run { spec } => {
            let job_spec = JobSpec::from_path(spec)
                .with_context(|| format!("failed to read job spec {}", spec.display()))?;
            (live_collaborators(&config)?, job_spec)
        }
        Command::Demo => demo(),
    };

    if let Some(model) = cli.model {
        spec.model = Some(model);
    }
    if let Some(max_iterations) = cli.max_iterations {
        spec.max_iterations = Some(max_iterations);
    }
    if let Some(target_metric) = cli.target_metric {
        spec.target_metric = Some(target_metric);
    }

    let mut defaults = config.job_defaults();
    defaults.model = Some(config.default_model.clone());
    let registry = JobRegistry::new(Runner::new(collab), defaults);

    let id = registry.create(spec);
    let snap = watch(&registry, &id, Duration::from_millis(config.poll_interval_ms), cli.verbose).await?;
    println!("{}", serde_json::to_string_pretty(&snap)?);
    Ok(())
}

/// LLM suggester when an API key is configured, coordinate search otherwise.
fn live_collaborators(config: &AppConfig) -> Result<Collaborators> {
    let evaluator = Arc::new(HttpEvaluator::new(config.evaluator_url.clone())?);

    let collab = if config.api_key.is_empty() {
        tracing::warn!("no API key configured, using heuristic suggester");
        Collaborators::new(Arc::new(HeuristicSuggester::default()), evaluator.clone())
    } else {
        let client = AnthropicClient::new(config.api_key.clone())?;
        Collaborators::new(
            Arc::new(LlmSuggester::new(client.clone(), config.default_model.clone())),
            evaluator.clone(),
        )
        .with_analyzer(Arc::new(LlmCodeAnalyzer::new(client, config.default_model.clone())))
    };
    Ok(collab.with_cleaner(evaluator))
}

fn demo() -> (Collaborators, JobSpec) {
    let optimum: Params = json_params(json!({
        "stopLossPct": 0.04,
        "takeProfitPct": 0.12,
        "fastPeriod": 9,
    }));
    let config: Params = json_params(json!({
        "symbol": "BTC/USDT",
        "market": "Crypto",
        "timeframe": "4h",
        "startDate": "2024-01-01",
        "endDate": "2024-06-30",
        "initialCapital": 10000,
        "stopLossPct": 0.05,
        "takeProfitPct": 0.1,
        "fastPeriod": 12,
    }));

    let collab = Collaborators::new(
        Arc::new(HeuristicSuggester::default()),
        Arc::new(SyntheticEvaluator::new(optimum)),
    );
    let spec = JobSpec {
        config,
        max_iterations: Some(12),
        ..JobSpec::default()
    };
    (collab, spec)
}

fn json_params(value: serde_json::Value) -> Params {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => Params::new(),
    }
}

/// Polls the job until it reaches a terminal state. Ctrl-C requests a stop.
async fn watch(registry: &JobRegistry, id: &str, interval: Duration, verbose: bool) -> Result<JobSnapshot> {
    let snap = registry.get(id).context("job vanished from registry")?;
    let mut progress = JobProgress::start(&snap.target_metric);
    let mut ctrl_c = std::pin::pin!(tokio::signal::ctrl_c());
    let mut stop_sent = false;

    loop {
        let snap = registry.get(id).context("job vanished from registry")?;
        progress.update(&snap, verbose);
        if snap.status.is_terminal() {
            if stop_sent {
                // Give the runner a chance to finish cache cleanup.
                tokio::time::sleep(interval).await;
            }
            progress.complete(&snap);
            progress.print_summary(&snap);
            return Ok(snap);
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            res = &mut ctrl_c, if !stop_sent => {
                res.context("failed to listen for Ctrl-C")?;
                tracing::info!(job_id = %id, "interrupt received, stopping job");
                registry.control(id, ControlAction::Stop);
                stop_sent = true;
            }
        }
    }
}
