//! Contracts for the external collaborators driven by the runner.
//!
//! The runner never knows how suggestions are produced or how a backtest is
//! computed; it only talks to these traits. Concrete adapters live in
//! [`crate::suggester`] and [`crate::evaluator`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::state_machine::{BestResult, IterationRecord, Metrics, Params};

/// Everything the suggester gets to look at before proposing the next round.
#[derive(Debug, Clone, Serialize)]
pub struct SuggestionRequest {
    /// Round being prepared, starting at 1. Advances even when a round
    /// leaves no history record.
    pub iteration: u32,
    pub target_metric: String,
    pub history: Vec<IterationRecord>,
    pub best_result: Option<BestResult>,
    pub market_context: Option<Value>,
    pub recent_trades_summary: String,
    pub strategy_summary: String,
    pub language: String,
    pub model: Option<String>,
    /// Keys the suggester may touch; anything else is discarded by the runner.
    pub allowed_keys: Vec<String>,
}

/// A proposed parameter delta. An empty `suggested_params` means "no suggestion".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub suggested_params: Params,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAssumptions {
    pub commission: f64,
    pub slippage: f64,
    pub leverage: u32,
    pub direction: String,
}

/// Input of one backtest run.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationRequest {
    pub merged_params: Params,
    /// Strategy source handed to the backtest engine, if any.
    pub source_artifact: Option<String>,
    /// Subset of `merged_params` owned by the strategy code itself.
    pub strategy_params: Params,
    pub market: Option<String>,
    pub symbol: Option<String>,
    pub timeframe: String,
    pub initial_capital: f64,
    pub window: ExecutionWindow,
    pub costs: CostAssumptions,
    /// Evaluator-side cache key; always the job id.
    pub cache_key: String,
}

/// One trade event reported by the evaluator.
///
/// Fields are decoded leniently: `null`, missing or mistyped values become
/// empty strings or `0.0` instead of failing the whole evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    #[serde(default, deserialize_with = "lenient_string")]
    pub time: String,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub price: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub amount: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub profit: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub balance: f64,
}

fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    Ok(match Option::<Value>::deserialize(d)? {
        Some(Value::String(s)) => s,
        None | Some(Value::Null) => String::new(),
        Some(other) => other.to_string(),
    })
}

/// Output of one backtest run. Metrics are in the evaluator's raw units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default, alias = "trades")]
    pub trade_events: Vec<TradeEvent>,
    #[serde(default)]
    pub market_context: Option<Value>,
}

/// One-time structural analysis of the strategy source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyAnalysis {
    #[serde(default)]
    pub summary: String,
    /// Tunable parameters discovered in the code, with their current values.
    #[serde(default)]
    pub params: Params,
    /// Code rewritten to read its tunables from injected params.
    #[serde(default)]
    pub rewritten_code: Option<String>,
}

#[async_trait]
pub trait Suggester: Send + Sync {
    async fn suggest(&self, request: &SuggestionRequest) -> Result<Suggestion>;
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResult>;
}

#[async_trait]
pub trait CodeAnalyzer: Send + Sync {
    async fn analyze(&self, code: &str, model: Option<&str>) -> Result<StrategyAnalysis>;
}

/// Releases evaluator-side data cached under a job id. Must be idempotent.
#[async_trait]
pub trait CacheCleaner: Send + Sync {
    async fn cleanup(&self, job_id: &str) -> Result<()>;
}

/// Analyzer used when no model is available: reports without touching config.
pub struct NoopAnalyzer;

#[async_trait]
impl CodeAnalyzer for NoopAnalyzer {
    async fn analyze(&self, _code: &str, _model: Option<&str>) -> Result<StrategyAnalysis> {
        Ok(StrategyAnalysis {
            summary: "Strategy code attached; no analyzer configured.".into(),
            ..Default::default()
        })
    }
}

/// Cleaner for evaluators that keep no per-job cache.
pub struct NoopCleaner;

#[async_trait]
impl CacheCleaner for NoopCleaner {
    async fn cleanup(&self, _job_id: &str) -> Result<()> {
        Ok(())
    }
}

/// The set of collaborators a runner drives.
#[derive(Clone)]
pub struct Collaborators {
    pub suggester: Arc<dyn Suggester>,
    pub evaluator: Arc<dyn Evaluator>,
    pub analyzer: Arc<dyn CodeAnalyzer>,
    pub cleaner: Arc<dyn CacheCleaner>,
}

impl Collaborators {
    /// Bundles a suggester and evaluator with no-op analysis and cleanup.
    pub fn new(suggester: Arc<dyn Suggester>, evaluator: Arc<dyn Evaluator>) -> Self {
        Self {
            suggester,
            evaluator,
            analyzer: Arc::new(NoopAnalyzer),
            cleaner: Arc::new(NoopCleaner),
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn CodeAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_cleaner(mut self, cleaner: Arc<dyn CacheCleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }
}
