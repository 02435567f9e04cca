//! Evaluator adapters: the HTTP backtest service and a synthetic scoring surface.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::collab::{
    CacheCleaner, CostAssumptions, EvaluationRequest, EvaluationResult, Evaluator,
    ExecutionWindow, TradeEvent,
};
use crate::error::{OptimizerError, Result};
use crate::state_machine::{Metrics, Params};

const DEFAULT_COMMISSION: f64 = 0.0002;
const DEFAULT_CAPITAL: f64 = 10_000.0;
const DEFAULT_TIMEFRAME: &str = "1d";

fn get_str(params: &Params, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Reads a number that may also arrive as a numeric string.
fn get_f64(params: &Params, key: &str) -> Option<f64> {
    match params.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn get_bool(params: &Params, key: &str) -> bool {
    match params.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Parses an RFC 3339 timestamp or a `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if raw.contains('T') {
        return DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|d| d.with_timezone(&Utc));
    }
    let day = raw.get(..10).unwrap_or(raw);
    NaiveDate::parse_from_str(day, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
}

fn date_or_now(params: &Params, key: &str) -> DateTime<Utc> {
    match get_str(params, key).as_deref().map(|raw| (raw, parse_date(raw))) {
        Some((_, Some(date))) => date,
        Some((raw, None)) => {
            tracing::warn!(key, raw, "unparseable date, using current time");
            Utc::now()
        }
        None => Utc::now(),
    }
}

impl EvaluationRequest {
    /// Derives an evaluation request from a flat parameter mapping.
    ///
    /// `strategy_keys` are the tunables owned by the strategy code; they are
    /// forwarded untouched in `strategy_params`.
    pub fn from_params<'a>(
        cache_key: &str,
        params: &Params,
        source_artifact: Option<String>,
        strategy_keys: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        let strategy_params = strategy_keys
            .into_iter()
            .filter_map(|k| params.get(k).map(|v| (k.clone(), v.clone())))
            .collect();
        let timeframe = get_str(params, "selectedTimeframe")
            .or_else(|| get_str(params, "timeframe"))
            .unwrap_or_else(|| DEFAULT_TIMEFRAME.to_string());
        let leverage = get_f64(params, "leverage").map_or(1, |l| l.max(1.0) as u32);

        Self {
            merged_params: params.clone(),
            source_artifact,
            strategy_params,
            market: get_str(params, "market"),
            symbol: get_str(params, "symbol"),
            timeframe,
            initial_capital: get_f64(params, "initialCapital").unwrap_or(DEFAULT_CAPITAL),
            window: ExecutionWindow {
                start: date_or_now(params, "startDate"),
                end: date_or_now(params, "endDate"),
            },
            costs: CostAssumptions {
                commission: get_f64(params, "commission").unwrap_or(DEFAULT_COMMISSION),
                slippage: get_f64(params, "slippage").unwrap_or(0.0),
                leverage,
                direction: get_str(params, "tradeDirection").unwrap_or_else(|| "both".into()),
            },
            cache_key: cache_key.to_string(),
        }
    }

    /// Nested risk/position/scale configuration expected by the backtest engine.
    pub fn strategy_config(&self) -> Value {
        let p = &self.merged_params;
        let f = |k: &str| get_f64(p, k).unwrap_or(0.0);
        let scale = |prefix: &str| {
            json!({
                "enabled": get_bool(p, &format!("{prefix}Enabled")),
                "stepPct": f(&format!("{prefix}StepPct")),
                "sizePct": f(&format!("{prefix}SizePct")),
                "maxTimes": get_f64(p, &format!("{prefix}MaxTimes")).unwrap_or(0.0) as u32,
            })
        };
        json!({
            "params": self.strategy_params,
            "risk": {
                "stopLossPct": f("stopLossPct"),
                "takeProfitPct": f("takeProfitPct"),
                "trailing": {
                    "enabled": get_bool(p, "trailingEnabled"),
                    "pct": f("trailingStopPct"),
                    "activationPct": f("trailingActivationPct"),
                },
            },
            "position": {
                "entryPct": get_f64(p, "entryPct").unwrap_or(1.0),
            },
            "scale": {
                "trendAdd": scale("trendAdd"),
                "dcaAdd": scale("dcaAdd"),
                "trendReduce": scale("trendReduce"),
                "adverseReduce": scale("adverseReduce"),
            },
        })
    }
}

/// Talks to a backtest service over HTTP.
///
/// `POST {base}/api/indicator/backtest` runs a backtest;
/// `DELETE {base}/api/indicator/backtest/cache/{job_id}` drops its cached data.
pub struct HttpEvaluator {
    client: Client,
    base_url: String,
}

/// Response envelope; the payload may be wrapped in `data`.
#[derive(Debug, Deserialize)]
struct BacktestEnvelope {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl HttpEvaluator {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(600))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn body(request: &EvaluationRequest) -> Value {
        json!({
            "indicatorCode": request.source_artifact,
            "market": request.market,
            "symbol": request.symbol,
            "timeframe": request.timeframe,
            "startDate": request.window.start.to_rfc3339(),
            "endDate": request.window.end.to_rfc3339(),
            "initialCapital": request.initial_capital,
            "commission": request.costs.commission,
            "slippage": request.costs.slippage,
            "leverage": request.costs.leverage,
            "tradeDirection": request.costs.direction,
            "strategyConfig": request.strategy_config(),
            "cacheKey": request.cache_key,
        })
    }
}

/// Lenient decoding: numeric metrics only, null and non-numeric entries dropped.
fn parse_result(payload: Value) -> Result<EvaluationResult> {
    let Value::Object(mut obj) = payload else {
        return Err(OptimizerError::Evaluation(
            "backtest response is not an object".into(),
        ));
    };
    let metrics: Metrics = match obj.remove("metrics") {
        Some(Value::Object(m)) => m
            .into_iter()
            .filter_map(|(k, v)| v.as_f64().map(|v| (k, v)))
            .collect(),
        _ => {
            return Err(OptimizerError::Evaluation(
                "backtest response has no metrics".into(),
            ));
        }
    };
    let trade_events: Vec<TradeEvent> = match obj.remove("trades") {
        Some(v) if !v.is_null() => serde_json::from_value(v)?,
        _ => Vec::new(),
    };
    let market_context = obj.remove("market_context").filter(|v| !v.is_null());
    Ok(EvaluationResult {
        metrics,
        trade_events,
        market_context,
    })
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResult> {
        let url = format!("{}/api/indicator/backtest", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&Self::body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OptimizerError::Evaluation(format!(
                "backtest service returned {}: {message}",
                status.as_u16()
            )));
        }

        let raw: Value = response.json().await?;
        let envelope: BacktestEnvelope = serde_json::from_value(raw.clone())?;
        match envelope {
            BacktestEnvelope {
                code: Some(code), msg, ..
            } if code != 1 && code != 0 => Err(OptimizerError::Evaluation(
                msg.unwrap_or_else(|| format!("backtest service error code {code}")),
            )),
            BacktestEnvelope { data: Some(data), .. } => parse_result(data),
            _ => parse_result(raw),
        }
    }
}

#[async_trait]
impl CacheCleaner for HttpEvaluator {
    async fn cleanup(&self, job_id: &str) -> Result<()> {
        let url = format!("{}/api/indicator/backtest/cache/{job_id}", self.base_url);
        let response = self.client.delete(&url).send().await?;
        let status = response.status();
        // Already gone counts as cleaned.
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(OptimizerError::Cleanup(format!(
                "cache cleanup returned {}",
                status.as_u16()
            )))
        }
    }
}

/// Deterministic scoring surface used by the demo.
///
/// `totalReturn` peaks when every numeric parameter named in `optimum` sits at
/// its optimum value and falls off quadratically in relative distance.
pub struct SyntheticEvaluator {
    optimum: Params,
    peak_return: f64,
}

impl SyntheticEvaluator {
    pub fn new(optimum: Params) -> Self {
        Self {
            optimum,
            peak_return: 0.35,
        }
    }

    fn distance(&self, params: &Params) -> f64 {
        self.optimum
            .iter()
            .filter_map(|(k, target)| {
                let target = target.as_f64()?;
                let value = get_f64(params, k)?;
                let scale = if target.abs() > f64::EPSILON { target.abs() } else { 1.0 };
                Some(((value - target) / scale).powi(2))
            })
            .sum()
    }
}

#[async_trait]
impl Evaluator for SyntheticEvaluator {
    async fn evaluate(&self, request: &EvaluationRequest) -> Result<EvaluationResult> {
        let d = self.distance(&request.merged_params);
        let total_return = self.peak_return - 0.5 * d;
        let capital = request.initial_capital;
        let trades = (0..4)
            .map(|i| {
                let profit = if i % 2 == 1 { capital * total_return / 2.0 } else { 0.0 };
                TradeEvent {
                    time: format!("2024-01-{:02} 00:00", i * 7 + 1),
                    kind: if i % 2 == 0 { "open_long" } else { "close_long" }.to_string(),
                    price: 100.0 + i as f64,
                    amount: 1.0,
                    profit,
                    balance: capital + profit * f64::from(i / 2 + 1),
                }
            })
            .collect();

        let metrics = Metrics::from([
            ("totalReturn".to_string(), total_return),
            ("annualReturn".to_string(), total_return * 1.2),
            ("maxDrawdown".to_string(), -(0.05 + d.min(1.0) * 0.3)),
            ("winRate".to_string(), (0.5 - d * 0.2).clamp(0.0, 1.0)),
            ("sharpeRatio".to_string(), total_return * 5.0),
            ("totalTrades".to_string(), 2.0),
        ]);
        Ok(EvaluationResult {
            metrics,
            trade_events: trades,
            market_context: Some(json!({"trend": "Sideways", "volatility_std": 1.8})),
        })
    }
}
