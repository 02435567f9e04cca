//! Metric normalisation and narration helpers used by the runner.

use serde_json::Value;

use crate::collab::TradeEvent;
use crate::state_machine::Metrics;

/// Metrics reported as fractions that are recorded as percentages.
pub const PERCENTAGE_FIELDS: &[&str] = &["totalReturn", "annualReturn", "maxDrawdown", "winRate"];

/// How many trailing trades are summarised for the suggester.
pub const RECENT_TRADES: usize = 30;

/// Converts fractional metrics (0.5) to percentages (50), rounded to 2 decimals.
pub fn to_percentage(metrics: &Metrics) -> Metrics {
    let mut converted = metrics.clone();
    for field in PERCENTAGE_FIELDS {
        if let Some(v) = converted.get_mut(*field) {
            *v = (*v * 100.0 * 100.0).round() / 100.0;
        }
    }
    converted
}

/// Value of `metric`, with absent or NaN treated as the lowest possible value.
pub fn metric_value(metrics: &Metrics, metric: &str) -> f64 {
    match metrics.get(metric) {
        Some(v) if !v.is_nan() => *v,
        _ => f64::NEG_INFINITY,
    }
}

/// Whether `candidate` strictly beats `best` on `metric`.
pub fn beats(candidate: &Metrics, best: Option<&Metrics>, metric: &str) -> bool {
    let best = best.map_or(f64::NEG_INFINITY, |m| metric_value(m, metric));
    metric_value(candidate, metric) > best
}

/// Human-readable metric value, `n/a` when missing.
pub fn display_value(metrics: Option<&Metrics>, metric: &str) -> String {
    match metrics.and_then(|m| m.get(metric)) {
        Some(v) => format!("{v}"),
        None => "n/a".to_string(),
    }
}

fn action_label(kind: &str) -> &str {
    if kind.contains("close_long") {
        "Close Long"
    } else if kind.contains("close_short") {
        "Close Short"
    } else if kind.contains("open_long") {
        "Open Long"
    } else if kind.contains("open_short") {
        "Open Short"
    } else if kind.contains("liquidation") {
        "LIQUIDATION"
    } else {
        kind
    }
}

/// Summary of the last [`RECENT_TRADES`] trades, one line per trade.
pub fn summarize_trades(trades: &[TradeEvent]) -> String {
    if trades.is_empty() {
        return "No trades executed.".to_string();
    }
    let start = trades.len().saturating_sub(RECENT_TRADES);
    trades[start..]
        .iter()
        .map(|t| {
            format!(
                "{} {}: Price={}, Amt={}, Profit={}",
                t.time,
                action_label(&t.kind),
                t.price,
                t.amount,
                t.profit
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_trade(index: usize, t: &TradeEvent) -> String {
    format!(
        "Trade #{}: {} @ {} | Price: {} | Amt: {} | Profit: {} | Bal: {}",
        index + 1,
        t.kind,
        t.time,
        t.price,
        t.amount,
        t.profit,
        t.balance
    )
}

/// One-line synopsis of the evaluator's market context, if it carries a trend.
pub fn market_synopsis(context: &Value) -> Option<String> {
    let obj = context.as_object().filter(|o| !o.is_empty())?;
    let trend = obj.get("trend").and_then(Value::as_str).unwrap_or("Unknown");
    let vol = obj
        .get("volatility_std")
        .and_then(Value::as_f64)
        .unwrap_or(0.0);
    Some(format!("Market Analysis: {trend} Trend, Volatility: {vol:.2}%"))
}
