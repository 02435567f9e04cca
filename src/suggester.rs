//! Suggestion sources.
//!
//! [`LlmSuggester`] and [`LlmCodeAnalyzer`] ask a language model for JSON
//! answers. [`HeuristicSuggester`] needs no model: it walks numeric
//! parameters one at a time, used when no API key is configured.

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::anthropic::{MessageSender, MessagesRequest};
use crate::collab::{CodeAnalyzer, StrategyAnalysis, Suggester, Suggestion, SuggestionRequest};
use crate::error::{OptimizerError, Result};
use crate::state_machine::Params;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

/// Extracts the first JSON object from a model reply, tolerating code fences
/// and prose around it.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    let trimmed = text.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Ok(v);
    }
    let start = trimmed.find('{');
    let end = trimmed.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if s < e => serde_json::from_str(&trimmed[s..=e])
            .map_err(|e| OptimizerError::Suggestion(format!("invalid JSON in model reply: {e}"))),
        _ => Err(OptimizerError::Suggestion(
            "model reply contains no JSON object".into(),
        )),
    }
}

fn language_instruction(language: &str) -> &'static str {
    if language.to_ascii_lowercase().starts_with("zh") {
        "Write the reasoning in Simplified Chinese."
    } else {
        "Write the reasoning in English."
    }
}

/// Asks a language model for the next parameter set.
pub struct LlmSuggester<C> {
    client: C,
    default_model: String,
}

impl<C: MessageSender> LlmSuggester<C> {
    pub fn new(client: C, default_model: impl Into<String>) -> Self {
        Self {
            client,
            default_model: default_model.into(),
        }
    }

    fn prompt(request: &SuggestionRequest) -> Result<String> {
        let history = serde_json::to_string_pretty(&request.history)?;
        let best = serde_json::to_string_pretty(&request.best_result)?;
        let market = request
            .market_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?
            .unwrap_or_else(|| "unknown".into());

        Ok(format!(
            "You are tuning the parameters of a trading strategy backtest.\n\
             Goal: maximize `{target}`. Percentage metrics are already in percent units.\n\
             \n\
             Strategy analysis:\n{strategy}\n\
             \n\
             Market context: {market}\n\
             \n\
             Most recent trades of the last run:\n{trades}\n\
             \n\
             History of runs (iteration 0 is the baseline):\n{history}\n\
             \n\
             Current best:\n{best}\n\
             \n\
             Tunable keys (do not invent others): {keys}\n\
             \n\
             Propose ONE new parameter set that differs from every previous attempt.\n\
             {lang}\n\
             Respond with ONLY valid JSON, no other text.\n\
             Format: {{\"reasoning\": \"<why>\", \"suggested_params\": {{\"<key>\": <value>}}}}",
            target = request.target_metric,
            strategy = request.strategy_summary,
            trades = request.recent_trades_summary,
            keys = request.allowed_keys.join(", "),
            lang = language_instruction(&request.language),
        ))
    }
}

#[async_trait]
impl<C: MessageSender> Suggester for LlmSuggester<C> {
    async fn suggest(&self, request: &SuggestionRequest) -> Result<Suggestion> {
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        let mut req = MessagesRequest::single_turn(model, 2048, Self::prompt(request)?);
        req.temperature = Some(0.7);

        let response = self.client.send_message(&req).await?;
        extract_json(&response.text())
    }
}

#[derive(Debug, Deserialize)]
struct LlmAnalysis {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    params: Params,
    #[serde(default)]
    rewritten_code: Option<String>,
}

/// One-time strategy analysis through a language model.
pub struct LlmCodeAnalyzer<C> {
    client: C,
    default_model: String,
}

impl<C: MessageSender> LlmCodeAnalyzer<C> {
    pub fn new(client: C, default_model: impl Into<String>) -> Self {
        Self {
            client,
            default_model: default_model.into(),
        }
    }
}

#[async_trait]
impl<C: MessageSender> CodeAnalyzer for LlmCodeAnalyzer<C> {
    async fn analyze(&self, code: &str, model: Option<&str>) -> Result<StrategyAnalysis> {
        let model = model.unwrap_or(self.default_model.as_str());
        let req = MessagesRequest::single_turn(
            model,
            4096,
            format!(
                "Analyze this trading strategy code. Respond with ONLY valid JSON, no other text.\n\
                 Format: {{\"summary\": \"<2-3 sentences: signals, entries, exits>\", \
                 \"params\": {{\"<name>\": <current numeric value>}}, \
                 \"rewritten_code\": \"<the code reading each tunable from params[name]>\"}}\n\
                 List only constants that are meaningful to tune (periods, thresholds, multipliers).\n\
                 \n\
                 Code:\n{code}"
            ),
        );

        let response = self
            .client
            .send_message(&req)
            .await
            .map_err(|e| OptimizerError::Analysis(e.to_string()))?;
        let parsed: LlmAnalysis = extract_json(&response.text())
            .map_err(|e| OptimizerError::Analysis(e.to_string()))?;

        Ok(StrategyAnalysis {
            summary: parsed.summary,
            params: parsed.params,
            rewritten_code: parsed.rewritten_code.filter(|c| !c.trim().is_empty()),
        })
    }
}

/// Keys that describe the backtest setup rather than the strategy.
const FIXED_KEYS: &[&str] = &[
    "commission",
    "slippage",
    "leverage",
    "initialCapital",
    "startDate",
    "endDate",
];

/// Coordinate search over numeric parameters, no model involved.
///
/// Round `r` nudges key `r mod n` of the current best by `step`, upward on
/// even passes and downward on odd ones.
pub struct HeuristicSuggester {
    step: f64,
}

impl Default for HeuristicSuggester {
    fn default() -> Self {
        Self { step: 0.1 }
    }
}

impl HeuristicSuggester {
    pub fn with_step(step: f64) -> Self {
        Self { step }
    }

    fn nudge(value: &Value, factor: f64, upward: bool) -> Option<Value> {
        if let Some(i) = value.as_i64() {
            let delta = ((i as f64 * (factor - 1.0)).abs().round() as i64).max(1);
            let next = if upward { i + delta } else { (i - delta).max(1) };
            return Some(Value::from(next));
        }
        let f = value.as_f64()?;
        let next = (f * factor * 1e6).round() / 1e6;
        Some(Value::from(next))
    }
}

#[async_trait]
impl Suggester for HeuristicSuggester {
    async fn suggest(&self, request: &SuggestionRequest) -> Result<Suggestion> {
        let Some(best) = &request.best_result else {
            return Ok(Suggestion::default());
        };
        let tunables: Vec<(&String, &Value)> = best
            .params
            .iter()
            .filter(|(k, v)| {
                v.is_number()
                    && !FIXED_KEYS.contains(&k.as_str())
                    && request.allowed_keys.iter().any(|a| a == *k)
            })
            .collect();
        if tunables.is_empty() {
            return Ok(Suggestion::default());
        }

        let round = request.iteration.saturating_sub(1) as usize;
        let (key, value) = tunables[round % tunables.len()];
        let upward = (round / tunables.len()) % 2 == 0;
        let factor = if upward { 1.0 + self.step } else { 1.0 - self.step };
        let Some(next) = Self::nudge(value, factor, upward) else {
            return Ok(Suggestion::default());
        };

        let direction = if upward { "up" } else { "down" };
        Ok(Suggestion {
            reasoning: format!("Probing {key} {direction} from {value} to {next}"),
            suggested_params: Params::from([(key.clone(), next)]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anthropic::types::{ContentBlock, MessagesResponse, Usage};
    use crate::anthropic::AnthropicError;
    use crate::state_machine::{BestResult, IterationRecord, Metrics};
    use serde_json::json;
    use std::sync::Mutex;

    struct MockClient {
        result: std::result::Result<String, ()>,
        seen: Mutex<Vec<MessagesRequest>>,
    }

    impl MockClient {
        fn ok(text: &str) -> Self {
            Self {
                result: Ok(text.to_string()),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn err() -> Self {
            Self {
                result: Err(()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl MessageSender for MockClient {
        async fn send_message(
            &self,
            req: &MessagesRequest,
        ) -> std::result::Result<MessagesResponse, AnthropicError> {
            self.seen.lock().unwrap().push(req.clone());
            match &self.result {
                Ok(text) => Ok(MessagesResponse {
                    id: "mock".into(),
                    content: vec![ContentBlock {
                        content_type: "text".into(),
                        text: text.clone(),
                    }],
                    model: "mock".into(),
                    stop_reason: Some("end_turn".into()),
                    usage: Usage {
                        input_tokens: 0,
                        output_tokens: 0,
                    },
                }),
                Err(()) => Err(AnthropicError::ApiError {
                    status: 500,
                    message: "mock error".into(),
                }),
            }
        }
    }

    fn params(v: Value) -> Params {
        serde_json::from_value(v).unwrap()
    }

    fn request(best: Params, history_len: usize) -> SuggestionRequest {
        let history = (0..history_len as u32)
            .map(|i| IterationRecord {
                iteration: i,
                params: Params::new(),
                metrics: Metrics::new(),
                reasoning: String::new(),
            })
            .collect();
        SuggestionRequest {
            iteration: history_len as u32,
            target_metric: "totalReturn".into(),
            history,
            allowed_keys: best.keys().cloned().collect(),
            best_result: Some(BestResult {
                params: best,
                metrics: Metrics::from([("totalReturn".to_string(), 10.0)]),
            }),
            market_context: Some(json!({"trend": "Bullish"})),
            recent_trades_summary: "No trades executed.".into(),
            strategy_summary: "RSI mean reversion".into(),
            language: "en-US".into(),
            model: None,
        }
    }

    #[test]
    fn extract_json_handles_fences_and_prose() {
        let s: Suggestion = extract_json(
            "Sure!\n```json\n{\"reasoning\": \"tighten stop\", \"suggested_params\": {\"stopLossPct\": 0.03}}\n```",
        )
        .unwrap();
        assert_eq!(s.reasoning, "tighten stop");
        assert_eq!(s.suggested_params["stopLossPct"], json!(0.03));
    }

    #[test]
    fn extract_json_rejects_plain_text() {
        let err = extract_json::<Suggestion>("I cannot help with that").unwrap_err();
        assert!(matches!(err, OptimizerError::Suggestion(_)));
    }

    #[tokio::test]
    async fn llm_suggester_uses_default_model_and_parses_reply() {
        let client = MockClient::ok(
            r#"{"reasoning": "widen take profit", "suggested_params": {"takeProfitPct": 0.2}}"#,
        );
        let suggester = LlmSuggester::new(client, DEFAULT_MODEL);
        let req = request(params(json!({"takeProfitPct": 0.1})), 1);
        let s = suggester.suggest(&req).await.unwrap();
        assert_eq!(s.suggested_params["takeProfitPct"], json!(0.2));

        let seen = suggester.client.seen.lock().unwrap();
        assert_eq!(seen[0].model, DEFAULT_MODEL);
        let prompt = &seen[0].messages[0].content;
        assert!(prompt.contains("maximize `totalReturn`"));
        assert!(prompt.contains("RSI mean reversion"));
        assert!(prompt.contains("Tunable keys (do not invent others): takeProfitPct"));
        assert!(prompt.contains("in English"));
    }

    #[tokio::test]
    async fn llm_suggester_honours_model_hint() {
        let client = MockClient::ok(r#"{"reasoning": "", "suggested_params": {}}"#);
        let suggester = LlmSuggester::new(client, DEFAULT_MODEL);
        let mut req = request(Params::new(), 1);
        req.model = Some("claude-opus-4-6".into());
        let s = suggester.suggest(&req).await.unwrap();
        assert!(s.suggested_params.is_empty());
        assert_eq!(suggester.client.seen.lock().unwrap()[0].model, "claude-opus-4-6");
    }

    #[tokio::test]
    async fn llm_suggester_propagates_api_errors() {
        let suggester = LlmSuggester::new(MockClient::err(), DEFAULT_MODEL);
        let err = suggester.suggest(&request(Params::new(), 1)).await.unwrap_err();
        assert!(matches!(err, OptimizerError::Anthropic(_)));
    }

    #[tokio::test]
    async fn code_analyzer_reads_params_and_rewrite() {
        let client = MockClient::ok(
            r#"{"summary": "RSI crossover", "params": {"rsi_len": 14, "upper": 70},
                "rewritten_code": "rsi = ta.rsi(close, params['rsi_len'])"}"#,
        );
        let analyzer = LlmCodeAnalyzer::new(client, DEFAULT_MODEL);
        let analysis = analyzer.analyze("rsi = ta.rsi(close, 14)", None).await.unwrap();
        assert_eq!(analysis.summary, "RSI crossover");
        assert_eq!(analysis.params.len(), 2);
        assert!(analysis.rewritten_code.unwrap().contains("params['rsi_len']"));
    }

    #[tokio::test]
    async fn code_analyzer_maps_failures() {
        let analyzer = LlmCodeAnalyzer::new(MockClient::err(), DEFAULT_MODEL);
        let err = analyzer.analyze("x = 1", Some("claude-haiku-4-5-20251001")).await.unwrap_err();
        assert!(matches!(err, OptimizerError::Analysis(_)));
    }

    #[tokio::test]
    async fn heuristic_cycles_keys_and_directions() {
        let suggester = HeuristicSuggester::default();
        let best = params(json!({"commission": 0.0002, "rsi_len": 14, "stopLossPct": 0.05, "symbol": "BTC"}));

        // After the baseline only: first tunable key, upward.
        let s = suggester.suggest(&request(best.clone(), 1)).await.unwrap();
        assert_eq!(s.suggested_params, params(json!({"rsi_len": 15})));

        let s = suggester.suggest(&request(best.clone(), 2)).await.unwrap();
        assert_eq!(s.suggested_params, params(json!({"stopLossPct": 0.055})));

        // Second pass goes downward.
        let s = suggester.suggest(&request(best.clone(), 3)).await.unwrap();
        assert_eq!(s.suggested_params, params(json!({"rsi_len": 13})));
        assert!(s.reasoning.contains("rsi_len down"));
    }

    #[tokio::test]
    async fn heuristic_without_tunables_is_empty() {
        let suggester = HeuristicSuggester::with_step(0.2);
        let s = suggester
            .suggest(&request(params(json!({"symbol": "BTC", "leverage": 2})), 1))
            .await
            .unwrap();
        assert!(s.suggested_params.is_empty());

        let mut no_best = request(Params::new(), 1);
        no_best.best_result = None;
        assert!(suggester.suggest(&no_best).await.unwrap().suggested_params.is_empty());
    }
}
