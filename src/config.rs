//! Configuração do backtune carregada a partir de `backtune.toml`.
//!
//! A struct [`AppConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `ANTHROPIC_API_KEY` e `BACKTUNE_EVALUATOR_URL`
//! têm precedência sobre o arquivo.

use std::path::Path;

use anyhow::Result;
use serde::Deserialize;

use crate::state_machine::{DEFAULT_LANGUAGE, DEFAULT_MAX_ITERATIONS, DEFAULT_TARGET_METRIC, JobDefaults};
use crate::suggester::DEFAULT_MODEL;

const CONFIG_FILE: &str = "backtune.toml";

/// Configuração de nível superior carregada de `backtune.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Chave da API Anthropic. Vazia desativa o sugestor LLM.
    #[serde(default)]
    pub api_key: String,

    /// Modelo usado quando o job não especifica um.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// URL base do serviço de backtest.
    #[serde(default = "default_evaluator_url")]
    pub evaluator_url: String,

    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,

    #[serde(default = "default_target_metric")]
    pub default_target_metric: String,

    /// Idioma pedido ao modelo para o raciocínio.
    #[serde(default = "default_language")]
    pub language: String,

    /// Intervalo de atualização do progresso na CLI.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_evaluator_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_max_iterations() -> u32 {
    DEFAULT_MAX_ITERATIONS
}

fn default_target_metric() -> String {
    DEFAULT_TARGET_METRIC.to_string()
}

fn default_language() -> String {
    DEFAULT_LANGUAGE.to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            default_model: default_model(),
            evaluator_url: default_evaluator_url(),
            default_max_iterations: default_max_iterations(),
            default_target_metric: default_target_metric(),
            language: default_language(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl AppConfig {
    /// Carrega `backtune.toml` do diretório atual.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de `path`, usando defaults se o arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<AppConfig>(&contents)?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.api_key = key;
        }
        if let Ok(url) = std::env::var("BACKTUNE_EVALUATOR_URL")
            && !url.is_empty()
        {
            config.evaluator_url = url;
        }

        Ok(config)
    }

    /// Defaults aplicados a campos ausentes na especificação do job.
    pub fn job_defaults(&self) -> JobDefaults {
        JobDefaults {
            max_iterations: self.default_max_iterations,
            target_metric: self.default_target_metric.clone(),
            language: self.language.clone(),
            model: None,
        }
    }
}
