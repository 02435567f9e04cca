//! Interface de linha de comando do backtune baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, demo)
//! e flags globais (--model, --max-iterations, --target-metric, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// backtune: otimizador iterativo de parâmetros de backtest guiado por LLM.
#[derive(Debug, Parser)]
#[command(name = "backtune", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Modelo a usar para sugestões (sobrescreve o do arquivo de job).
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Número máximo de rodadas de otimização.
    #[arg(long, global = true)]
    pub max_iterations: Option<u32>,

    /// Métrica a maximizar (ex.: totalReturn, sharpeRatio, winRate).
    #[arg(long, global = true)]
    pub target_metric: Option<String>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Otimiza a estratégia descrita em um arquivo JSON ou TOML.
    Run {
        /// Caminho para a especificação do job.
        spec: PathBuf,
    },

    /// Executa uma otimização de demonstração contra um avaliador sintético.
    Demo,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_run_subcommand() {
        let cli = Cli::parse_from(["backtune", "run", "jobs/btc.json"]);
        match cli.command {
            Command::Run { spec } => assert_eq!(spec, PathBuf::from("jobs/btc.json")),
            _ => panic!("expected Run command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "backtune",
            "--model",
            "claude-opus-4-6",
            "--max-iterations",
            "5",
            "--target-metric",
            "sharpeRatio",
            "--verbose",
            "demo",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.model.as_deref(), Some("claude-opus-4-6"));
        assert_eq!(cli.max_iterations, Some(5));
        assert_eq!(cli.target_metric.as_deref(), Some("sharpeRatio"));
        assert!(matches!(cli.command, Command::Demo));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
