//! Interface de terminal do backtune: spinner e saída colorida.
//!
//! O [`JobProgress`] acompanha visualmente um job consultando seus snapshots.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{JobSnapshot, JobStatus};

pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    // Quantas linhas de log já foram impressas.
    printed_logs: usize,
}

impl JobProgress {
    pub fn start(target_metric: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!("Optimizing {target_metric}..."));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            printed_logs: 0,
        }
    }

    /// Atualiza o spinner e imprime as linhas de log novas.
    ///
    /// Quando o buffer de logs já descartou linhas antigas, imprime só o que restou.
    pub fn update(&mut self, snap: &JobSnapshot, verbose: bool) {
        let best = snap
            .best_result
            .as_ref()
            .and_then(|b| b.metrics.get(&snap.target_metric))
            .map_or_else(|| "n/a".to_string(), |v| format!("{v}"));
        self.pb.set_message(format!(
            "{} {}/{} | best {}: {best}",
            snap.status, snap.current_iteration, snap.max_iterations, snap.target_metric
        ));

        if verbose {
            let start = self.printed_logs.min(snap.logs.len());
            for line in &snap.logs[start..] {
                self.pb.println(format!("  {line}"));
            }
        }
        self.printed_logs = snap.logs.len();
    }

    /// Finaliza o spinner e exibe o resultado final do job.
    pub fn complete(&self, snap: &JobSnapshot) {
        self.pb.finish_and_clear();
        match snap.status {
            JobStatus::Completed => {
                println!("  {} Optimization completed", self.green.apply_to("✓"));
            }
            JobStatus::Cancelled => {
                println!("  {} Optimization cancelled", self.yellow.apply_to("■"));
            }
            _ => {
                let error = snap.error.as_deref().unwrap_or("unknown error");
                println!("  {} Optimization failed: {error}", self.red.apply_to("✗"));
            }
        }
    }

    /// Imprime o melhor resultado formatado em JSON.
    pub fn print_summary(&self, snap: &JobSnapshot) {
        let style = match snap.status {
            JobStatus::Completed => &self.green,
            JobStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", style.apply_to("─── Best Result ───"));
        println!(
            "{}",
            serde_json::to_string_pretty(&snap.best_result).unwrap_or_default()
        );
        println!(
            "{}",
            style.apply_to(format!(
                "{} of {} iterations recorded",
                snap.history.len().saturating_sub(1),
                snap.max_iterations
            ))
        );
    }
}
