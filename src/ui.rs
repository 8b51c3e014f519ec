//! Interface de terminal do bootstrapper: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`PhaseProgress`] acompanha visualmente a
//! execução das fases. Toda saída humana vai para stderr; stdout fica
//! reservado ao registro JSON da execução.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::{BootstrapError, OrchestrationError};
use crate::phase::{Phase, PhaseStatus, RunObserver, RunOutcome, RunRecord, Subphase};

/// Indicador visual de progresso para uma execução do pipeline.
///
/// Exibe um spinner animado durante cada subfase e mensagens coloridas
/// para sucesso (verde), falha (vermelho) e fases puladas (amarelo).
pub struct PhaseProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl PhaseProgress {
    /// Inicia o spinner e retorna a instância de progresso.
    pub fn start() -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message("NOT_STARTED");
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Finaliza o spinner e exibe o resultado final da execução.
    pub fn finish(&self, result: &Result<RunOutcome, OrchestrationError>) {
        self.pb.finish_and_clear();
        match result {
            Ok(RunOutcome::Completed) => {
                eprintln!("  {} Bootstrap completed", self.green.apply_to("✓"));
            }
            Ok(RunOutcome::StoppedAt { phase, subphase }) => {
                eprintln!(
                    "  {} Stopped after {phase}:{subphase} as requested",
                    self.green.apply_to("■")
                );
            }
            Err(e) if e.is_interrupt() => {
                eprintln!(
                    "  {} Interrupted; acquired resources were released",
                    self.yellow.apply_to("⚠")
                );
                eprintln!("    {}", self.dim.apply_to(e.hint()));
            }
            Err(e) => {
                eprintln!("  {} {e}", self.red.apply_to("✗"));
                eprintln!("    {}", self.dim.apply_to(e.hint()));
            }
        }
    }
}

impl RunObserver for PhaseProgress {
    fn phase_started(&self, phase: &Phase) {
        self.pb.println(format!(
            "{} Phase {} {}",
            self.green.apply_to("▶"),
            phase.id,
            phase.description
        ));
    }

    fn phase_skipped(&self, phase: &Phase, reason: &str) {
        self.pb.println(format!(
            "{} Phase {} {} skipped: {reason}",
            self.yellow.apply_to("↷"),
            phase.id,
            phase.description
        ));
    }

    fn subphase_started(&self, phase: &Phase, subphase: &Subphase) {
        self.pb.set_message(format!(
            "RUNNING({}, {}) {}",
            phase.id, subphase.id, subphase.description
        ));
    }

    fn subphase_finished(&self, _phase: &Phase, subphase: &Subphase) {
        self.pb
            .println(format!("  {} {}", self.green.apply_to("✓"), subphase.id));
    }

    fn subphase_skipped(&self, _phase: &Phase, subphase: &Subphase) {
        self.pb.println(format!(
            "  {} {} (validation skipped)",
            self.yellow.apply_to("↷"),
            subphase.id
        ));
    }

    fn phase_failed(&self, phase: &Phase, subphase: Option<&str>, error: &BootstrapError) {
        let at = subphase.map(|s| format!(" at {s}")).unwrap_or_default();
        self.pb.println(format!(
            "  {} Phase {}{at} failed [{}]",
            self.red.apply_to("✗"),
            phase.id,
            error.class().surfaced()
        ));
    }
}

/// Imprime o registro da execução formatado em JSON no stdout.
pub fn print_record(record: &RunRecord) {
    println!(
        "{}",
        serde_json::to_string_pretty(record).unwrap_or_default()
    );
}

/// Lista o catálogo estático de fases.
pub fn print_catalog(phases: &[Phase]) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    for phase in phases {
        let marker = if phase.idempotent { "" } else { " (runs once)" };
        println!(
            "{} {}{marker}",
            bold.apply_to(format!("{:>2}. {}", phase.id, phase.name)),
            dim.apply_to(&phase.description)
        );
        for check in &phase.preconditions {
            println!("      requires: {}", check.name());
        }
        for sub in &phase.subphases {
            let tag = if sub.validation { " [validation]" } else { "" };
            println!("      - {}{tag}  {}", sub.id, dim.apply_to(&sub.description));
        }
    }
}

/// Mostra o estado ao vivo de cada fase.
pub fn print_status(statuses: &[PhaseStatus]) {
    let green = Style::new().green();
    let red = Style::new().red();
    let yellow = Style::new().yellow();
    for status in statuses {
        let done = match status.complete {
            Some(true) => green.apply_to("done").to_string(),
            Some(false) => yellow.apply_to("pending").to_string(),
            None => "-".to_string(),
        };
        let ready = match &status.blocked_by {
            None => green.apply_to("ready").to_string(),
            Some(reason) => red.apply_to(format!("blocked: {reason}")).to_string(),
        };
        println!("{:>2}. {:<16} {done:<8} {ready}", status.id, status.name);
    }
}
