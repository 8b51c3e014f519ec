//! Interface de linha de comando do bootstrapper baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (run, status, phases,
//! migrate-state, handoff) e flags globais (--config, --verbose, --json).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::DEFAULT_CONFIG_PATH;

/// Bootstrap de plataforma em fases, com retomada por fase.
#[derive(Debug, Parser)]
#[command(name = "bootstrap", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho do arquivo de configuração.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Habilita logs detalhados (debug). `RUST_LOG` tem precedência.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Imprime o resultado em JSON no stdout.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa o pipeline a partir de uma fase.
    Run {
        /// Fase inicial; as anteriores são consideradas concluídas.
        #[arg(long, default_value_t = 1)]
        start_phase: u32,

        /// Para com sucesso após esta subfase (`[FASE:]SUBFASE`).
        #[arg(long)]
        stop_after: Option<String>,

        /// Pula subfases de validação. Pré-condições sempre rodam.
        #[arg(long, default_value_t = false)]
        skip_validation: bool,
    },

    /// Avalia pré-condições e checagens de conclusão de cada fase, sem executar nada.
    Status,

    /// Lista o catálogo de fases e subfases.
    Phases,

    /// Executa somente a migração do estado para o backend remoto.
    MigrateState,

    /// Executa somente o handoff de credenciais do reconciliador.
    Handoff,
}
