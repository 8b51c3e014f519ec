mod cli;
mod config;
mod credentials;
mod error;
mod git;
mod guard;
mod handoff;
mod interrupt;
mod migrate;
mod phase;
mod pipeline;
mod platform;
mod retry;
mod ui;
mod vault;
mod wait;

#[cfg(test)]
mod testing;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use config::BootstrapConfig;
use credentials::{CredentialLifecycleManager, ProcessEnv};
use error::{BootstrapError, EXIT_OK, OrchestrationError};
use git::{GitRemoteProbe, RepoAccessProbe};
use guard::ResourceGuard;
use interrupt::Interrupt;
use phase::{PhaseContext, PhaseOrchestrator, RunOutcome, StopAfter};
use platform::{
    FluxSource, HttpProbe, Kubectl, KubectlCommand, Platform, ProcessRunner, SourceRef, TerraformCli,
};
use ui::PhaseProgress;
use vault::VaultClient;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match BootstrapConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            eprintln!("error: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    if let Command::Phases = cli.command {
        ui::print_catalog(&pipeline::bootstrap_phases(&config, Arc::new(ProcessEnv)));
        return ExitCode::from(EXIT_OK);
    }

    let guard = ResourceGuard::new();
    let interrupt = Interrupt::new();
    interrupt.listen(guard.clone());

    let code = match build_orchestrator(&config, guard.clone(), interrupt.clone()) {
        Ok(orchestrator) => dispatch(&cli, orchestrator).await,
        Err(e) => {
            error!(error = %e, "cannot reach the platform");
            eprintln!("error: {e}");
            e.exit_code()
        }
    };

    // Single cleanup point for every exit path.
    let report = guard.run_all();
    if !report.is_clean() {
        warn!(failed = ?report.failed, "some resources could not be released");
    }
    ExitCode::from(code)
}

/// `RUST_LOG` wins; otherwise `--verbose` selects debug, else info.
fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .init();
}

fn build_platform(config: &BootstrapConfig) -> Result<Platform, BootstrapError> {
    let cluster = &config.cluster;
    let kubectl = KubectlCommand::new(
        Arc::new(ProcessRunner::new(Duration::from_secs(cluster.command_timeout_secs))),
        cluster.kubectl.clone(),
        cluster.context.clone(),
    )
    .with_request_timeout(Duration::from_secs(cluster.request_timeout_secs));
    let gitops = &config.gitops;
    let source = SourceRef {
        namespace: gitops.namespace.clone(),
        name: gitops.source_name.clone(),
        controller: gitops.controller.clone(),
    };
    let store = VaultClient::from_env(
        &config.secret_manager.address,
        &config.secret_manager.mount,
        &config.secret_manager.token_env,
    )?;
    let repo_probe = gitops.repo_url.as_ref().map(|url| {
        Arc::new(GitRemoteProbe::new(url.clone(), gitops.repo_username.clone()))
            as Arc<dyn RepoAccessProbe>
    });

    Ok(Platform {
        cluster: Arc::new(Kubectl::new(kubectl.clone())),
        iac: Arc::new(TerraformCli::new(
            Arc::new(ProcessRunner::new(Duration::from_secs(config.iac.command_timeout_secs))),
            config.iac.binary.clone(),
            config.iac.working_dir.clone(),
        )),
        store: Arc::new(store),
        reconciler: Arc::new(FluxSource::new(kubectl, source)),
        reachability: Arc::new(HttpProbe::new(PROBE_TIMEOUT)?),
        repo_probe,
    })
}

fn build_orchestrator(
    config: &BootstrapConfig,
    guard: ResourceGuard,
    interrupt: Interrupt,
) -> Result<PhaseOrchestrator, BootstrapError> {
    let platform = build_platform(config)?;
    let credentials = CredentialLifecycleManager::new(
        Arc::new(ProcessEnv),
        config.credentials.clone(),
        config.retry,
    )
    .with_interrupt(interrupt.clone());
    let ctx = PhaseContext {
        platform,
        credentials,
        guard,
        interrupt,
        retry: config.retry,
    };
    PhaseOrchestrator::new(pipeline::bootstrap_phases(config, Arc::new(ProcessEnv)), ctx)
}

async fn dispatch(cli: &Cli, orchestrator: PhaseOrchestrator) -> u8 {
    match &cli.command {
        Command::Run {
            start_phase,
            stop_after,
            skip_validation,
        } => {
            let stop_after = match stop_after.as_deref().map(StopAfter::parse).transpose() {
                Ok(stop) => stop,
                Err(e) => {
                    eprintln!("error: {e}");
                    return e.exit_code();
                }
            };
            let orchestrator = orchestrator.with_skip_validation(*skip_validation);
            execute(cli.json, orchestrator, *start_phase, stop_after).await
        }
        Command::MigrateState => {
            let stop = StopAfter::parse("4:migrate-state");
            execute(cli.json, orchestrator, 4, stop.ok()).await
        }
        Command::Handoff => {
            let stop = StopAfter::parse("6:handoff");
            execute(cli.json, orchestrator, 6, stop.ok()).await
        }
        Command::Status => {
            let statuses = orchestrator.status().await;
            if cli.json {
                match serde_json::to_string_pretty(&statuses) {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        let e = BootstrapError::from(e);
                        eprintln!("error: {e}");
                        return e.exit_code();
                    }
                }
            } else {
                ui::print_status(&statuses);
            }
            EXIT_OK
        }
        // Handled before the platform is built.
        Command::Phases => EXIT_OK,
    }
}

async fn execute(
    json: bool,
    orchestrator: PhaseOrchestrator,
    start_phase: u32,
    stop_after: Option<StopAfter>,
) -> u8 {
    let progress = Arc::new(PhaseProgress::start());
    let orchestrator = orchestrator.with_observer(progress.clone());
    let result = orchestrator.run(start_phase, stop_after.as_ref()).await;
    progress.finish(&result);

    if json && let Some(record) = orchestrator.record() {
        ui::print_record(&record);
    }
    exit_code(&result)
}

fn exit_code(result: &Result<RunOutcome, OrchestrationError>) -> u8 {
    match result {
        Ok(outcome) => {
            info!(?outcome, "run finished");
            EXIT_OK
        }
        Err(e) => {
            error!(class = ?e.class(), recovery = ?e.recovery(), "{e}");
            e.exit_code()
        }
    }
}
