use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;

use ralph_loop::config::{ConfigOverrides, ControlAction, LoopConfig};
use ralph_loop::orchestrator::Orchestrator;
use ralph_loop::session::ValidatorSpec;

#[derive(Debug, Parser)]
#[command(name = "ralph-loop")]
#[command(about = "Autonomous task-completion driver for AI CLI tools")]
struct Cli {
    /// Markdown task file (discovered in the working directory if omitted)
    #[arg(long)]
    tasks: Option<PathBuf>,

    /// State directory for the session sidecar and iteration artifacts
    #[arg(long, default_value = ".ralph-loop")]
    state_dir: PathBuf,

    /// AI provider CLI: claude or codex
    #[arg(long)]
    provider: Option<String>,

    /// Model for implementation runs
    #[arg(long)]
    impl_model: Option<String>,

    /// Model for validation runs
    #[arg(long)]
    val_model: Option<String>,

    #[arg(long)]
    max_iterations: Option<u32>,

    #[arg(long)]
    max_inadmissible: Option<u32>,

    /// Seconds without output growth before a run is cancelled (0 disables)
    #[arg(long, default_value_t = 300)]
    inactivity_timeout: u64,

    /// Hard cap on a single run, in seconds
    #[arg(long, default_value_t = 7200)]
    hard_cap: u64,

    /// Start instant: HH:MM (local) or RFC 3339
    #[arg(long)]
    start_at: Option<String>,

    /// Carry a learnings file between iterations
    #[arg(long)]
    learnings: bool,

    /// Learnings file path (relative paths are under the state directory)
    #[arg(long)]
    learnings_file: Option<PathBuf>,

    /// Cross-validator as provider:model
    #[arg(long)]
    cross_validate: Option<String>,

    /// Final-plan validator as provider:model
    #[arg(long)]
    final_plan_validate: Option<String>,

    /// Design-spec file for tasks validation and the final-plan validator
    #[arg(long)]
    plan: Option<PathBuf>,

    /// GitHub issue reference to fetch and cache as spec context
    #[arg(long)]
    issue: Option<String>,

    /// Resume the persisted session
    #[arg(long)]
    resume: bool,

    /// Resume even if the tasks file changed since the session started
    #[arg(long)]
    resume_force: bool,

    /// Print session status and exit
    #[arg(long)]
    status: bool,

    /// Wipe the state directory and start fresh
    #[arg(long)]
    clean: bool,

    /// Mark the persisted session cancelled and exit
    #[arg(long)]
    cancel: bool,
}

fn parse_validator_spec(spec: &str) -> anyhow::Result<ValidatorSpec> {
    match spec.split_once(':') {
        Some((provider, model)) if !provider.is_empty() => Ok(ValidatorSpec {
            provider: provider.to_string(),
            model: model.to_string(),
        }),
        _ => anyhow::bail!("expected provider:model, got {spec:?}"),
    }
}

fn build_config(cli: &Cli) -> anyhow::Result<LoopConfig> {
    let mut config = LoopConfig {
        tasks_file: cli.tasks.clone(),
        state_dir: cli.state_dir.clone(),
        inactivity_timeout_secs: cli.inactivity_timeout,
        hard_cap_secs: cli.hard_cap,
        start_at: cli.start_at.clone(),
        learnings_enabled: cli.learnings || cli.learnings_file.is_some(),
        learnings_file: cli.learnings_file.clone(),
        plan_file: cli.plan.clone(),
        github_issue: cli.issue.clone(),
        resume: cli.resume || cli.resume_force,
        resume_force: cli.resume_force,
        ..LoopConfig::default()
    };

    config.control = if cli.status {
        ControlAction::Status
    } else if cli.cancel {
        ControlAction::Cancel
    } else if cli.clean {
        ControlAction::Clean
    } else {
        ControlAction::Run
    };

    if let Some(provider) = &cli.provider {
        config.ai_provider = provider.clone();
    }
    if let Some(model) = &cli.impl_model {
        config.impl_model = model.clone();
    }
    if let Some(model) = &cli.val_model {
        config.val_model = model.clone();
    }
    if let Some(max) = cli.max_iterations {
        config.max_iterations = max;
    }
    if let Some(max) = cli.max_inadmissible {
        config.max_inadmissible = max;
    }
    if let Some(spec) = &cli.cross_validate {
        config.cross_validation = Some(parse_validator_spec(spec)?);
    }
    if let Some(spec) = &cli.final_plan_validate {
        config.final_plan_validation = Some(parse_validator_spec(spec)?);
    }

    // Explicit flags also become overrides so they beat restored-session
    // values on resume.
    config.overrides = ConfigOverrides {
        ai_provider: cli.provider.clone(),
        impl_model: cli.impl_model.clone(),
        val_model: cli.val_model.clone(),
        max_iterations: cli.max_iterations,
        max_inadmissible: cli.max_inadmissible,
    };

    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Load .env file if present (silently ignored if missing)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; shutting down");
                cancel.cancel();
            }
            // Second interrupt: the user means it.
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::error!("second interrupt; aborting");
                std::process::exit(130);
            }
        });
    }

    let orchestrator = Orchestrator::new(config, cancel);
    let status = orchestrator.run().await;
    std::process::exit(status.code());
}
