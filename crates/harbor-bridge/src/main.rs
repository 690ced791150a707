//! harbor-bridge CLI: run one agent session against the local shell.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use harbor_bridge::{
    BridgeConfig, CancellationToken, ExampleLookup, LocalShell, LogTraceSink, NoopTraceSink,
    SessionRequest, SessionRunner, TraceSink, load_trial_config,
};

#[derive(Parser, Debug)]
#[command(
    name = "harbor-bridge",
    version,
    about = "Run an agent worker over NDJSON stdio and record its trajectory"
)]
struct Cli {
    /// Task instruction handed to the worker.
    instruction: String,

    /// Session id; random when omitted.
    #[arg(long)]
    session_id: Option<String>,

    /// Model identifier passed to the worker.
    #[arg(long)]
    model: Option<String>,

    /// Directory that receives trajectory.json.
    #[arg(long, default_value = "logs")]
    logs_dir: PathBuf,

    /// Runner script to execute instead of discovering one.
    #[arg(long)]
    runner: Option<PathBuf>,

    /// Directory searched for dist/runner.js and src/runner.ts.
    #[arg(long, default_value = ".")]
    runner_root: PathBuf,

    /// Experiment name; enables session tracing.
    #[arg(long)]
    experiment: Option<String>,

    /// Trial configuration JSON merged into trace metadata.
    #[arg(long)]
    trial_config: Option<PathBuf>,

    /// JSON object mapping instructions to dataset example ids.
    #[arg(long)]
    examples: Option<PathBuf>,

    /// Working directory for proxied commands.
    #[arg(long, env = "HARBOR_WORKDIR")]
    workdir: Option<PathBuf>,

    /// Per-command timeout for proxied commands, in seconds.
    #[arg(long, default_value_t = 120)]
    exec_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    harbor_bridge::logging::init_tracing();
    let cli = Cli::parse();

    let mut config = BridgeConfig::from_env()?
        .with_logs_dir(cli.logs_dir)
        .with_runner_root(cli.runner_root);
    if let Some(model) = cli.model {
        config = config.with_model(model);
    }
    if let Some(runner) = cli.runner {
        config = config.with_runner(runner);
    }
    if let Some(experiment) = cli.experiment {
        config = config.with_experiment(experiment);
    }
    if let Some(path) = &cli.trial_config {
        config = config.with_trial_config(load_trial_config(path)?);
    }

    let lookup = match &cli.examples {
        Some(path) => ExampleLookup::from_json_file(path)?,
        None => ExampleLookup::new(),
    };

    let mut shell = LocalShell::new().with_timeout(Duration::from_secs(cli.exec_timeout_secs));
    if let Some(dir) = cli.workdir {
        shell = shell.with_working_dir(dir);
    }

    let sink: Box<dyn TraceSink> = if config.experiment.is_some() {
        Box::new(LogTraceSink::new())
    } else {
        Box::new(NoopTraceSink)
    };

    let mut request = SessionRequest::new(cli.instruction);
    if let Some(id) = cli.session_id {
        request = request.with_session_id(id);
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling session");
            on_signal.cancel();
        }
    });

    let outcome = SessionRunner::new(&config, &shell, sink.as_ref(), &lookup)
        .run(&request, cancel)
        .await
        .with_context(|| format!("session {} failed", request.session_id))?;

    println!("{}", outcome.trajectory_path.display());
    Ok(())
}
