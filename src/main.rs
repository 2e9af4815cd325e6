//! evo CLI: run the autonomy control loop against the built-in demo tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use miette::Result;

use evo_autonomy::agent::builtin::{demo_planner, demo_registry};
use evo_autonomy::agent::metacognition::SelfModel;
use evo_autonomy::agent::{Collaborators, ControlLoop, InMemoryStore, InputHandle, QueueGateway};
use evo_autonomy::config::EvoConfig;
use evo_autonomy::error::EvoResult;
use evo_autonomy::message::{JsonSink, StatusSink, StdoutSink};

#[derive(Parser)]
#[command(name = "evo", version, about = "Autonomy control loop")]
struct Cli {
    /// TOML config file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Self-model JSON file, loaded at start and saved at exit.
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Emit tick status as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a fixed number of ticks.
    Run {
        #[arg(long, default_value = "10")]
        ticks: u64,

        /// User goal, queued before the first tick. Prefix with
        /// `tool,tool=` to pick capabilities (default: echo).
        #[arg(long)]
        input: Vec<String>,
    },

    /// Print the effective configuration as TOML.
    Config,

    /// Tick on an interval until Ctrl+C.
    #[cfg(feature = "daemon")]
    Daemon {
        /// Milliseconds between ticks.
        #[arg(long, default_value = "1000")]
        interval_ms: u64,

        /// Stop after this many ticks (0 = unlimited).
        #[arg(long, default_value = "0")]
        max_ticks: u64,
    },
}

fn load_config(path: Option<&Path>) -> EvoResult<EvoConfig> {
    let mut config = match path {
        Some(path) => EvoConfig::load(path)?,
        None => EvoConfig::default(),
    };
    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Split `tool,tool=text` into hints and text.
fn parse_input(raw: &str) -> (Vec<String>, String) {
    match raw.split_once('=') {
        Some((tools, text)) if !tools.contains(' ') => (
            tools
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
            text.trim().to_string(),
        ),
        _ => (vec!["echo".to_string()], raw.trim().to_string()),
    }
}

fn build_loop(cli: &Cli, config: &EvoConfig) -> Result<(ControlLoop, InputHandle)> {
    let initial_model = match &cli.state {
        Some(path) if path.exists() => Some(SelfModel::load(path)?),
        _ => None,
    };
    let sink: Arc<dyn StatusSink> = if cli.json {
        Arc::new(JsonSink)
    } else {
        Arc::new(StdoutSink)
    };
    let gateway = QueueGateway::new();
    let input = gateway.handle();
    let control = ControlLoop::new(
        config,
        Collaborators {
            planner: Box::new(demo_planner()),
            registry: Arc::new(demo_registry()?),
            memory: Arc::new(InMemoryStore::new()),
            perception: Box::new(gateway),
            sink,
            initial_model,
        },
    )?;
    Ok((control, input))
}

fn save_state(cli: &Cli, control: &ControlLoop) -> Result<()> {
    if let Some(path) = &cli.state {
        control.self_model().save(path)?;
        tracing::info!(path = %path.display(), "self-model saved");
    }
    Ok(())
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match &cli.command {
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }

        Commands::Run { ticks, input } => {
            let (mut control, handle) = build_loop(&cli, &config)?;
            for raw in input {
                let (hints, text) = parse_input(raw);
                handle.push_user_with_hints(text, hints);
            }
            control.run(*ticks);
            save_state(&cli, &control)?;
        }

        #[cfg(feature = "daemon")]
        Commands::Daemon {
            interval_ms,
            max_ticks,
        } => {
            use evo_autonomy::agent::daemon::{DaemonConfig, LoopDaemon};
            use miette::IntoDiagnostic;

            let (mut control, _handle) = build_loop(&cli, &config)?;
            let daemon_config = DaemonConfig {
                tick_interval: std::time::Duration::from_millis(*interval_ms),
                max_ticks: *max_ticks,
            };
            let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
            let reason = runtime.block_on(LoopDaemon::new(&mut control, daemon_config).run());
            tracing::info!(reason = ?reason, ticks = control.tick_count(), "daemon exited");
            save_state(&cli, &control)?;
        }
    }

    Ok(())
}
