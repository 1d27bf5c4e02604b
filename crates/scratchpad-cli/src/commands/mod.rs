//! CLI commands

pub mod clean;
pub mod eval;
pub mod kill_port;
pub mod packages;
pub mod run;

use crate::config::Config;
use anyhow::Result;
use clap::{Args, ValueEnum};
use scratchpad_runtime::{Engine, Language, LogChannel, LogEvent, RunRequest};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Global output switches.
#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub json: bool,
}

impl Output {
    /// Print a serializable value as pretty JSON on stdout.
    pub fn print_json<T: serde::Serialize>(&self, value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LangArg {
    #[value(alias = "javascript")]
    Js,
    #[value(alias = "typescript")]
    Ts,
}

impl From<LangArg> for Language {
    fn from(lang: LangArg) -> Self {
        match lang {
            LangArg::Js => Language::JavaScript,
            LangArg::Ts => Language::TypeScript,
        }
    }
}

/// Options shared by `run` and `eval`.
#[derive(Args, Debug, Clone)]
pub struct RunOptions {
    /// Source language (inferred from the file extension for `run`)
    #[arg(long, value_enum)]
    pub lang: Option<LangArg>,

    /// Per-entry execution budget in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Keep serving listeners the script opened until Ctrl-C
    #[arg(long)]
    pub keep_alive: bool,
}

/// Build an engine from the config with command line overrides applied.
pub fn start_engine(config: &Config, timeout_ms: Option<u64>) -> Result<Engine> {
    let mut engine_config = config.engine.clone();
    if let Some(ms) = timeout_ms {
        engine_config = engine_config.timeout_ms(ms);
    }
    let engine = Engine::builder()
        .config(engine_config)
        .registry(config.packages.registry())
        .build()?;
    Ok(engine)
}

/// Print log events as they arrive until every sender is gone.
fn spawn_printer(mut events: mpsc::UnboundedReceiver<LogEvent>, output: Output) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if output.json {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{line}");
                }
                continue;
            }
            match event.channel {
                LogChannel::Stdout => println!("{}", event.message),
                LogChannel::Stderr => eprintln!("{}", event.message),
            }
        }
    })
}

/// Run one request to completion and print its result. Returns the run's
/// success flag.
pub async fn execute(
    config: &Config,
    request: RunRequest,
    options: &RunOptions,
    output: Output,
) -> Result<bool> {
    let engine = start_engine(config, options.timeout_ms)?;
    let handle = engine.handle();

    let (sink, events) = mpsc::unbounded_channel();
    let printer = spawn_printer(events, output);

    let result = handle.run(request, sink).await;
    if output.json {
        output.print_json(&result)?;
    }
    tracing::debug!(duration_ms = result.duration_ms, "Run reported");

    if options.keep_alive && handle.has_listeners() {
        for addr in handle.listener_addresses() {
            tracing::info!(%addr, "Listening");
        }
        tracing::info!("Press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    engine.shutdown().await;
    // The sink's last clone went away with the worker's session.
    let _ = printer.await;
    Ok(result.success)
}
