//! Scratchpad CLI - run JavaScript/TypeScript snippets in the scratchpad engine.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::filter::EnvFilter;

mod commands;
mod config;

#[derive(Parser)]
#[command(
    name = "scratchpad",
    version,
    about = "Run JavaScript/TypeScript snippets in a sandboxed engine",
    long_about = "Scratchpad runs short scripts inside an embedded QuickJS engine with a \
                  restricted set of builtin modules plus your installed packages.\n\n\
                  Run a file:   scratchpad run snippet.ts\n\
                  Eval code:    scratchpad eval 'console.log(1 + 1)'"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose engine diagnostics
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Config file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a JavaScript/TypeScript file
    Run(commands::run::RunCommand),

    /// Run code given on the command line
    Eval(commands::eval::EvalCommand),

    /// Close every listener the engine is tracking
    Clean(commands::clean::CleanCommand),

    /// Terminate scratchpad processes listening on a port
    KillPort(commands::kill_port::KillPortCommand),

    /// Inspect the package install directory
    Packages(commands::packages::PackagesCommand),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_directive = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_directive.parse()?))
        .with_writer(std::io::stderr)
        .init();

    let config = config::load_config(cli.config.as_deref())?;
    let output = commands::Output { json: cli.json };

    let ok = match cli.command {
        Commands::Run(cmd) => cmd.run(&config, output).await?,
        Commands::Eval(cmd) => cmd.run(&config, output).await?,
        Commands::Clean(cmd) => cmd.run(&config, output).await?,
        Commands::KillPort(cmd) => cmd.run(&config, output).await?,
        Commands::Packages(cmd) => cmd.run(&config, output)?,
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
