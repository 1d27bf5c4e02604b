//! Kill-port command - free a port held by another scratchpad process.

use anyhow::Result;
use clap::Args;

use super::{Output, start_engine};
use crate::config::Config;

#[derive(Args)]
pub struct KillPortCommand {
    /// TCP port to free
    pub port: u16,
}

impl KillPortCommand {
    pub async fn run(&self, config: &Config, output: Output) -> Result<bool> {
        let engine = start_engine(config, None)?;
        let outcome = engine.handle().kill_port(self.port).await;
        engine.shutdown().await;

        if output.json {
            output.print_json(&outcome)?;
        } else if outcome.success {
            println!("{}", outcome.message);
        } else {
            eprintln!("{}", outcome.message);
        }
        Ok(outcome.success)
    }
}
