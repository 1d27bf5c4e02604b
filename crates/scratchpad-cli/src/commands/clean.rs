//! Clean command - close tracked listeners.
//!
//! A fresh process tracks nothing, so this mostly confirms the engine starts
//! and its cleanup path is healthy.

use anyhow::Result;
use clap::Args;
use serde_json::json;

use super::{Output, start_engine};
use crate::config::Config;

#[derive(Args)]
pub struct CleanCommand {}

impl CleanCommand {
    pub async fn run(&self, config: &Config, output: Output) -> Result<bool> {
        let engine = start_engine(config, None)?;
        let ok = engine.handle().clean().await;
        engine.shutdown().await;

        if output.json {
            output.print_json(&json!({ "success": ok }))?;
        } else if ok {
            println!("All listeners closed");
        } else {
            eprintln!("Some listeners failed to close");
        }
        Ok(ok)
    }
}
