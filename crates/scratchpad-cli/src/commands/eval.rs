//! Eval command - run code given as an argument.

use anyhow::Result;
use clap::Args;
use scratchpad_runtime::{Language, RunRequest};

use super::{Output, RunOptions, execute};
use crate::config::Config;

#[derive(Args)]
pub struct EvalCommand {
    /// Source code to run
    pub code: String,

    #[command(flatten)]
    pub options: RunOptions,
}

impl EvalCommand {
    pub async fn run(&self, config: &Config, output: Output) -> Result<bool> {
        let language = self
            .options
            .lang
            .map(Language::from)
            .unwrap_or(Language::JavaScript);
        execute(
            config,
            RunRequest::new(self.code.clone(), language),
            &self.options,
            output,
        )
        .await
    }
}
