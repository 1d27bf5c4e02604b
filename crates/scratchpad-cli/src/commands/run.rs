//! Run command - execute a JavaScript/TypeScript file.

use anyhow::{Context, Result};
use clap::Args;
use scratchpad_runtime::{Language, RunRequest};
use std::path::{Path, PathBuf};

use super::{Output, RunOptions, execute};
use crate::config::Config;

#[derive(Args)]
pub struct RunCommand {
    /// File to execute
    pub file: PathBuf,

    #[command(flatten)]
    pub options: RunOptions,
}

impl RunCommand {
    pub async fn run(&self, config: &Config, output: Output) -> Result<bool> {
        let source = std::fs::read_to_string(&self.file)
            .with_context(|| format!("Failed to read {}", self.file.display()))?;
        let language = self
            .options
            .lang
            .map(Language::from)
            .unwrap_or_else(|| language_of(&self.file));
        tracing::debug!(file = %self.file.display(), ?language, "Running file");

        execute(config, RunRequest::new(source, language), &self.options, output).await
    }
}

/// Language from the file extension, JavaScript when unknown.
fn language_of(path: &Path) -> Language {
    path.extension()
        .and_then(|ext| ext.to_str())
        .and_then(Language::from_extension)
        .unwrap_or(Language::JavaScript)
}
