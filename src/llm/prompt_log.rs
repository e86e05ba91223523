//! Append-only log of every prompt sent to the model.

use chrono::Local;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

const RULE: &str =
    "================================================================================";

/// Writes prompts to a file for later inspection.
#[derive(Debug, Clone)]
pub struct PromptLog {
    path: PathBuf,
}

impl PromptLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one prompt. Write failures are logged and otherwise ignored.
    pub fn record(&self, prompt_name: &str, prompt: &str) {
        if let Err(e) = self.append(prompt_name, prompt) {
            warn!(
                "Failed to write prompt log {}: {}",
                self.path.display(),
                e
            );
        }
    }

    fn append(&self, prompt_name: &str, prompt: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        write!(
            file,
            "\n{RULE}\nTimestamp: {timestamp}\nPrompt Name: {prompt_name}\n{RULE}\n{prompt}\n================================ End of Prompt =================================\n\n\n"
        )
    }
}
