//! Stateful code sandbox.
//!
//! Generated analysis code runs in a long-lived Python process so that
//! variables (most importantly DataFrames) survive between steps.

pub mod python;

pub use python::{PythonSandbox, SandboxConfig};

use crate::models::Summaries;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the sandbox process.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to start sandbox with '{python}': {message}")]
    Spawn { python: String, message: String },

    #[error("sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox protocol error: {0}")]
    Protocol(String),

    #[error("execution exceeded {0}s and the sandbox was restarted")]
    Timeout(u64),

    #[error("sandbox process exited unexpectedly")]
    Closed,
}

/// Captured output of one code execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl ExecOutput {
    /// Any text on stderr marks the execution as failed.
    pub fn is_error(&self) -> bool {
        !self.stderr.trim().is_empty()
    }
}

/// Something that can run Python code and report on its DataFrames.
#[async_trait]
pub trait CodeRunner: Send {
    /// Run `code` in the persistent namespace.
    async fn run_code(&mut self, code: &str) -> Result<ExecOutput, SandboxError>;

    /// Summaries of every public DataFrame in the namespace.
    async fn dataframe_summaries(&mut self) -> Result<Summaries, SandboxError>;

    /// Replace the process with a fresh one. All variables are lost.
    async fn restart(&mut self) -> Result<(), SandboxError>;

    /// Stop the process.
    async fn shutdown(&mut self) -> Result<(), SandboxError>;
}
