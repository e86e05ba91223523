//! Scripted stand-ins for the model and the sandbox.

use crate::llm::{ChatModel, LlmError};
use crate::models::Summaries;
use crate::sandbox::{CodeRunner, ExecOutput, SandboxError};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Replays canned responses and records every prompt.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<Result<Value, LlmError>>>,
    pub prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<Result<Value, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompt_names(&self) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete_json(&self, prompt_name: &str, prompt: &str) -> Result<Value, LlmError> {
        self.prompts
            .lock()
            .unwrap()
            .push((prompt_name.to_string(), prompt.to_string()));
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}

/// What a [`FakeRunner`] was asked to do.
#[derive(Debug, Default)]
pub struct RunnerLog {
    pub ran: Vec<String>,
    pub restarts: usize,
    pub shutdowns: usize,
}

/// Returns canned execution results; runs past the script succeed silently.
pub struct FakeRunner {
    outputs: VecDeque<Result<ExecOutput, SandboxError>>,
    summaries: Summaries,
    summary_failures: VecDeque<SandboxError>,
    log: Arc<Mutex<RunnerLog>>,
}

impl FakeRunner {
    pub fn new(outputs: Vec<Result<ExecOutput, SandboxError>>) -> (Self, Arc<Mutex<RunnerLog>>) {
        let log = Arc::new(Mutex::new(RunnerLog::default()));
        let runner = Self {
            outputs: outputs.into(),
            summaries: Summaries::new(),
            summary_failures: VecDeque::new(),
            log: log.clone(),
        };
        (runner, log)
    }

    pub fn with_summaries(mut self, summaries: Summaries) -> Self {
        self.summaries = summaries;
        self
    }

    /// Fail the next introspection call with `error`.
    pub fn failing_summaries(mut self, error: SandboxError) -> Self {
        self.summary_failures.push_back(error);
        self
    }
}

pub fn ok(stdout: &str) -> Result<ExecOutput, SandboxError> {
    Ok(ExecOutput {
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

pub fn err(stderr: &str) -> Result<ExecOutput, SandboxError> {
    Ok(ExecOutput {
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

#[async_trait]
impl CodeRunner for FakeRunner {
    async fn run_code(&mut self, code: &str) -> Result<ExecOutput, SandboxError> {
        self.log.lock().unwrap().ran.push(code.to_string());
        self.outputs.pop_front().unwrap_or_else(|| ok(""))
    }

    async fn dataframe_summaries(&mut self) -> Result<Summaries, SandboxError> {
        if let Some(error) = self.summary_failures.pop_front() {
            return Err(error);
        }
        Ok(self.summaries.clone())
    }

    async fn restart(&mut self) -> Result<(), SandboxError> {
        self.log.lock().unwrap().restarts += 1;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), SandboxError> {
        self.log.lock().unwrap().shutdowns += 1;
        Ok(())
    }
}
