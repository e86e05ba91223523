//! Executor: generates code for a single plan step and runs it.
//!
//! The model answers with one tool call per attempt. Failed attempts are
//! appended to the context so the next prompt can correct them.

use crate::agent::prompts::worker_prompt;
use crate::llm::ChatModel;
use crate::sandbox::{CodeRunner, SandboxError};
use crate::state::StateManager;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of executing one step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Code ran without errors.
    Success { code: String, output: String },
    /// The model answered the user directly.
    FinalAnswer { answer: String },
    /// All attempts failed.
    Failed { task: String, error: String },
}

/// Settings for [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// Attempts per step.
    pub max_retries: usize,
    /// Print generated code and its output to stdout.
    pub echo: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            echo: false,
        }
    }
}

/// Tools the model can call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tool {
    ExecutePython,
    FinalAnswer,
}

impl Tool {
    /// Registry lookup by tool name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "execute_python" => Some(Tool::ExecutePython),
            "final_answer" => Some(Tool::FinalAnswer),
            _ => None,
        }
    }
}

/// A tool call extracted from the model response.
#[derive(Debug, Clone, PartialEq)]
struct ToolCall {
    name: String,
    arguments: Map<String, Value>,
}

/// What running a tool produced.
#[derive(Debug)]
enum ToolResult {
    Success { code: String, output: String },
    FinalAnswer(String),
    ExecutionError { code: String, error: String },
    Invalid(String),
}

pub struct Executor {
    model: Arc<dyn ChatModel>,
    settings: ExecutorSettings,
}

impl Executor {
    pub fn new(model: Arc<dyn ChatModel>, settings: ExecutorSettings) -> Self {
        Self { model, settings }
    }

    /// Execute one task with up to `max_retries` attempts.
    pub async fn execute_task(
        &self,
        task: &str,
        context: &str,
        runner: &mut dyn CodeRunner,
        state: &mut StateManager,
    ) -> StepOutcome {
        let mut attempt = 0;
        let mut current_context = context.to_string();
        let mut last_error = String::new();

        while attempt < self.settings.max_retries {
            let prompt = worker_prompt(task, &current_context);

            let response = match self.model.complete_json("worker", &prompt).await {
                Ok(response) => response,
                Err(e) => {
                    attempt += 1;
                    warn!("Worker LLM call failed: {}", e);
                    last_error = e.to_string();
                    current_context.push_str(&format!(
                        "\n\n**Attempt {} Error:**\nFailed to get a valid tool call from LLM. Error: {}",
                        attempt, e
                    ));
                    continue;
                }
            };

            if let Some(thought) = response.get("thought").and_then(Value::as_str) {
                debug!("Worker thought: {}", thought);
            }

            let call = match parse_tool_call(&response) {
                Ok(call) => call,
                Err(message) => {
                    attempt += 1;
                    warn!("{}", message);
                    last_error = message.clone();
                    current_context.push_str(&format!(
                        "\n\n**Attempt {} Error:**\n{}",
                        attempt, message
                    ));
                    continue;
                }
            };

            match self.dispatch(&call, runner, state).await {
                ToolResult::Success { code, output } => {
                    return StepOutcome::Success { code, output };
                }
                ToolResult::FinalAnswer(answer) => {
                    return StepOutcome::FinalAnswer { answer };
                }
                ToolResult::ExecutionError { code, error } => {
                    attempt += 1;
                    current_context.push_str(&format!(
                        "\n\n**Attempt {} Failed:**\n\
                         I tried to execute the following code:\n\
                         ```python\n{}\n```\n\
                         However, it failed with the following error:\n\
                         ```\n{}\n```\n\
                         Please analyze the error, review the current DataFrame summaries, and provide new, corrected code that is idempotent (i.e., it can be run multiple times without causing new errors).",
                        attempt, code, error
                    ));
                    last_error = error;
                    info!(
                        "Task execution failed. Retrying ({}/{})",
                        attempt, self.settings.max_retries
                    );
                }
                ToolResult::Invalid(message) => {
                    attempt += 1;
                    warn!("{}", message);
                    current_context.push_str(&format!(
                        "\n\n**Attempt {} Error:**\n{}",
                        attempt, message
                    ));
                    last_error = message;
                }
            }
        }

        StepOutcome::Failed {
            task: task.to_string(),
            error: format!(
                "Worker failed to execute the task after multiple retries. Last error: {}",
                last_error.trim()
            ),
        }
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        runner: &mut dyn CodeRunner,
        state: &mut StateManager,
    ) -> ToolResult {
        match Tool::from_name(&call.name) {
            Some(Tool::ExecutePython) => match string_argument(&call.arguments, "code") {
                Some(code) => self.execute_python(code, runner, state).await,
                None => ToolResult::Invalid(
                    "Tool call argument error: execute_python requires a non-empty 'code' string"
                        .to_string(),
                ),
            },
            Some(Tool::FinalAnswer) => match string_argument(&call.arguments, "answer") {
                Some(answer) => ToolResult::FinalAnswer(answer.to_string()),
                None => ToolResult::Invalid(
                    "Tool call argument error: final_answer requires a non-empty 'answer' string"
                        .to_string(),
                ),
            },
            None => ToolResult::Invalid(format!("Tool '{}' not found.", call.name)),
        }
    }

    /// Run code and re-sync DataFrame summaries afterwards.
    async fn execute_python(
        &self,
        code: &str,
        runner: &mut dyn CodeRunner,
        state: &mut StateManager,
    ) -> ToolResult {
        if self.settings.echo {
            println!("\n[Executing Code]:\n{}", code);
        }

        let output = match runner.run_code(code).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Sandbox failure: {}", e);
                recover_sandbox(&e, runner, state).await;
                return ToolResult::ExecutionError {
                    code: code.to_string(),
                    error: sandbox_error_feedback(&e),
                };
            }
        };

        match runner.dataframe_summaries().await {
            Ok(summaries) => state.update_all_dataframe_summaries(summaries),
            Err(e) => {
                warn!("Error during DataFrame introspection: {}", e);
                recover_sandbox(&e, runner, state).await;
                // The block that just ran is not in the history yet
                if !output.is_error() {
                    if let Err(e) = runner.run_code(code).await {
                        warn!("Re-running the last block failed: {}", e);
                    }
                    fetch_summaries(runner, state).await;
                }
            }
        }

        if output.is_error() {
            if self.settings.echo {
                println!("\n[Execution Error]:\n{}", output.stderr);
            }
            ToolResult::ExecutionError {
                code: code.to_string(),
                error: output.stderr,
            }
        } else {
            if self.settings.echo {
                println!("\n[Execution Output]:\n{}", output.stdout);
            }
            ToolResult::Success {
                code: code.to_string(),
                output: output.stdout,
            }
        }
    }
}

/// Refresh the state's DataFrame summaries from the sandbox.
///
/// A failed introspection can leave a fresh interpreter behind (a timeout
/// respawns it), so the sandbox is recovered and the code history replayed.
pub async fn sync_summaries(runner: &mut dyn CodeRunner, state: &mut StateManager) {
    match runner.dataframe_summaries().await {
        Ok(summaries) => state.update_all_dataframe_summaries(summaries),
        Err(e) => {
            warn!("Error during DataFrame introspection: {}", e);
            recover_sandbox(&e, runner, state).await;
        }
    }
}

async fn fetch_summaries(runner: &mut dyn CodeRunner, state: &mut StateManager) {
    match runner.dataframe_summaries().await {
        Ok(summaries) => state.update_all_dataframe_summaries(summaries),
        Err(e) => warn!("DataFrame introspection failed after recovery: {}", e),
    }
}

/// Bring a dead or restarted sandbox back to the state of the code history.
async fn recover_sandbox(error: &SandboxError, runner: &mut dyn CodeRunner, state: &mut StateManager) {
    // A timeout already respawned the process
    if !matches!(error, SandboxError::Timeout(_)) {
        if let Err(e) = runner.restart().await {
            warn!("Failed to restart sandbox: {}", e);
            return;
        }
    }

    let blocks = state.executed_code_blocks().to_vec();
    info!("Replaying {} code blocks into the fresh sandbox", blocks.len());
    for block in &blocks {
        match runner.run_code(block).await {
            Ok(output) if output.is_error() => {
                warn!("Replayed block failed: {}", output.stderr.trim())
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Replay aborted: {}", e);
                break;
            }
        }
    }

    fetch_summaries(runner, state).await;
}

fn sandbox_error_feedback(error: &SandboxError) -> String {
    match error {
        SandboxError::Timeout(secs) => format!(
            "TimeoutError: execution exceeded {}s. The sandbox was restarted and the earlier code was re-run. Use a faster approach.",
            secs
        ),
        other => format!(
            "SandboxError: {}. The sandbox was restarted and the earlier code was re-run.",
            other
        ),
    }
}

fn string_argument<'a>(arguments: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Extract `tool_call` from a worker response.
fn parse_tool_call(response: &Value) -> Result<ToolCall, String> {
    if let Some(error) = response.get("error") {
        return Err(format!("LLM returned an error: {}", error));
    }

    let call = response
        .get("tool_call")
        .and_then(Value::as_object)
        .ok_or_else(|| "Invalid JSON response from LLM: missing 'tool_call' object.".to_string())?;

    let name = call
        .get("tool_name")
        .or_else(|| call.get("name"))
        .and_then(Value::as_str)
        .ok_or_else(|| "Invalid tool call: missing 'tool_name'.".to_string())?;

    // Some models send the arguments as an encoded JSON string
    let arguments = match call.get("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(Value::String(encoded)) => match serde_json::from_str::<Value>(encoded) {
            Ok(Value::Object(map)) => map,
            _ => return Err("Tool call argument error: 'arguments' is not an object.".to_string()),
        },
        Some(_) => return Err("Tool call argument error: 'arguments' is not an object.".to_string()),
    };

    Ok(ToolCall {
        name: name.to_string(),
        arguments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{err, ok, FakeRunner, ScriptedModel};
    use crate::llm::LlmError;
    use crate::models::{DataFrameSummary, Summaries};
    use serde_json::json;
    use tempfile::TempDir;

    fn python_call(code: &str) -> Value {
        json!({
            "thought": "run it",
            "tool_call": {"tool_name": "execute_python", "arguments": {"code": code}}
        })
    }

    fn executor_with(model: Arc<ScriptedModel>) -> Executor {
        Executor::new(model, ExecutorSettings::default())
    }

    #[test]
    fn test_tool_registry() {
        assert_eq!(Tool::from_name("execute_python"), Some(Tool::ExecutePython));
        assert_eq!(Tool::from_name("final_answer"), Some(Tool::FinalAnswer));
        assert_eq!(Tool::from_name("rm_rf"), None);
    }

    #[test]
    fn test_parse_tool_call_variants() {
        let call = parse_tool_call(&python_call("print(1)")).unwrap();
        assert_eq!(call.name, "execute_python");
        assert_eq!(call.arguments["code"], "print(1)");

        let encoded = json!({"tool_call": {"name": "final_answer", "arguments": "{\"answer\": \"42\"}"}});
        let call = parse_tool_call(&encoded).unwrap();
        assert_eq!(call.name, "final_answer");
        assert_eq!(call.arguments["answer"], "42");

        assert!(parse_tool_call(&json!({"thought": "hmm"})).is_err());
        assert!(parse_tool_call(&json!({"error": "boom"})).is_err());
        assert!(parse_tool_call(&json!({"tool_call": {"arguments": {}}})).is_err());
    }

    #[tokio::test]
    async fn test_success_syncs_summaries() {
        let dir = TempDir::new().unwrap();
        let mut state = StateManager::new(dir.path()).unwrap();
        let model = Arc::new(ScriptedModel::new(vec![Ok(python_call("print(df.shape)"))]));

        let mut summaries = Summaries::new();
        summaries.insert(
            "df".to_string(),
            DataFrameSummary::Error {
                error: "x".to_string(),
            },
        );
        let (runner, log) = FakeRunner::new(vec![ok("(3, 2)\n")]);
        let mut runner = runner.with_summaries(summaries);

        let outcome = executor_with(model)
            .execute_task("Show shape", "ctx", &mut runner, &mut state)
            .await;

        assert_eq!(
            outcome,
            StepOutcome::Success {
                code: "print(df.shape)".to_string(),
                output: "(3, 2)\n".to_string()
            }
        );
        assert_eq!(log.lock().unwrap().ran, vec!["print(df.shape)".to_string()]);
        assert!(state.dataframe_summaries().contains_key("df"));
    }

    #[tokio::test]
    async fn test_retry_after_execution_error() {
        let dir = TempDir::new().unwrap();
        let mut state = StateManager::new(dir.path()).unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(python_call("print(df['month'])")),
            Ok(python_call("print(df['date'])")),
        ]));
        let (mut runner, _log) = FakeRunner::new(vec![err("KeyError: 'month'\n"), ok("2024-01\n")]);

        let outcome = executor_with(model.clone())
            .execute_task("Show month", "ctx", &mut runner, &mut state)
            .await;

        assert!(matches!(outcome, StepOutcome::Success { ref output, .. } if output == "2024-01\n"));
        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].1.contains("**Attempt 1 Failed:**"));
        assert!(prompts[1].1.contains("KeyError: 'month'"));
        assert!(prompts[1].1.contains("print(df['month'])"));
    }

    #[tokio::test]
    async fn test_final_answer() {
        let dir = TempDir::new().unwrap();
        let mut state = StateManager::new(dir.path()).unwrap();
        let model = Arc::new(ScriptedModel::new(vec![Ok(json!({
            "thought": "done",
            "tool_call": {"tool_name": "final_answer", "arguments": {"answer": "North sells most."}}
        }))]));
        let (mut runner, log) = FakeRunner::new(vec![]);

        let outcome = executor_with(model)
            .execute_task("Summarize", "ctx", &mut runner, &mut state)
            .await;

        assert_eq!(
            outcome,
            StepOutcome::FinalAnswer {
                answer: "North sells most.".to_string()
            }
        );
        assert!(log.lock().unwrap().ran.is_empty());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let dir = TempDir::new().unwrap();
        let mut state = StateManager::new(dir.path()).unwrap();
        let model = Arc::new(ScriptedModel::new(vec![
            Err(LlmError::EmptyResponse),
            Ok(json!({"tool_call": {"tool_name": "web_search", "arguments": {}}})),
            Ok(json!({"tool_call": {"tool_name": "execute_python", "arguments": {}}})),
            Ok(python_call("print('never reached')")),
        ]));
        let (mut runner, log) = FakeRunner::new(vec![]);

        let outcome = executor_with(model.clone())
            .execute_task("Do it", "ctx", &mut runner, &mut state)
            .await;

        match outcome {
            StepOutcome::Failed { task, error } => {
                assert_eq!(task, "Do it");
                assert!(error.starts_with("Worker failed to execute the task after multiple retries."));
                assert!(error.contains("'code'"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(model.prompt_names().len(), 3);
        assert!(log.lock().unwrap().ran.is_empty());

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[2].1.contains("Tool 'web_search' not found."));
    }

    #[tokio::test]
    async fn test_sandbox_crash_restarts_and_replays() {
        let dir = TempDir::new().unwrap();
        let mut state = StateManager::new(dir.path()).unwrap();
        state.add_executed_code_block("import pandas as pd\nsales = pd.read_csv('sales.csv')", None, "");

        let model = Arc::new(ScriptedModel::new(vec![
            Ok(python_call("import os\nos._exit(1)")),
            Ok(python_call("print(len(sales))")),
        ]));
        let (mut runner, log) = FakeRunner::new(vec![Err(SandboxError::Closed), ok(""), ok("120\n")]);

        let outcome = executor_with(model.clone())
            .execute_task("Count rows", "ctx", &mut runner, &mut state)
            .await;

        assert!(matches!(outcome, StepOutcome::Success { ref output, .. } if output == "120\n"));
        let log = log.lock().unwrap();
        assert_eq!(log.restarts, 1);
        assert_eq!(log.ran.len(), 3);
        assert!(log.ran[1].contains("pd.read_csv('sales.csv')"));

        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[1].1.contains("SandboxError"));
    }

    #[tokio::test]
    async fn test_timeout_replays_without_second_restart() {
        let dir = TempDir::new().unwrap();
        let mut state = StateManager::new(dir.path()).unwrap();
        state.add_executed_code_block("x = 1", None, "");

        let model = Arc::new(ScriptedModel::new(vec![
            Ok(python_call("while True: pass")),
            Ok(python_call("print(x)")),
        ]));
        let (mut runner, log) =
            FakeRunner::new(vec![Err(SandboxError::Timeout(60)), ok(""), ok("1\n")]);

        let outcome = executor_with(model.clone())
            .execute_task("Print x", "ctx", &mut runner, &mut state)
            .await;

        assert!(matches!(outcome, StepOutcome::Success { .. }));
        assert_eq!(log.lock().unwrap().restarts, 0);
        assert!(model.prompts.lock().unwrap()[1].1.contains("TimeoutError"));
    }

    #[tokio::test]
    async fn test_introspection_timeout_replays_history() {
        let dir = TempDir::new().unwrap();
        let mut state = StateManager::new(dir.path()).unwrap();
        state.add_executed_code_block("sales = load()", None, "");

        let model = Arc::new(ScriptedModel::new(vec![Ok(python_call("big = sales * 2"))]));
        let mut summaries = Summaries::new();
        summaries.insert(
            "big".to_string(),
            DataFrameSummary::Error {
                error: "x".to_string(),
            },
        );
        let (runner, log) = FakeRunner::new(vec![ok("")]);
        let mut runner = runner
            .with_summaries(summaries)
            .failing_summaries(SandboxError::Timeout(60));

        let outcome = executor_with(model)
            .execute_task("Double sales", "ctx", &mut runner, &mut state)
            .await;

        assert!(matches!(outcome, StepOutcome::Success { .. }));
        let log = log.lock().unwrap();
        assert_eq!(log.restarts, 0);
        assert_eq!(
            log.ran,
            vec![
                "big = sales * 2".to_string(),
                "sales = load()".to_string(),
                "big = sales * 2".to_string(),
            ]
        );
        assert!(state.dataframe_summaries().contains_key("big"));
    }

    #[tokio::test]
    async fn test_sync_summaries_recovers_closed_sandbox() {
        let dir = TempDir::new().unwrap();
        let mut state = StateManager::new(dir.path()).unwrap();
        state.add_executed_code_block("x = 1", None, "");
        let (runner, log) = FakeRunner::new(vec![]);
        let mut runner = runner.failing_summaries(SandboxError::Closed);

        sync_summaries(&mut runner, &mut state).await;

        let log = log.lock().unwrap();
        assert_eq!(log.restarts, 1);
        assert_eq!(log.ran, vec!["x = 1".to_string()]);
    }
}
