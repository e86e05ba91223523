//! Python subprocess sandbox.
//!
//! The process runs a small driver script that reads one JSON request per
//! line from stdin and answers with one marker-prefixed JSON line on stdout.

use crate::models::Summaries;
use crate::sandbox::{CodeRunner, ExecOutput, SandboxError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Driver script executed with `python -c`.
const DRIVER: &str = include_str!("driver.py");

/// Prefix of every response line written by the driver.
const MARKER: &str = "__DATACOPILOT__:";

/// How long startup and shutdown may take.
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for [`PythonSandbox`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Interpreter to launch.
    pub python: String,
    /// Working directory for all executed code.
    pub workspace: PathBuf,
    /// Limit for a single execution.
    pub exec_timeout: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            workspace: PathBuf::from("./workspace"),
            exec_timeout: Duration::from_secs(60),
        }
    }
}

struct SandboxProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

#[derive(Debug, Deserialize)]
struct SummariesResponse {
    summaries: Summaries,
}

/// A persistent Python interpreter.
pub struct PythonSandbox {
    config: SandboxConfig,
    process: Option<SandboxProcess>,
}

impl PythonSandbox {
    /// Start the interpreter and wait until it answers.
    pub async fn start(config: SandboxConfig) -> Result<Self, SandboxError> {
        let mut sandbox = Self {
            config,
            process: None,
        };
        sandbox.spawn().await?;
        Ok(sandbox)
    }

    async fn spawn(&mut self) -> Result<(), SandboxError> {
        let workspace = std::fs::canonicalize(&self.config.workspace)
            .unwrap_or_else(|_| self.config.workspace.clone());

        debug!(
            "Spawning {} sandbox in {}",
            self.config.python,
            workspace.display()
        );

        let mut child = Command::new(&self.config.python)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER)
            .arg(&workspace)
            .current_dir(&workspace)
            .env("MPLBACKEND", "Agg")
            .env("PYTHONIOENCODING", "utf-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::Spawn {
                python: self.config.python.clone(),
                message: e.to_string(),
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::Protocol("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::Protocol("stdout not captured".to_string()))?;

        self.process = Some(SandboxProcess {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        });

        // Empty exec as a readiness check
        match timeout(LIFECYCLE_TIMEOUT, self.exchange(&json!({"op": "exec", "code": ""}))).await {
            Ok(Ok(_)) => {
                info!("Sandbox is ready");
                Ok(())
            }
            Ok(Err(e)) => {
                self.kill().await;
                Err(SandboxError::Spawn {
                    python: self.config.python.clone(),
                    message: e.to_string(),
                })
            }
            Err(_) => {
                self.kill().await;
                Err(SandboxError::Spawn {
                    python: self.config.python.clone(),
                    message: "timed out waiting for the interpreter".to_string(),
                })
            }
        }
    }

    async fn kill(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.child.kill().await {
                debug!("Failed to kill sandbox process: {}", e);
            }
        }
    }

    /// Send one request and read lines until the marked response.
    async fn exchange(&mut self, request: &Value) -> Result<Value, SandboxError> {
        let process = self.process.as_mut().ok_or(SandboxError::Closed)?;

        let mut line = serde_json::to_string(request)
            .map_err(|e| SandboxError::Protocol(e.to_string()))?;
        line.push('\n');
        process.stdin.write_all(line.as_bytes()).await?;
        process.stdin.flush().await?;

        let mut stray = String::new();
        loop {
            let Some(line) = process.stdout.next_line().await? else {
                return Err(SandboxError::Closed);
            };

            // Output that bypassed the redirected sys.stdout, possibly without
            // a trailing newline so the marker lands mid-line
            let Some(at) = line.find(MARKER) else {
                stray.push_str(&line);
                stray.push('\n');
                continue;
            };
            stray.push_str(&line[..at]);
            let payload = &line[at + MARKER.len()..];

            let mut response: Value = serde_json::from_str(payload)
                .map_err(|e| SandboxError::Protocol(format!("bad response: {}", e)))?;

            if !stray.is_empty() {
                if let Some(stdout) = response.get_mut("stdout") {
                    let merged = format!("{}{}", stray, stdout.as_str().unwrap_or_default());
                    *stdout = Value::String(merged);
                }
            }

            return Ok(response);
        }
    }

    /// Like [`Self::exchange`] but restarts the process when the limit is hit.
    async fn exchange_with_timeout(&mut self, request: &Value) -> Result<Value, SandboxError> {
        let limit = self.config.exec_timeout;
        match timeout(limit, self.exchange(request)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Sandbox execution exceeded {}s, restarting",
                    limit.as_secs()
                );
                self.kill().await;
                self.spawn().await?;
                Err(SandboxError::Timeout(limit.as_secs()))
            }
        }
    }
}

#[async_trait]
impl CodeRunner for PythonSandbox {
    async fn run_code(&mut self, code: &str) -> Result<ExecOutput, SandboxError> {
        let response = self
            .exchange_with_timeout(&json!({"op": "exec", "code": code}))
            .await?;
        serde_json::from_value(response).map_err(|e| SandboxError::Protocol(e.to_string()))
    }

    async fn dataframe_summaries(&mut self) -> Result<Summaries, SandboxError> {
        let response = self
            .exchange_with_timeout(&json!({"op": "summaries"}))
            .await?;
        let parsed: SummariesResponse =
            serde_json::from_value(response).map_err(|e| SandboxError::Protocol(e.to_string()))?;
        Ok(parsed.summaries)
    }

    async fn restart(&mut self) -> Result<(), SandboxError> {
        info!("Restarting sandbox");
        self.kill().await;
        self.spawn().await
    }

    async fn shutdown(&mut self) -> Result<(), SandboxError> {
        let Some(mut process) = self.process.take() else {
            return Ok(());
        };

        let _ = process.stdin.write_all(b"{\"op\": \"shutdown\"}\n").await;
        let _ = process.stdin.flush().await;
        drop(process.stdin);

        match timeout(LIFECYCLE_TIMEOUT, process.child.wait()).await {
            Ok(Ok(status)) => debug!("Sandbox exited with {}", status),
            _ => {
                warn!("Sandbox did not exit, killing it");
                process.child.kill().await?;
            }
        }
        info!("Sandbox shutdown complete");
        Ok(())
    }
}
