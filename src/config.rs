//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.datacopilot.toml` files.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the configuration file looked up in the current directory.
pub const CONFIG_FILE_NAME: &str = ".datacopilot.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Executor and sandbox settings.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Report settings.
    #[serde(default)]
    pub report: ReportConfig,

    /// Prompt logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default output file path.
    #[serde(default = "default_output")]
    pub output: String,

    /// Directory the CSV files are copied into and code runs in.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            workspace: default_workspace(),
            verbose: false,
        }
    }
}

fn default_output() -> String {
    "datacopilot_report.md".to_string()
}

fn default_workspace() -> PathBuf {
    PathBuf::from("./workspace")
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model name sent with each request.
    #[serde(default = "default_model")]
    pub name: String,

    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Number of retries on transport errors and 429/5xx responses.
    #[serde(default = "default_retries")]
    pub retries: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            base_url: default_base_url(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
            retries: default_retries(),
        }
    }
}

fn default_model() -> String {
    "qwen3-max".to_string()
}

fn default_base_url() -> String {
    "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string()
}

fn default_temperature() -> f32 {
    0.0
}

fn default_timeout() -> u64 {
    120
}

fn default_retries() -> usize {
    2
}

/// Executor and sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Python interpreter used for the sandbox.
    #[serde(default = "default_python")]
    pub python: String,

    /// Seconds a single code execution may run.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_seconds: u64,

    /// Attempts the executor makes per step before reporting failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Times the coordinator may replace a plan within one analysis.
    #[serde(default = "default_max_replans")]
    pub max_replans: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            exec_timeout_seconds: default_exec_timeout(),
            max_retries: default_max_retries(),
            max_replans: default_max_replans(),
        }
    }
}

fn default_python() -> String {
    "python3".to_string()
}

fn default_exec_timeout() -> u64 {
    60
}

fn default_max_retries() -> usize {
    3
}

fn default_max_replans() -> usize {
    3
}

/// Report generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Include each step's code in the report.
    #[serde(default = "default_true")]
    pub include_code: bool,

    /// Append the full executed script.
    #[serde(default = "default_true")]
    pub include_full_script: bool,

    /// Step output longer than this is truncated in the report.
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            include_code: true,
            include_full_script: true,
            max_output_chars: default_max_output_chars(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_output_chars() -> usize {
    4000
}

/// Prompt log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Append every prompt sent to the model to `prompt_log_path`.
    #[serde(default)]
    pub log_prompts: bool,

    #[serde(default = "default_prompt_log_path")]
    pub prompt_log_path: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_prompts: false,
            prompt_log_path: default_prompt_log_path(),
        }
    }
}

fn default_prompt_log_path() -> PathBuf {
    PathBuf::from("logs/prompts.log")
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(CONFIG_FILE_NAME);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// Flags without a CLI default only override when given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref base_url) = args.base_url {
            self.model.base_url = base_url.clone();
        }
        if let Some(temperature) = args.temperature {
            self.model.temperature = temperature;
        }
        if let Some(timeout) = args.timeout {
            self.model.timeout_seconds = timeout;
        }

        if let Some(ref python) = args.python {
            self.executor.python = python.clone();
        }
        if let Some(exec_timeout) = args.exec_timeout {
            self.executor.exec_timeout_seconds = exec_timeout;
        }
        if let Some(max_retries) = args.max_retries {
            self.executor.max_retries = max_retries;
        }
        if let Some(max_replans) = args.max_replans {
            self.executor.max_replans = max_replans;
        }

        if let Some(ref workspace) = args.workspace {
            self.general.workspace = workspace.clone();
        }
        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }

        if let Some(ref prompt_log) = args.prompt_log {
            self.logging.log_prompts = true;
            self.logging.prompt_log_path = prompt_log.clone();
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.executor.max_retries == 0 {
            bail!("executor.max_retries must be at least 1");
        }
        if self.executor.exec_timeout_seconds == 0 {
            bail!("executor.exec_timeout_seconds must be at least 1");
        }
        if self.executor.python.trim().is_empty() {
            bail!("executor.python must name an interpreter");
        }
        if self.model.timeout_seconds == 0 {
            bail!("model.timeout_seconds must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            bail!(
                "model.temperature must be between 0 and 2, got {}",
                self.model.temperature
            );
        }
        if self.model.name.trim().is_empty() {
            bail!("model.name must not be empty");
        }
        if !self.model.base_url.starts_with("http://") && !self.model.base_url.starts_with("https://")
        {
            bail!(
                "model.base_url must be an http(s) URL, got '{}'",
                self.model.base_url
            );
        }
        if self.report.max_output_chars == 0 {
            bail!("report.max_output_chars must be at least 1");
        }
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
