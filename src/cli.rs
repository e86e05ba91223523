//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// Data Copilot - LLM-powered data analysis for CSV files
///
/// Ask questions about your CSV data in plain language. A planner breaks
/// the question into steps, an executor writes and runs pandas code for
/// each step, and the answer is written to a Markdown or JSON report.
///
/// Examples:
///   datacopilot sales.csv -q "Total revenue per region in 2023?"
///   datacopilot sales.csv customers.csv
///   datacopilot sales.csv --dry-run
///   datacopilot --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// CSV files to load into the workspace
    #[arg(value_name = "CSV", required_unless_present = "init_config")]
    pub files: Vec<PathBuf>,

    /// Question to answer (repeatable)
    ///
    /// Without --query an interactive prompt is started; type `:q` to quit.
    #[arg(short, long = "query", value_name = "TEXT")]
    pub queries: Vec<String>,

    /// Model name for the OpenAI-compatible API
    #[arg(short, long, env = "DATACOPILOT_MODEL")]
    pub model: Option<String>,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, value_name = "URL", env = "DATACOPILOT_BASE_URL")]
    pub base_url: Option<String>,

    /// API key for the model provider
    #[arg(long, env = "DASHSCOPE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Output file path for the report
    ///
    /// Defaults to the config value (datacopilot_report.md).
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .datacopilot.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(long)]
    pub quiet: bool,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Temperature for LLM responses (0.0 - 2.0)
    #[arg(long)]
    pub temperature: Option<f32>,

    /// LLM request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Python interpreter for the sandbox
    #[arg(long, value_name = "PATH")]
    pub python: Option<String>,

    /// Workspace directory the CSV files are copied into
    #[arg(long, value_name = "DIR")]
    pub workspace: Option<PathBuf>,

    /// Attempts per step before the executor gives up
    #[arg(long, value_name = "NUM")]
    pub max_retries: Option<usize>,

    /// Plan replacements allowed per question
    #[arg(long, value_name = "NUM")]
    pub max_replans: Option<usize>,

    /// Seconds a single code execution may run
    #[arg(long, value_name = "SECS")]
    pub exec_timeout: Option<u64>,

    /// Append every prompt sent to the model to this file
    #[arg(long, value_name = "FILE")]
    pub prompt_log: Option<PathBuf>,

    /// Dry run: load the CSV files and print DataFrame summaries without calling the LLM
    #[arg(long)]
    pub dry_run: bool,

    /// Generate a default .datacopilot.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if self.files.is_empty() {
            return Err("At least one CSV file is required".to_string());
        }

        for file in &self.files {
            if !file.is_file() {
                return Err(format!("CSV file does not exist: {}", file.display()));
            }
            let is_csv = file
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
            if !is_csv {
                return Err(format!("Not a CSV file: {}", file.display()));
            }
        }

        if let Some(ref base_url) = self.base_url {
            if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                return Err("Base URL must start with 'http://' or 'https://'".to_string());
            }
        }

        // The API key is only needed once the model is called
        if !self.dry_run && self.api_key.as_deref().map_or(true, str::is_empty) {
            return Err(
                "An API key is required: pass --api-key or set DASHSCOPE_API_KEY".to_string(),
            );
        }

        if let Some(temperature) = self.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err("Temperature must be between 0.0 and 2.0".to_string());
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }
        if self.exec_timeout == Some(0) {
            return Err("Execution timeout must be at least 1 second".to_string());
        }
        if self.max_retries == Some(0) {
            return Err("Max retries must be at least 1".to_string());
        }

        if self.queries.iter().any(|q| q.trim().is_empty()) {
            return Err("Queries must not be empty".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings. `config_verbose`
    /// is `general.verbose` from the config file; `--quiet` wins over both.
    pub fn log_level(&self, config_verbose: bool) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose || config_verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }

    /// True when no --query was given and questions come from stdin.
    pub fn is_interactive(&self) -> bool {
        self.queries.is_empty()
    }
}
