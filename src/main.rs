//! Data Copilot - LLM-powered data analysis for CSV files
//!
//! A CLI tool that plans an analysis with a hosted LLM, runs the generated
//! pandas code in a persistent Python sandbox and writes a report.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (configuration, sandbox startup, report write, etc.)
//!   2 - At least one question ended without a usable answer

mod agent;
mod cli;
mod config;
mod llm;
mod models;
mod report;
mod sandbox;
mod state;

use agent::{Coordinator, CoordinatorSettings};
use anyhow::{Context, Result};
use cli::{Args, OutputFormat};
use config::{Config, CONFIG_FILE_NAME};
use llm::{LlmClient, LlmConfig, PromptLog};
use models::Outcome;
use sandbox::{CodeRunner, PythonSandbox, SandboxConfig};
use state::StateManager;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

/// Typing this at the interactive prompt ends the session.
const QUIT_COMMAND: &str = ":q";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    let (config, source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    };

    init_logging(args.log_level(config.general.verbose));

    info!("Data Copilot v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);
    source.log();

    match run_session(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Session failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .datacopilot.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to customize the model, sandbox limits and report options.");
    Ok(())
}

/// Initialize logging at `level`.
fn init_logging(level: tracing::Level) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

/// Run the whole session. Returns exit code (0 or 2).
async fn run_session(args: Args, config: Config) -> Result<i32> {
    let state = StateManager::new(&config.general.workspace)?;
    let sandbox_config = SandboxConfig {
        python: config.executor.python.clone(),
        workspace: state.workspace_dir().to_path_buf(),
        exec_timeout: Duration::from_secs(config.executor.exec_timeout_seconds),
    };

    if !args.quiet {
        println!("🐍 Starting Python sandbox ({})...", sandbox_config.python);
    }
    let sandbox = PythonSandbox::start(sandbox_config)
        .await
        .context("Failed to start the Python sandbox")?;

    if args.dry_run {
        return handle_dry_run(&args, state, Box::new(sandbox)).await;
    }

    let prompt_log = config
        .logging
        .log_prompts
        .then(|| PromptLog::new(&config.logging.prompt_log_path));
    if let Some(ref log) = prompt_log {
        info!("Logging prompts to {}", log.path().display());
    }

    let llm_config = LlmConfig {
        base_url: config.model.base_url.clone(),
        api_key: args.api_key.clone().unwrap_or_default(),
        model_name: config.model.name.clone(),
        temperature: config.model.temperature,
        timeout_seconds: config.model.timeout_seconds,
        retries: config.model.retries,
        show_progress: !args.quiet,
    };
    let client = LlmClient::new(llm_config, prompt_log).context("Failed to create LLM client")?;

    if !args.quiet {
        println!("🤖 Model: {} ({})", config.model.name, config.model.base_url);
        println!(
            "   Retries per step: {} | Re-plans per question: {}",
            config.executor.max_retries, config.executor.max_replans
        );
    }

    let settings = CoordinatorSettings {
        max_retries: config.executor.max_retries,
        max_replans: config.executor.max_replans,
        echo: !args.quiet,
    };
    let mut coordinator = Coordinator::new(Arc::new(client), Box::new(sandbox), state, settings);

    if !args.quiet {
        println!("\n📥 Loading {} CSV file(s)...", args.files.len());
    }
    let loaded = coordinator.load_csvs(&args.files).await;
    if loaded.is_empty() {
        warn!("No DataFrames were loaded; the planner will only see the notes");
    }
    if !args.quiet {
        println!("{}", coordinator.state().dataframe_summaries_for_display());
    }

    let output_path = report_path(&args, &config);
    let result = if args.is_interactive() {
        interactive_loop(&mut coordinator, &config, args.format, &output_path).await
    } else {
        run_queries(&mut coordinator, &args.queries, &config, args.format, &output_path).await
    };

    if let Err(e) = coordinator.shutdown().await {
        warn!("{:#}", e);
    }
    result?;

    let report = coordinator.session_report();
    let summary = &report.summary;
    println!("\n📊 Session Summary:");
    println!("   Questions: {}", summary.interactions);
    println!(
        "   - {} Answered: {} | {} Partial: {} | {} Failed: {}",
        Outcome::Answered.emoji(),
        summary.answered,
        Outcome::Partial.emoji(),
        summary.partial,
        Outcome::Failed.emoji(),
        summary.failed
    );
    println!("   Duration: {:.1}s", report.metadata.duration_seconds);

    if summary.interactions > 0 {
        println!("\n✅ Report saved to: {}", output_path.display());
    }

    if summary.failed > 0 {
        eprintln!(
            "\n⛔ {} question(s) ended without an answer. Failing (exit code 2).",
            summary.failed
        );
        return Ok(2);
    }

    Ok(0)
}

/// Answer every --query in order.
async fn run_queries(
    coordinator: &mut Coordinator,
    queries: &[String],
    config: &Config,
    format: OutputFormat,
    output_path: &Path,
) -> Result<()> {
    for query in queries {
        println!("\n[user]: {}", query);
        coordinator.run_analysis(query).await?;
        write_report(coordinator, config, format, output_path)?;
    }
    Ok(())
}

/// Read questions from stdin until `:q` or EOF.
async fn interactive_loop(
    coordinator: &mut Coordinator,
    config: &Config,
    format: OutputFormat,
    output_path: &Path,
) -> Result<()> {
    println!("\nAsk a question about your data. Type `{}` to quit.", QUIT_COMMAND);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\n[user]: ");
        std::io::stdout().flush().context("Failed to flush stdout")?;

        let Some(line) = lines.next_line().await.context("Failed to read stdin")? else {
            println!();
            break;
        };
        let query = line.trim();

        if query == QUIT_COMMAND {
            break;
        }
        if query.is_empty() {
            println!("please input a valid question.");
            continue;
        }

        coordinator.run_analysis(query).await?;
        write_report(coordinator, config, format, output_path)?;
    }

    Ok(())
}

/// Rewrite the session report.
fn write_report(
    coordinator: &Coordinator,
    config: &Config,
    format: OutputFormat,
    path: &Path,
) -> Result<()> {
    let report = coordinator.session_report();
    let output = match format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report, &config.report),
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, &output)
        .with_context(|| format!("Failed to write report to {}", path.display()))?;
    debug!("Report written to {}", path.display());
    Ok(())
}

/// Report location; a default Markdown name becomes `.json` for JSON output.
fn report_path(args: &Args, config: &Config) -> PathBuf {
    let path = PathBuf::from(&config.general.output);
    if args.output.is_none() && args.format == OutputFormat::Json {
        return path.with_extension("json");
    }
    path
}

/// Handle --dry-run: load the CSVs, print DataFrame summaries, exit.
async fn handle_dry_run(
    args: &Args,
    mut state: StateManager,
    mut runner: Box<dyn CodeRunner>,
) -> Result<i32> {
    println!("\n🔍 Dry run: loading CSV files (no LLM call)...\n");

    let loaded = agent::load_dataframes(runner.as_mut(), &mut state, &args.files).await;
    println!(
        "   Loaded {} of {} file(s) into DataFrames: {}",
        loaded.len(),
        args.files.len(),
        loaded.join(", ")
    );
    for note in state.notes() {
        println!("   ⚠️  {}", note);
    }
    println!("\n{}", state.dataframe_summaries_for_display());

    if let Err(e) = runner.shutdown().await {
        warn!("Failed to shut down the sandbox: {}", e);
    }

    println!("\n✅ Dry run complete. No LLM calls were made.");
    Ok(0)
}

/// Where the configuration came from. Logged once logging is set up.
#[derive(Debug)]
enum ConfigSource {
    File(PathBuf),
    Defaults,
    Unreadable(anyhow::Error),
}

impl ConfigSource {
    fn log(&self) {
        match self {
            ConfigSource::File(path) => info!("Loaded config from {}", path.display()),
            ConfigSource::Defaults => debug!("No config file found, using defaults"),
            ConfigSource::Unreadable(e) => warn!("Failed to load config: {:#}", e),
        }
    }
}

/// Load the config file, apply CLI overrides and validate the result.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    let (mut config, source) = if let Some(ref config_path) = args.config {
        (
            Config::load(config_path)?,
            ConfigSource::File(config_path.clone()),
        )
    } else {
        match Config::load_default() {
            Ok(Some(config)) => (config, ConfigSource::File(PathBuf::from(CONFIG_FILE_NAME))),
            Ok(None) => (Config::default(), ConfigSource::Defaults),
            Err(e) => (Config::default(), ConfigSource::Unreadable(e)),
        }
    };

    config.merge_with_args(args);
    config.validate()?;
    Ok((config, source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_report_path_follows_format() {
        let config = Config::default();

        let args = Args::parse_from(["datacopilot", "sales.csv", "--format", "json"]);
        assert_eq!(report_path(&args, &config), PathBuf::from("datacopilot_report.json"));

        let args = Args::parse_from(["datacopilot", "sales.csv"]);
        assert_eq!(report_path(&args, &config), PathBuf::from("datacopilot_report.md"));

        let mut config = Config::default();
        config.general.output = "out/custom.txt".to_string();
        let args = Args::parse_from([
            "datacopilot",
            "sales.csv",
            "--format",
            "json",
            "-o",
            "out/custom.txt",
        ]);
        assert_eq!(report_path(&args, &config), PathBuf::from("out/custom.txt"));
    }

    #[test]
    fn test_config_verbose_raises_log_level() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("copilot.toml");
        std::fs::write(&path, "[general]\nverbose = true\n").unwrap();
        let path = path.display().to_string();

        let args = Args::parse_from(["datacopilot", "sales.csv", "--config", &path]);
        let (config, source) = load_config(&args).unwrap();
        assert!(config.general.verbose);
        assert!(matches!(source, ConfigSource::File(_)));
        assert_eq!(args.log_level(config.general.verbose), tracing::Level::DEBUG);

        let args = Args::parse_from(["datacopilot", "sales.csv", "--config", &path, "--quiet"]);
        let (config, _) = load_config(&args).unwrap();
        assert_eq!(args.log_level(config.general.verbose), tracing::Level::ERROR);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("copilot.toml");
        std::fs::write(&path, "[executor]\nmax_retries = 0\n").unwrap();
        let path = path.display().to_string();

        let args = Args::parse_from(["datacopilot", "sales.csv", "--config", &path]);
        let message = format!("{:#}", load_config(&args).unwrap_err());
        assert!(message.contains("executor.max_retries"));
    }
}
