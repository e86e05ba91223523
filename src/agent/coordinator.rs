//! Coordinator: drives plans through the executor and judges the results.

use crate::agent::executor::{sync_summaries, Executor, ExecutorSettings, StepOutcome};
use crate::agent::planner::{format_plan, Planner};
use crate::agent::prompts::evaluation_prompt;
use crate::llm::ChatModel;
use crate::models::{
    Interaction, Outcome, Plan, Report, ReportMetadata, SessionSummary, StepStatus,
};
use crate::sandbox::CodeRunner;
use crate::state::StateManager;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Step output passed to the evaluation prompt is cut to this many chars.
const EVALUATION_OUTPUT_CHARS: usize = 2000;

/// Settings for [`Coordinator`].
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_retries: usize,
    pub max_replans: usize,
    /// Print plans, code, results and answers to stdout.
    pub echo: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_replans: 3,
            echo: false,
        }
    }
}

/// Verdict of the goal evaluation.
#[derive(Debug, Clone, PartialEq)]
enum Evaluation {
    Satisfied(String),
    Missing {
        answer: Option<String>,
        missing: String,
    },
    Unavailable(String),
}

pub struct Coordinator {
    model: Arc<dyn ChatModel>,
    planner: Planner,
    executor: Executor,
    runner: Box<dyn CodeRunner>,
    state: StateManager,
    settings: CoordinatorSettings,
    session_started: DateTime<Utc>,
}

impl Coordinator {
    pub fn new(
        model: Arc<dyn ChatModel>,
        runner: Box<dyn CodeRunner>,
        state: StateManager,
        settings: CoordinatorSettings,
    ) -> Self {
        let executor = Executor::new(
            model.clone(),
            ExecutorSettings {
                max_retries: settings.max_retries,
                echo: settings.echo,
            },
        );
        Self {
            planner: Planner::new(model.clone()),
            executor,
            model,
            runner,
            state,
            settings,
            session_started: Utc::now(),
        }
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    /// Copy CSVs into the workspace and load each into a DataFrame.
    ///
    /// Returns the names of the DataFrames that loaded.
    pub async fn load_csvs(&mut self, paths: &[PathBuf]) -> Vec<String> {
        load_dataframes(self.runner.as_mut(), &mut self.state, paths).await
    }

    /// Answer one query: plan, execute, re-plan on failure, evaluate.
    pub async fn run_analysis(&mut self, query: &str) -> Result<Interaction> {
        info!("Starting analysis: {}", query);
        self.state.start_new_interaction(query);

        let plan = self
            .planner
            .generate_plan(query, &self.state.planner_context())
            .await;
        let planning_failed = self.adopt_plan(plan)?;
        if planning_failed {
            warn!("Planning failed, aborting this query");
            return self.finish(None, Outcome::Failed);
        }

        let mut replans = 0;
        let mut step_index = 0;

        let (answer, outcome) = loop {
            let next_step = self
                .state
                .plan()
                .and_then(|p| p.steps.get(step_index))
                .cloned();

            let Some(step) = next_step else {
                match self.evaluate(query).await {
                    Evaluation::Satisfied(answer) => break (Some(answer), Outcome::Answered),
                    Evaluation::Unavailable(reason) => {
                        warn!("Goal evaluation unavailable: {}", reason);
                        break (None, Outcome::Partial);
                    }
                    Evaluation::Missing { answer, missing } => {
                        info!("Goal not yet satisfied: {}", missing);
                        if replans >= self.settings.max_replans {
                            warn!("Re-plan budget exhausted, keeping the best available answer");
                            break (answer, Outcome::Partial);
                        }
                        replans += 1;
                        self.set_replans(replans);
                        let plan = self
                            .planner
                            .replan(
                                query,
                                &self.state.planner_context(),
                                "Evaluate whether the results answer the request",
                                &missing,
                            )
                            .await;
                        if self.adopt_plan(plan)? {
                            break (answer, Outcome::Partial);
                        }
                        step_index = 0;
                        continue;
                    }
                }
            };

            if self.settings.echo {
                println!("\n[Step {}]: {}", step.step_id, step.task);
            }
            self.state
                .update_plan_step_status(step.step_id, StepStatus::InProgress);
            let context = self.state.worker_context(&step);

            let result = self
                .executor
                .execute_task(&step.task, &context, self.runner.as_mut(), &mut self.state)
                .await;

            match result {
                StepOutcome::Success { code, output } => {
                    self.state
                        .add_executed_code_block(&code, Some(step.step_id), &output);
                    self.state
                        .update_plan_step_status(step.step_id, StepStatus::Completed);
                    if !output.trim().is_empty() {
                        if let Some(interaction) = self.state.current_interaction_mut() {
                            interaction.last_result = Some(output);
                        }
                    }
                    step_index += 1;
                }
                StepOutcome::FinalAnswer { answer } => {
                    self.state
                        .update_plan_step_status(step.step_id, StepStatus::Completed);
                    break (Some(answer), Outcome::Answered);
                }
                StepOutcome::Failed { task, error } => {
                    self.state
                        .update_plan_step_status(step.step_id, StepStatus::Failed);
                    warn!("Step {} failed: {}", step.step_id, error);
                    if replans >= self.settings.max_replans {
                        warn!("Re-plan budget exhausted");
                        break (None, Outcome::Failed);
                    }
                    replans += 1;
                    self.set_replans(replans);
                    let plan = self
                        .planner
                        .replan(query, &self.state.planner_context(), &task, &error)
                        .await;
                    if self.adopt_plan(plan)? {
                        break (None, Outcome::Failed);
                    }
                    step_index = 0;
                }
            }
        };

        self.finish(answer, outcome)
    }

    /// Close the sandbox.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.runner
            .shutdown()
            .await
            .context("Failed to shut down the Python sandbox")
    }

    /// Report covering every interaction of the session.
    pub fn session_report(&self) -> Report {
        let interactions = self.state.interactions().to_vec();
        let elapsed = Utc::now() - self.session_started;
        Report {
            metadata: ReportMetadata {
                analysis_date: Utc::now(),
                model_used: self.model.model_name().to_string(),
                datasets: self.state.loaded_files().to_vec(),
                duration_seconds: elapsed.num_milliseconds() as f64 / 1000.0,
            },
            dataframes: self.state.dataframe_summaries().clone(),
            summary: SessionSummary::from_interactions(&interactions),
            interactions,
            executed_code: self.state.executed_code_blocks().to_vec(),
        }
    }

    /// Install `plan` on the current interaction. Returns true if it is the
    /// planning-failure fallback.
    ///
    /// The fallback only replaces an empty plan, so a failed re-plan leaves
    /// the last real plan and its results in place.
    fn adopt_plan(&mut self, plan: Plan) -> Result<bool> {
        let failed = plan.is_planning_failure();
        let has_plan = self.state.plan().is_some_and(|p| !p.is_empty());
        if failed && has_plan {
            warn!("Re-planning failed, keeping the previous plan");
            self.state
                .add_note("Re-planning failed; the previous plan was kept.");
            return Ok(true);
        }

        if self.settings.echo {
            println!("\n{}", format_plan(&plan));
        }
        self.state.set_plan(plan)?;
        Ok(failed)
    }

    fn set_replans(&mut self, replans: usize) {
        if let Some(interaction) = self.state.current_interaction_mut() {
            interaction.replans = replans;
        }
    }

    async fn evaluate(&self, query: &str) -> Evaluation {
        let step_results = self
            .state
            .current_interaction()
            .map(|interaction| {
                let earlier = interaction.previous_plans.iter().enumerate().flat_map(
                    |(i, plan)| {
                        plan.steps
                            .iter()
                            .filter(|step| step.result.is_some())
                            .map(move |step| (format!("Earlier plan {}, ", i + 1), step))
                    },
                );
                let current = interaction
                    .plan
                    .steps
                    .iter()
                    .map(|step| (String::new(), step));

                earlier
                    .chain(current)
                    .map(|(label, step)| {
                        let output = step.result.as_deref().unwrap_or("(no output)");
                        format!(
                            "{}Step {} ({}): {}\nOutput:\n{}",
                            label,
                            step.step_id,
                            step.status,
                            step.task,
                            truncate(output, EVALUATION_OUTPUT_CHARS)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n")
            })
            .unwrap_or_default();

        let prompt = evaluation_prompt(query, &step_results);
        match self.model.complete_json("evaluation", &prompt).await {
            Ok(response) => parse_evaluation(&response),
            Err(e) => Evaluation::Unavailable(e.to_string()),
        }
    }

    fn finish(&mut self, answer: Option<String>, outcome: Outcome) -> Result<Interaction> {
        self.state.finish_interaction(answer, outcome);
        let interaction = self
            .state
            .current_interaction()
            .cloned()
            .context("Interaction vanished while finishing")?;

        info!(
            "Analysis finished: {} in {:.1}s",
            interaction.outcome, interaction.duration_seconds
        );
        if self.settings.echo {
            self.print_results(&interaction);
        }
        Ok(interaction)
    }

    fn print_results(&self, interaction: &Interaction) {
        println!(
            "\n{} {}",
            interaction.outcome.emoji(),
            interaction.outcome
        );
        if let Some(ref answer) = interaction.answer {
            println!("\n[Answer]:\n{}", answer);
        }
        if let Some(ref last) = interaction.last_result {
            println!("\n[Last Result]:\n{}", last.trim_end());
        }
        let script = self.state.executed_code_blocks().join("\n\n");
        if !script.is_empty() {
            println!("\n[Full Script]:\n```python\n{}\n```", script);
        }
    }
}

/// Copy CSVs into the workspace and read each into a DataFrame in the sandbox.
///
/// Load failures become notes for the planner. Returns the DataFrame names
/// that loaded.
pub async fn load_dataframes(
    runner: &mut dyn CodeRunner,
    state: &mut StateManager,
    paths: &[PathBuf],
) -> Vec<String> {
    let copied = state.load_csvs(paths);
    let mut loaded = Vec::new();

    for file in copied {
        let name = dataframe_name_for(&file);
        let code = format!(
            "import pandas as pd\n{} = pd.read_csv('{}')",
            name,
            file.replace('\\', "\\\\").replace('\'', "\\'")
        );

        let failure = match runner.run_code(&code).await {
            Ok(output) if !output.is_error() => {
                debug!("Loaded {} as `{}`", file, name);
                state.add_executed_code_block(&code, None, &output.stdout);
                loaded.push(name);
                continue;
            }
            Ok(output) => output.stderr.trim().to_string(),
            Err(e) => e.to_string(),
        };

        warn!("Failed to load {}: {}", file, failure);
        state.add_note(format!(
            "I tried to load the file '{}' but failed. Error: {}",
            file, failure
        ));
    }

    sync_summaries(runner, state).await;
    loaded
}

/// Python variable name for a CSV file: `sales-2024.csv` → `sales_2024`.
pub fn dataframe_name_for(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);

    let mut name: String = stem
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    match name.chars().next() {
        None => name.push_str("df"),
        Some(first) if !(first.is_alphabetic() || first == '_') => name.insert(0, '_'),
        Some(_) => {}
    }
    name
}

fn parse_evaluation(response: &Value) -> Evaluation {
    let satisfied = match response.get("satisfied") {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    };
    let answer = response
        .get("answer")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from);
    let missing = response
        .get("missing")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from);

    match (satisfied, answer) {
        (true, Some(answer)) => Evaluation::Satisfied(answer),
        (true, None) => Evaluation::Missing {
            answer: None,
            missing: "The results were judged sufficient but no answer was written.".to_string(),
        },
        (false, answer) => Evaluation::Missing {
            answer,
            missing: missing
                .unwrap_or_else(|| "The results do not answer the request yet.".to_string()),
        },
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}\n... (truncated)", &text[..idx]),
        None => text.to_string(),
    }
}
