//! Session state.
//!
//! `StateManager` is the session's memory: the workspace directory, every
//! interaction with its plan, the history of successfully executed code and
//! the latest DataFrame summaries. It also assembles the context strings
//! handed to the planner and the executor.

use crate::models::{
    DataFrameSummary, Interaction, Outcome, Plan, PlanStep, StepStatus, Summaries,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub struct StateManager {
    workspace_dir: PathBuf,
    interactions: Vec<Interaction>,
    executed_code_blocks: Vec<String>,
    dataframe_summaries: Summaries,
    notes: Vec<String>,
    loaded_files: Vec<String>,
}

impl StateManager {
    /// Create the state, making sure the workspace directory exists.
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Result<Self> {
        let workspace_dir = workspace_dir.into();
        std::fs::create_dir_all(&workspace_dir).with_context(|| {
            format!(
                "Failed to create workspace directory {}",
                workspace_dir.display()
            )
        })?;

        Ok(Self {
            workspace_dir,
            interactions: Vec::new(),
            executed_code_blocks: Vec::new(),
            dataframe_summaries: Summaries::new(),
            notes: Vec::new(),
            loaded_files: Vec::new(),
        })
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// Copy CSV files into the workspace.
    ///
    /// Missing files and non-CSV paths are skipped with a warning.
    /// Returns the file names that were copied.
    pub fn load_csvs(&mut self, paths: &[PathBuf]) -> Vec<String> {
        let mut copied = Vec::new();

        for path in paths {
            let is_csv = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                warn!("Skipping path without a file name: {}", path.display());
                continue;
            };

            if !path.is_file() || !is_csv {
                warn!(
                    "File not found or not a CSV, skipping: {}",
                    path.display()
                );
                continue;
            }

            let target = self.workspace_dir.join(file_name);
            match std::fs::copy(path, &target) {
                Ok(bytes) => {
                    debug!("Copied {} ({} bytes) to workspace", file_name, bytes);
                    if !self.loaded_files.iter().any(|f| f == file_name) {
                        self.loaded_files.push(file_name.to_string());
                    }
                    copied.push(file_name.to_string());
                }
                Err(e) => warn!("Error loading file {}: {}", path.display(), e),
            }
        }

        copied
    }

    /// CSV files copied into the workspace so far.
    pub fn loaded_files(&self) -> &[String] {
        &self.loaded_files
    }

    /// Start a new interaction for `query`.
    pub fn start_new_interaction(&mut self, query: &str) {
        self.interactions.push(Interaction::new(query));
    }

    pub fn interactions(&self) -> &[Interaction] {
        &self.interactions
    }

    pub fn current_interaction(&self) -> Option<&Interaction> {
        self.interactions.last()
    }

    pub fn current_interaction_mut(&mut self) -> Option<&mut Interaction> {
        self.interactions.last_mut()
    }

    /// Set the plan of the current interaction. A non-empty plan it replaces
    /// is kept in `previous_plans`.
    pub fn set_plan(&mut self, plan: Plan) -> Result<()> {
        let Some(interaction) = self.interactions.last_mut() else {
            bail!("Cannot set plan without an active interaction");
        };
        let previous = std::mem::replace(&mut interaction.plan, plan);
        if !previous.is_empty() {
            interaction.previous_plans.push(previous);
        }
        Ok(())
    }

    /// Plan of the current interaction.
    pub fn plan(&self) -> Option<&Plan> {
        self.interactions.last().map(|i| &i.plan)
    }

    /// Close the current interaction with its answer and outcome.
    pub fn finish_interaction(&mut self, answer: Option<String>, outcome: Outcome) {
        let Some(interaction) = self.interactions.last_mut() else {
            warn!("finish_interaction called without an active interaction");
            return;
        };
        if answer.is_some() {
            interaction.answer = answer;
        }
        interaction.outcome = outcome;
        let elapsed = Utc::now() - interaction.started_at;
        interaction.duration_seconds = elapsed.num_milliseconds() as f64 / 1000.0;
    }

    pub fn update_plan_step_status(&mut self, step_id: u32, status: StepStatus) {
        if let Some(step) = self
            .interactions
            .last_mut()
            .and_then(|i| i.plan.step_mut(step_id))
        {
            step.status = status;
        }
    }

    /// Record successfully executed code.
    ///
    /// The code always joins the flat history; with a `step_id` it is also
    /// stored on the matching step of the current plan.
    pub fn add_executed_code_block(&mut self, code: &str, step_id: Option<u32>, result: &str) {
        self.executed_code_blocks.push(code.to_string());

        let Some(step_id) = step_id else {
            return;
        };
        if let Some(step) = self
            .interactions
            .last_mut()
            .and_then(|i| i.plan.step_mut(step_id))
        {
            step.code = Some(code.to_string());
            step.result = Some(result.to_string());
        }
    }

    pub fn executed_code_blocks(&self) -> &[String] {
        &self.executed_code_blocks
    }

    /// Add a note the planner should know about.
    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }

    /// Replace the DataFrame summaries entirely.
    pub fn update_all_dataframe_summaries(&mut self, summaries: Summaries) {
        self.dataframe_summaries = summaries;
    }

    pub fn dataframe_summaries(&self) -> &Summaries {
        &self.dataframe_summaries
    }

    /// Files currently in the workspace, relative and sorted.
    pub fn workspace_files(&self) -> Vec<String> {
        let mut files: Vec<String> = WalkDir::new(&self.workspace_dir)
            .min_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.workspace_dir)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        files.sort();
        files
    }

    /// Context for the planner: history, current query, files, notes, DataFrames.
    pub fn planner_context(&self) -> String {
        let mut parts = Vec::new();

        if self.interactions.len() > 1 {
            parts.push("**Previous Interactions History:**".to_string());
            let previous = &self.interactions[..self.interactions.len() - 1];
            for (i, interaction) in previous.iter().enumerate() {
                parts.push(format!("\n--- Turn {} ---", i + 1));
                parts.push(format!("User Query: {}", interaction.query));

                let plan_summary = interaction
                    .plan
                    .steps
                    .iter()
                    .map(|s| format!("  - Step {}: {}", s.step_id, s.task))
                    .collect::<Vec<_>>()
                    .join("\n");
                parts.push(format!("Plan:\n{}", plan_summary));

                let executed = interaction
                    .executed_steps()
                    .filter_map(|s| s.code.as_deref())
                    .map(|code| format!("```python\n{}\n```", code))
                    .collect::<Vec<_>>()
                    .join("\n");
                if !executed.is_empty() {
                    parts.push(format!("Executed Code:\n{}", executed));
                }

                if let Some(ref answer) = interaction.answer {
                    parts.push(format!("Answer: {}", answer));
                }
            }
            parts.push(format!("\n{}\n", "=".repeat(20)));
        }

        if let Some(current) = self.interactions.last() {
            parts.push(format!("**Current User Query:**\n{}", current.query));
        }

        parts.push(format!("\n**Workspace Files:**\n{}", self.files_block()));

        if !self.notes.is_empty() {
            parts.push("\n**Notes:**".to_string());
            parts.extend(self.notes.iter().map(|n| format!("- {}", n)));
        }

        if !self.dataframe_summaries.is_empty() {
            parts.push("\n**DataFrame Summaries in Sandbox:**".to_string());
            parts.push(self.summaries_block());
        }

        parts.join("\n")
    }

    /// Context for the executor working on `current_step`.
    pub fn worker_context(&self, current_step: &PlanStep) -> String {
        let Some(interaction) = self.interactions.last() else {
            return "Error: No active interaction.".to_string();
        };

        let mut parts = Vec::new();

        parts.push(format!("**User's Current Goal:**\n{}", interaction.query));

        let plan_lines = interaction
            .plan
            .steps
            .iter()
            .map(|step| {
                let prefix = if step.step_id == current_step.step_id {
                    "==>"
                } else {
                    "   "
                };
                format!(
                    "{} Step {} ({}): {}",
                    prefix, step.step_id, step.status, step.task
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        parts.push(format!(
            "\n**Full Plan (you are on Step {}):**\n{}",
            current_step.step_id, plan_lines
        ));

        if self.executed_code_blocks.is_empty() {
            parts.push("\n**Code Executed So Far:**\nNo code has been executed yet.".to_string());
        } else {
            let history = self
                .executed_code_blocks
                .iter()
                .map(|code| format!("```python\n{}\n```", code))
                .collect::<Vec<_>>()
                .join("\n");
            parts.push(format!(
                "\n**Code Executed So Far (Across All Interactions):**\n\
                 The following code blocks have been successfully executed in the sandbox. \
                 Do not repeat them. You can assume their variables (e.g., DataFrames) are available.\n{}",
                history
            ));
        }

        parts.push(format!("\n**Workspace Files:**\n{}", self.files_block()));

        if !self.dataframe_summaries.is_empty() {
            parts.push("\n**Current DataFrame Summaries in Sandbox:**".to_string());
            parts.push(self.summaries_block());
        }

        parts.join("\n")
    }

    /// DataFrame summaries formatted for the terminal.
    pub fn dataframe_summaries_for_display(&self) -> String {
        if self.dataframe_summaries.is_empty() {
            return "No data loaded yet.".to_string();
        }

        let mut output = vec!["Data loaded successfully. Here are the summaries:".to_string()];
        for (name, summary) in &self.dataframe_summaries {
            output.push(format!("\n--- DataFrame: {} ---", name));
            output.push(
                serde_json::to_string_pretty(summary).unwrap_or_else(|e| format!("<{}>", e)),
            );
        }
        output.join("\n")
    }

    fn files_block(&self) -> String {
        self.workspace_files()
            .iter()
            .map(|f| format!("`{}`", f))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn summaries_block(&self) -> String {
        self.dataframe_summaries
            .iter()
            .map(|(name, summary)| format!("- `{}`:\n{}\n", name, format_summary_for_llm(summary)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One DataFrame summary as context text.
fn format_summary_for_llm(summary: &DataFrameSummary) -> String {
    match summary {
        DataFrameSummary::Error { error } => format!("  - Error fetching summary: {}", error),
        DataFrameSummary::Table(table) => {
            let columns = table
                .columns
                .iter()
                .map(|(name, dtype)| format!("{} ({})", name, dtype))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "  - Shape: ({}, {})\n  - Columns: [{}]\n  - Head Sample:\n```csv\n{}```",
                table.shape.0, table.shape.1, columns, table.head_sample
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TableSummary;
    use tempfile::TempDir;

    fn sales_summary() -> Summaries {
        let mut summaries = Summaries::new();
        summaries.insert(
            "sales".to_string(),
            DataFrameSummary::Table(TableSummary {
                shape: (120, 2),
                columns: vec![
                    ("region".to_string(), "object".to_string()),
                    ("amount".to_string(), "float64".to_string()),
                ],
                head_sample: "region,amount\nnorth,1.5\n".to_string(),
            }),
        );
        summaries
    }

    fn state_in(dir: &TempDir) -> StateManager {
        StateManager::new(dir.path().join("workspace")).unwrap()
    }

    #[test]
    fn test_load_csvs_copies_and_skips() {
        let dir = TempDir::new().unwrap();
        let csv = dir.path().join("sales.csv");
        let txt = dir.path().join("notes.txt");
        std::fs::write(&csv, "region,amount\n").unwrap();
        std::fs::write(&txt, "nope").unwrap();

        let mut state = state_in(&dir);
        let copied = state.load_csvs(&[csv, txt, dir.path().join("missing.csv")]);

        assert_eq!(copied, vec!["sales.csv".to_string()]);
        assert!(state.workspace_dir().join("sales.csv").exists());
        assert_eq!(state.workspace_files(), vec!["sales.csv".to_string()]);
        assert_eq!(state.loaded_files(), &["sales.csv".to_string()]);
    }

    #[test]
    fn test_set_plan_requires_interaction() {
        let dir = TempDir::new().unwrap();
        let mut state = state_in(&dir);
        assert!(state.set_plan(Plan::default()).is_err());

        state.start_new_interaction("q");
        assert!(state.set_plan(Plan::new(vec![PlanStep::new(1, "a")])).is_ok());
        assert_eq!(state.plan().map(|p| p.len()), Some(1));
    }

    #[test]
    fn test_set_plan_keeps_replaced_plan() {
        let dir = TempDir::new().unwrap();
        let mut state = state_in(&dir);
        state.start_new_interaction("q");
        state.set_plan(Plan::new(vec![PlanStep::new(1, "mean")])).unwrap();
        state.add_executed_code_block("print(2.5)", Some(1), "2.5\n");
        state.set_plan(Plan::new(vec![PlanStep::new(1, "median")])).unwrap();

        let interaction = state.current_interaction().unwrap();
        assert_eq!(interaction.plan.steps[0].task, "median");
        assert_eq!(interaction.previous_plans.len(), 1);
        assert_eq!(
            interaction.previous_plans[0].steps[0].result.as_deref(),
            Some("2.5\n")
        );
    }

    #[test]
    fn test_add_executed_code_block_records_on_step() {
        let dir = TempDir::new().unwrap();
        let mut state = state_in(&dir);

        state.add_executed_code_block("import pandas as pd", None, "");
        state.start_new_interaction("q");
        state
            .set_plan(Plan::new(vec![PlanStep::new(1, "a"), PlanStep::new(2, "b")]))
            .unwrap();
        state.add_executed_code_block("print(1)", Some(2), "1\n");
        state.update_plan_step_status(2, StepStatus::Completed);

        assert_eq!(state.executed_code_blocks().len(), 2);
        let plan = state.plan().unwrap();
        assert_eq!(plan.steps[1].code.as_deref(), Some("print(1)"));
        assert_eq!(plan.steps[1].result.as_deref(), Some("1\n"));
        assert_eq!(plan.steps[1].status, StepStatus::Completed);
        assert!(plan.steps[0].code.is_none());
    }

    #[test]
    fn test_finish_interaction() {
        let dir = TempDir::new().unwrap();
        let mut state = state_in(&dir);
        state.finish_interaction(Some("ignored".to_string()), Outcome::Answered);
        assert!(state.interactions().is_empty());

        state.start_new_interaction("q");
        state.finish_interaction(Some("42".to_string()), Outcome::Answered);
        state.finish_interaction(None, Outcome::Partial);

        let interaction = state.current_interaction().unwrap();
        assert_eq!(interaction.answer.as_deref(), Some("42"));
        assert_eq!(interaction.outcome, Outcome::Partial);
        assert!(interaction.duration_seconds >= 0.0);
    }

    #[test]
    fn test_worker_context() {
        let dir = TempDir::new().unwrap();
        let mut state = state_in(&dir);
        assert_eq!(
            state.worker_context(&PlanStep::new(1, "a")),
            "Error: No active interaction."
        );

        state.start_new_interaction("Which region sells most?");
        state
            .set_plan(Plan::new(vec![
                PlanStep::new(1, "Group by region"),
                PlanStep::new(2, "Answer"),
            ]))
            .unwrap();
        let context = state.worker_context(&state.plan().unwrap().steps[1].clone());
        assert!(context.contains("Which region sells most?"));
        assert!(context.contains("==> Step 2 (pending): Answer"));
        assert!(context.contains("    Step 1 (pending): Group by region"));
        assert!(context.contains("No code has been executed yet."));

        state.add_executed_code_block("df = 1", Some(1), "");
        state.update_all_dataframe_summaries(sales_summary());
        let context = state.worker_context(&state.plan().unwrap().steps[1].clone());
        assert!(context.contains("```python\ndf = 1\n```"));
        assert!(context.contains("- `sales`:"));
        assert!(context.contains("Columns: [region (object), amount (float64)]"));
    }

    #[test]
    fn test_planner_context_includes_history() {
        let dir = TempDir::new().unwrap();
        let mut state = state_in(&dir);

        state.start_new_interaction("first question");
        state
            .set_plan(Plan::new(vec![PlanStep::new(1, "count rows")]))
            .unwrap();
        state.add_executed_code_block("print(len(sales))", Some(1), "120\n");
        state.add_note("I tried to load broken.csv but it failed.");

        state.start_new_interaction("second question");
        let context = state.planner_context();

        assert!(context.contains("**Previous Interactions History:**"));
        assert!(context.contains("--- Turn 1 ---"));
        assert!(context.contains("User Query: first question"));
        assert!(context.contains("  - Step 1: count rows"));
        assert!(context.contains("print(len(sales))"));
        assert!(context.contains("**Current User Query:**\nsecond question"));
        assert!(context.contains("broken.csv"));
        assert!(!context.contains("Turn 2"));
    }

    #[test]
    fn test_summaries_for_display() {
        let dir = TempDir::new().unwrap();
        let mut state = state_in(&dir);
        assert_eq!(state.dataframe_summaries_for_display(), "No data loaded yet.");

        state.update_all_dataframe_summaries(sales_summary());
        let display = state.dataframe_summaries_for_display();
        assert!(display.contains("--- DataFrame: sales ---"));
        assert!(display.contains("\"head_sample\""));
    }

    #[test]
    fn test_format_error_summary() {
        let summary = DataFrameSummary::Error {
            error: "boom".to_string(),
        };
        assert_eq!(
            format_summary_for_llm(&summary),
            "  - Error fetching summary: boom"
        );
    }
}
