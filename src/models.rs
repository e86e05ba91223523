//! Data models for the data copilot.
//!
//! This module contains the core data structures shared by the planner,
//! executor, coordinator and report generator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Execution status of a plan step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started yet
    #[default]
    Pending,
    /// Currently handed to the executor
    InProgress,
    /// Code ran successfully
    Completed,
    /// Executor gave up on the step
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

impl StepStatus {
    /// Returns an emoji representation of the status.
    pub fn emoji(&self) -> &'static str {
        match self {
            StepStatus::Pending => "⏳",
            StepStatus::InProgress => "🔄",
            StepStatus::Completed => "✅",
            StepStatus::Failed => "❌",
        }
    }
}

/// A single step of an analysis plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based step number as assigned by the planner.
    pub step_id: u32,
    /// Natural-language description of the task.
    pub task: String,
    /// Current execution status.
    #[serde(default)]
    pub status: StepStatus,
    /// Code that completed this step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Captured stdout of that code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl PlanStep {
    /// Creates a pending step.
    pub fn new(step_id: u32, task: impl Into<String>) -> Self {
        Self {
            step_id,
            task: task.into(),
            status: StepStatus::Pending,
            code: None,
            result: None,
        }
    }
}

/// An ordered list of steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    /// The single-step plan returned when planning itself failed.
    pub fn planning_failure(task: impl Into<String>) -> Self {
        let mut step = PlanStep::new(1, task);
        step.status = StepStatus::Failed;
        Self { steps: vec![step] }
    }

    /// True if this plan is a planning failure rather than work to do.
    pub fn is_planning_failure(&self) -> bool {
        self.steps.len() == 1 && self.steps[0].status == StepStatus::Failed
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_mut(&mut self, step_id: u32) -> Option<&mut PlanStep> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Number of steps with the given status.
    pub fn count_with_status(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }
}

/// Summary of a pandas DataFrame living in the sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataFrameSummary {
    Table(TableSummary),
    Error { error: String },
}

/// Shape, columns and a short sample of a DataFrame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSummary {
    /// (rows, columns)
    pub shape: (usize, usize),
    /// Column names with their dtypes, in frame order.
    pub columns: Vec<(String, String)>,
    /// First rows rendered as CSV.
    pub head_sample: String,
}

/// Summaries keyed by DataFrame variable name.
pub type Summaries = BTreeMap<String, DataFrameSummary>;

/// How an interaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Still running
    #[default]
    InProgress,
    /// The goal was answered
    Answered,
    /// An answer exists but the evaluation found gaps
    Partial,
    /// No usable answer
    Failed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::InProgress => write!(f, "In progress"),
            Outcome::Answered => write!(f, "Answered"),
            Outcome::Partial => write!(f, "Partially answered"),
            Outcome::Failed => write!(f, "Failed"),
        }
    }
}

impl Outcome {
    pub fn emoji(&self) -> &'static str {
        match self {
            Outcome::InProgress => "🔄",
            Outcome::Answered => "🟢",
            Outcome::Partial => "🟡",
            Outcome::Failed => "🔴",
        }
    }
}

/// One user query with its plan, results and answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub query: String,
    pub plan: Plan,
    /// Plans replaced by a re-plan, oldest first, with their step results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_plans: Vec<Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    pub outcome: Outcome,
    /// Number of times the plan was replaced.
    pub replans: usize,
    /// Stdout of the last step that printed anything.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_result: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

impl Interaction {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            plan: Plan::default(),
            previous_plans: Vec::new(),
            answer: None,
            outcome: Outcome::InProgress,
            replans: 0,
            last_result: None,
            started_at: Utc::now(),
            duration_seconds: 0.0,
        }
    }

    /// Superseded plans followed by the current one.
    pub fn all_plans(&self) -> impl Iterator<Item = &Plan> {
        self.previous_plans.iter().chain(std::iter::once(&self.plan))
    }

    /// Steps that produced code across every plan, in execution order.
    pub fn executed_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.all_plans()
            .flat_map(|plan| plan.steps.iter())
            .filter(|s| s.code.is_some())
    }
}

/// Step and interaction counts over a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub interactions: usize,
    pub answered: usize,
    pub partial: usize,
    pub failed: usize,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub replans: usize,
}

impl SessionSummary {
    /// Creates a summary from a list of interactions.
    pub fn from_interactions(interactions: &[Interaction]) -> Self {
        let mut summary = Self {
            interactions: interactions.len(),
            ..Self::default()
        };

        for interaction in interactions {
            match interaction.outcome {
                Outcome::Answered => summary.answered += 1,
                Outcome::Partial => summary.partial += 1,
                Outcome::Failed => summary.failed += 1,
                Outcome::InProgress => {}
            }
            for plan in interaction.all_plans() {
                summary.steps_total += plan.len();
                summary.steps_completed += plan.count_with_status(StepStatus::Completed);
                summary.steps_failed += plan.count_with_status(StepStatus::Failed);
            }
            summary.replans += interaction.replans;
        }

        summary
    }
}

/// Metadata about the session report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    /// Date and time the report was generated.
    pub analysis_date: DateTime<Utc>,
    /// Name of the LLM model used.
    pub model_used: String,
    /// CSV files loaded into the workspace.
    pub datasets: Vec<String>,
    /// Wall-clock session duration in seconds.
    pub duration_seconds: f64,
}

/// The complete analysis report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: ReportMetadata,
    /// DataFrames in the sandbox when the report was built.
    pub dataframes: Summaries,
    pub interactions: Vec<Interaction>,
    pub summary: SessionSummary,
    /// Every successfully executed code block, in execution order.
    pub executed_code: Vec<String>,
}
