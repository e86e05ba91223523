//! Planner: turns a user request into an ordered list of analysis steps.

use crate::agent::prompts::{planner_prompt, replanner_prompt};
use crate::llm::ChatModel;
use crate::models::{Plan, PlanStep};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Task text of the fallback plan when planning fails.
pub const PLANNER_FAILED_TASK: &str = "Planner failed to generate a valid plan.";
/// Task text of the fallback plan when re-planning fails.
pub const REPLANNER_FAILED_TASK: &str = "Re-planner failed to generate a valid plan.";

pub struct Planner {
    model: Arc<dyn ChatModel>,
}

impl Planner {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Create the first plan for `user_query`.
    ///
    /// Never fails: an unusable model response yields
    /// [`Plan::planning_failure`].
    pub async fn generate_plan(&self, user_query: &str, context: &str) -> Plan {
        info!("Generating a new plan");
        let prompt = planner_prompt(user_query, context);
        self.request_plan("planner", &prompt, PLANNER_FAILED_TASK)
            .await
    }

    /// Create a complete replacement plan after `failed_task` failed.
    pub async fn replan(
        &self,
        user_query: &str,
        context: &str,
        failed_task: &str,
        error_message: &str,
    ) -> Plan {
        info!("Previous plan failed, re-planning");
        let prompt = replanner_prompt(user_query, context, failed_task, error_message);
        self.request_plan("replanner", &prompt, REPLANNER_FAILED_TASK)
            .await
    }

    async fn request_plan(&self, prompt_name: &str, prompt: &str, failure_task: &str) -> Plan {
        let response = match self.model.complete_json(prompt_name, prompt).await {
            Ok(response) => response,
            Err(e) => {
                error!("{} LLM call failed: {}", prompt_name, e);
                return Plan::planning_failure(failure_task);
            }
        };

        match parse_plan(&response) {
            Some(plan) => {
                info!("Plan with {} steps generated", plan.len());
                plan
            }
            None => {
                error!(
                    "{} did not return a valid list of steps. Response: {}",
                    prompt_name, response
                );
                Plan::planning_failure(failure_task)
            }
        }
    }
}

/// Render a plan for the terminal.
pub fn format_plan(plan: &Plan) -> String {
    let mut out = String::from("[Plan]:");
    for step in &plan.steps {
        out.push_str(&format!(
            "\nStep {} ({}): {}",
            step.step_id, step.status, step.task
        ));
    }
    out
}

/// Accepts the shapes models actually return:
/// `[{step_id, task}, ...]`, `{"plan": [...]}`, `{"steps": [...]}` and
/// `{"plan": {"step_1": {"description": ...}, ...}}`.
pub fn parse_plan(value: &Value) -> Option<Plan> {
    let steps = match value {
        Value::Array(items) => steps_from_list(items)?,
        Value::Object(map) => match map.get("plan").or_else(|| map.get("steps"))? {
            Value::Array(items) => steps_from_list(items)?,
            Value::Object(keyed) => steps_from_keyed(keyed)?,
            _ => return None,
        },
        _ => return None,
    };

    if steps.is_empty() {
        return None;
    }
    Some(Plan::new(ensure_unique_ids(steps)))
}

fn task_text(step: &Map<String, Value>) -> Option<String> {
    step.get("task")
        .or_else(|| step.get("description"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from)
}

fn step_id_of(step: &Map<String, Value>) -> Option<u32> {
    match step.get("step_id")? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn steps_from_list(items: &[Value]) -> Option<Vec<PlanStep>> {
    let mut steps = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let step = item.as_object()?;
        let Some(task) = task_text(step) else {
            warn!("Skipping plan step without a task: {}", item);
            continue;
        };
        let step_id = step_id_of(step).unwrap_or(position as u32 + 1);
        steps.push(PlanStep::new(step_id, task));
    }
    Some(steps)
}

fn steps_from_keyed(map: &Map<String, Value>) -> Option<Vec<PlanStep>> {
    let mut steps: Vec<PlanStep> = map
        .iter()
        .filter_map(|(key, value)| {
            let step_id = key.rsplit('_').next()?.parse().ok()?;
            let task = task_text(value.as_object()?)?;
            Some(PlanStep::new(step_id, task))
        })
        .collect();
    steps.sort_by_key(|s| s.step_id);
    Some(steps)
}

/// Renumber 1..n when the model repeated step ids.
fn ensure_unique_ids(mut steps: Vec<PlanStep>) -> Vec<PlanStep> {
    let mut seen = HashSet::new();
    if steps.iter().all(|s| seen.insert(s.step_id)) {
        return steps;
    }
    warn!("Plan has duplicate step ids, renumbering");
    for (i, step) in steps.iter_mut().enumerate() {
        step.step_id = i as u32 + 1;
    }
    steps
}
