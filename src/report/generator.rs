//! Markdown report generation.
//!
//! Renders a session [`Report`] as a Markdown document: metadata, outcome
//! summary, loaded DataFrames, one section per question and the complete
//! executed script.

use crate::config::ReportConfig;
use crate::models::{
    DataFrameSummary, Interaction, Outcome, Plan, PlanStep, Report, ReportMetadata,
    SessionSummary, StepStatus, Summaries,
};
use anyhow::Result;

/// Generate a complete Markdown report.
pub fn generate_markdown_report(report: &Report, config: &ReportConfig) -> String {
    let mut output = String::new();

    output.push_str("# Data Copilot Report\n\n");
    output.push_str(&generate_metadata_section(
        &report.metadata,
        report.interactions.len(),
    ));
    output.push_str(&generate_table_of_contents(report, config));
    output.push_str(&generate_summary_section(&report.summary));
    output.push_str(&generate_datasets_section(&report.dataframes));
    output.push_str(&generate_interactions_section(&report.interactions, config));
    if config.include_full_script {
        output.push_str(&generate_script_section(&report.executed_code));
    }
    output.push_str(&generate_footer());

    output
}

fn generate_metadata_section(metadata: &ReportMetadata, interactions: usize) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!(
        "- **Analysis Date:** {}\n",
        metadata.analysis_date.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Model Used:** `{}`\n", metadata.model_used));
    if metadata.datasets.is_empty() {
        section.push_str("- **Datasets:** none\n");
    } else {
        let datasets = metadata
            .datasets
            .iter()
            .map(|d| format!("`{}`", d))
            .collect::<Vec<_>>()
            .join(", ");
        section.push_str(&format!("- **Datasets:** {}\n", datasets));
    }
    section.push_str(&format!("- **Questions:** {}\n", interactions));
    section.push_str(&format!(
        "- **Session Duration:** {:.1}s\n",
        metadata.duration_seconds
    ));
    section.push('\n');

    section
}

fn generate_table_of_contents(report: &Report, config: &ReportConfig) -> String {
    let mut toc = String::new();

    toc.push_str("## Table of Contents\n\n");
    toc.push_str("- [Metadata](#metadata)\n");
    toc.push_str("- [Summary](#summary)\n");
    toc.push_str("- [Datasets](#datasets)\n");
    toc.push_str("- [Questions](#questions)\n");
    for (i, interaction) in report.interactions.iter().enumerate() {
        toc.push_str(&format!(
            "  - [{}](#question-{})\n",
            one_line(&interaction.query),
            i + 1
        ));
    }
    if config.include_full_script {
        toc.push_str("- [Full Script](#full-script)\n");
    }
    toc.push('\n');

    toc
}

fn generate_summary_section(summary: &SessionSummary) -> String {
    let mut section = String::new();

    section.push_str("## Summary\n\n");
    section.push_str(&format!(
        "| {} Answered | {} Partial | {} Failed | **Questions** |\n",
        Outcome::Answered.emoji(),
        Outcome::Partial.emoji(),
        Outcome::Failed.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | **{}** |\n\n",
        summary.answered, summary.partial, summary.failed, summary.interactions
    ));

    section.push_str(&format!(
        "Steps completed: {} of {} ({} failed), re-plans: {}.\n\n",
        summary.steps_completed, summary.steps_total, summary.steps_failed, summary.replans
    ));

    section
}

fn generate_datasets_section(dataframes: &Summaries) -> String {
    let mut section = String::new();

    section.push_str("## Datasets\n\n");
    if dataframes.is_empty() {
        section.push_str("No DataFrames were loaded.\n\n");
        return section;
    }

    section.push_str("| DataFrame | Rows | Columns | Column Types |\n");
    section.push_str("|:---|:---:|:---:|:---|\n");
    for (name, summary) in dataframes {
        match summary {
            DataFrameSummary::Table(table) => {
                let columns = table
                    .columns
                    .iter()
                    .map(|(column, dtype)| format!("{} ({})", column, dtype))
                    .collect::<Vec<_>>()
                    .join(", ");
                section.push_str(&format!(
                    "| `{}` | {} | {} | {} |\n",
                    name,
                    table.shape.0,
                    table.shape.1,
                    escape_cell(&columns)
                ));
            }
            DataFrameSummary::Error { error } => {
                section.push_str(&format!(
                    "| `{}` | - | - | summary unavailable: {} |\n",
                    name,
                    escape_cell(error)
                ));
            }
        }
    }
    section.push('\n');

    section
}

fn generate_interactions_section(interactions: &[Interaction], config: &ReportConfig) -> String {
    let mut section = String::new();

    section.push_str("## Questions\n\n");
    if interactions.is_empty() {
        section.push_str("No questions were asked in this session.\n\n");
        return section;
    }

    for (i, interaction) in interactions.iter().enumerate() {
        section.push_str(&generate_interaction_block(i + 1, interaction, config));
    }

    section
}

fn generate_interaction_block(
    number: usize,
    interaction: &Interaction,
    config: &ReportConfig,
) -> String {
    let mut block = String::new();

    block.push_str(&format!(
        "<a id=\"question-{}\"></a>\n\n### {}. {}\n\n",
        number,
        number,
        one_line(&interaction.query)
    ));
    block.push_str(&format!(
        "*{} {} | Duration: {:.1}s | Re-plans: {}*\n\n",
        interaction.outcome.emoji(),
        interaction.outcome,
        interaction.duration_seconds,
        interaction.replans
    ));

    match interaction.answer {
        Some(ref answer) => {
            block.push_str("**Answer:**\n\n");
            for line in answer.lines() {
                block.push_str(&format!("> {}\n", line));
            }
            block.push('\n');
        }
        None => block.push_str("*No answer was produced.*\n\n"),
    }

    for (i, plan) in interaction.previous_plans.iter().enumerate() {
        block.push_str(&format!("#### Earlier Plan {}\n\n", i + 1));
        block.push_str(&generate_plan_table(plan));
        if config.include_code {
            for step in plan.steps.iter().filter(|s| s.code.is_some()) {
                block.push_str(&generate_step_block(step, config.max_output_chars));
            }
        }
    }

    if !interaction.plan.is_empty() {
        block.push_str("#### Plan\n\n");
        block.push_str(&generate_plan_table(&interaction.plan));
    }

    if config.include_code {
        for step in interaction.plan.steps.iter().filter(|s| s.code.is_some()) {
            block.push_str(&generate_step_block(step, config.max_output_chars));
        }
    }

    if let Some(ref last) = interaction.last_result {
        block.push_str("**Last Result:**\n\n```\n");
        block.push_str(&truncate_output(last, config.max_output_chars));
        block.push_str("\n```\n\n");
    }

    block.push_str("---\n\n");

    block
}

fn generate_plan_table(plan: &Plan) -> String {
    let mut table = String::new();

    table.push_str("| Step | Status | Task |\n");
    table.push_str("|:---:|:---|:---|\n");
    for step in &plan.steps {
        table.push_str(&format!(
            "| {} | {} | {} |\n",
            step.step_id,
            status_badge(step.status),
            escape_cell(&step.task)
        ));
    }
    table.push('\n');

    table
}

fn generate_step_block(step: &PlanStep, max_output_chars: usize) -> String {
    let mut block = String::new();

    block.push_str(&format!("#### Step {}: {}\n\n", step.step_id, one_line(&step.task)));
    if let Some(ref code) = step.code {
        block.push_str("```python\n");
        block.push_str(code.trim_end());
        block.push_str("\n```\n\n");
    }
    if let Some(ref result) = step.result {
        if !result.trim().is_empty() {
            block.push_str("<details>\n<summary>Output</summary>\n\n```\n");
            block.push_str(&truncate_output(result, max_output_chars));
            block.push_str("\n```\n</details>\n\n");
        }
    }

    block
}

fn generate_script_section(executed_code: &[String]) -> String {
    let mut section = String::new();

    section.push_str("## Full Script\n\n");
    if executed_code.is_empty() {
        section.push_str("No code was executed.\n\n");
        return section;
    }

    section.push_str("```python\n");
    section.push_str(
        &executed_code
            .iter()
            .map(|block| block.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n"),
    );
    section.push_str("\n```\n\n");

    section
}

fn generate_footer() -> String {
    format!(
        "---\n\n*Report generated by Data Copilot v{}*\n",
        env!("CARGO_PKG_VERSION")
    )
}

fn status_badge(status: StepStatus) -> String {
    let label = match status {
        StepStatus::Pending => "Pending",
        StepStatus::InProgress => "In progress",
        StepStatus::Completed => "Completed",
        StepStatus::Failed => "**Failed**",
    };
    format!("{} {}", status.emoji(), label)
}

/// Cut output to `max_chars` characters, noting how much was dropped.
fn truncate_output(output: &str, max_chars: usize) -> String {
    let output = output.trim_end();
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let kept: String = output.chars().take(max_chars).collect();
    format!("{}\n... ({} more characters)", kept, total - max_chars)
}

fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn escape_cell(text: &str) -> String {
    one_line(text).replace('|', "\\|")
}

/// Generate a JSON report.
pub fn generate_json_report(report: &Report) -> Result<String> {
    serde_json::to_string_pretty(report).map_err(Into::into)
}
