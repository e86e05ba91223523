//! LLM agents for data analysis.
//!
//! The [`Coordinator`] asks the planner for steps, hands each one to the
//! executor and re-plans when a step fails.

pub mod coordinator;
pub mod executor;
pub mod planner;
pub mod prompts;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{load_dataframes, Coordinator, CoordinatorSettings};
