//! LLM client for an OpenAI-compatible chat completions API.
//!
//! Every component talks to the model through the [`ChatModel`] trait so the
//! planner, executor and coordinator can be tested with scripted responses.

pub mod client;
pub mod json;
pub mod prompt_log;

pub use client::{ChatModel, LlmClient, LlmConfig, LlmError};
pub use prompt_log::PromptLog;
