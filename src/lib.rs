//! gptlog - LLM request broker with a durable call log
//!
//! Answers chat completion prompts from a partitioned JSON call log when
//! possible, otherwise asks the model with bounded retries, lenient JSON
//! repair and caller supplied validation, recording every outcome.

pub mod cli;
pub mod config;
pub mod broker;
pub mod calllog;
pub mod error;
