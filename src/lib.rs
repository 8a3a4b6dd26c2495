//! Wealth research agent
//!
//! Turns a natural-language research request into a small task plan, runs
//! it against pluggable tools, scores the outcome and retries or replans
//! until the result is good enough or the iteration budget runs out.
//!
//! CONTROL LOOP:
//! PLAN → EXECUTE → REFLECT → DECIDE → (RETRY | REPLAN | FINISH)

pub mod agent;
pub mod api;
pub mod classifier;
pub mod config;
pub mod error;
pub mod execution;
pub mod llm;
pub mod memory;
pub mod models;
pub mod planner;
pub mod reflection;
pub mod response;
pub mod tools;

pub use error::{OrchestrationError, Result};

// Re-export common types
pub use models::*;
pub use classifier::{RequestCategory, RequestClassifier};
