//! Multi-agent orchestration core: a decision loop that plans, delegates
//! tasks to tool-using agents, and repairs generated analysis code until a
//! deliverable exists in the session workspace.

pub mod core;
pub mod logging;

pub use crate::core::config::AppConfig;
pub use crate::core::orchestrator::{Orchestrator, OrchestratorError, RunReport};
