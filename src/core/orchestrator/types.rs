use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use super::decision::DecisionError;
use crate::core::agent::{AgentKind, AgentProfile, TaskExecutor};
use crate::core::llm::ReasoningBackend;
use crate::core::protocol::WorkflowStatus;
use crate::core::tools::ToolRegistry;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(
        "Orchestrator failed to provide a valid decision after {attempts} attempts ({source}). Last response: {last_response}"
    )]
    InvalidDecision {
        attempts: usize,
        source: DecisionError,
        last_response: String,
    },
    #[error("Maximum orchestration decisions ({decisions}) reached before workflow completion")]
    DecisionBudgetExhausted { decisions: usize },
    #[error("Reasoning backend failed while deciding: {0}")]
    Backend(String),
    #[error("Orchestrator agent aborted while deciding: {0}")]
    AgentAborted(String),
    #[error("Illegal workflow transition {from} -> {to}")]
    IllegalTransition {
        from: &'static str,
        to: &'static str,
    },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Final state of a run as seen by the host.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RunReport {
    pub session_id: String,
    pub workspace: PathBuf,
    pub status: WorkflowStatus,
    pub decisions: usize,
    pub deliverable: Option<PathBuf>,
    pub steps_completed: usize,
    pub steps_total: usize,
}

/// Builds a fresh executor per dispatch; agents keep no state across tasks.
pub struct AgentFactory {
    pub backend: Arc<dyn ReasoningBackend>,
    pub registry: Arc<ToolRegistry>,
    pub workspace: PathBuf,
    pub prompts_dir: Option<PathBuf>,
    pub max_iterations: usize,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl AgentFactory {
    pub fn profile(&self, kind: AgentKind) -> AgentProfile {
        AgentProfile::load(kind, self.prompts_dir.as_deref(), &self.registry)
    }

    pub fn build(&self, kind: AgentKind) -> TaskExecutor {
        TaskExecutor::new(
            self.profile(kind),
            self.backend.clone(),
            self.registry.clone(),
            &self.workspace,
        )
        .with_max_iterations(self.max_iterations)
        .with_generation(self.temperature, self.max_tokens)
    }
}
