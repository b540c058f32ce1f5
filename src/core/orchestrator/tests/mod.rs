mod decision_parsing;

use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;

use crate::core::config::AppConfig;
use crate::core::llm::Completion;
use crate::core::llm::scripted::ScriptedBackend;
use crate::core::orchestrator::Orchestrator;
use crate::core::sandbox::runner::scripted::ScriptedRunner;

pub(super) fn config_in(root: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.workspace.root = root.to_path_buf();
    config.orchestration.refinement_iterations = 1;
    config
}

pub(super) fn orchestrator(config: AppConfig, replies: Vec<Completion>) -> (Orchestrator, Arc<ScriptedBackend>) {
    let backend = Arc::new(ScriptedBackend::new(replies));
    let orchestrator = Orchestrator::new(
        config,
        backend.clone(),
        Arc::new(ScriptedBackend::new(vec![])),
        Arc::new(ScriptedRunner::new(vec![])),
    );
    (orchestrator, backend)
}

pub(super) fn decide(agent: &str, step: &str, task: &str) -> Completion {
    Completion::text(format!("NEXT_AGENT: {}\nPLAN_STEP: {}\nTASK: {}", agent, step, task))
}

pub(super) fn plan_reply(objectives: &[&str]) -> Completion {
    let steps: Vec<Value> = objectives
        .iter()
        .enumerate()
        .map(|(i, o)| json!({"step_number": i + 1, "objective": o, "required_tools": ["file_saver"]}))
        .collect();
    Completion::text(format!("Plan:\n{}", serde_json::to_string_pretty(&steps).unwrap()))
}

pub(super) fn save_and_finish(filename: &str, content: &str, message: &str) -> Completion {
    Completion::text("Saving.")
        .with_tool_call("file_saver", json!({"filename": filename, "content": content}))
        .with_tool_call("finish", json!({"message": message}))
}
