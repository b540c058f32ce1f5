pub mod personas;

use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::llm::{CompletionRequest, ReasoningBackend};
use crate::core::protocol::{
    AgentState, AgentStatus, Message, ToolCall, ToolDefinition, ToolParameter, ToolResult,
};
use crate::core::tools::ToolRegistry;
pub use personas::{AgentKind, AgentProfile};

pub const FINISH_TOOL: &str = "finish";
pub const MAX_ITERATIONS_RESULT: &str = "Max iterations reached";
const DEFAULT_MAX_ITERATIONS: usize = 10;
const OBSERVATION_LIMIT: usize = 4000;

/// Why a task stopped without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Backend,
    ToolResolution,
}

/// Trace of one task. `result` is set on success, `error` and `abort` on abort.
#[derive(Debug, Clone, Default)]
pub struct TaskOutcome {
    pub success: bool,
    pub result: Option<String>,
    pub error: Option<String>,
    pub abort: Option<AbortReason>,
    pub thoughts: Vec<String>,
    pub actions: Vec<ToolCall>,
    pub tool_results: Vec<ToolResult>,
    pub observations: Vec<String>,
    pub iterations: usize,
    pub finished_early: bool,
}

impl TaskOutcome {
    /// Workspace files reported by successful tool calls, deduplicated.
    pub fn artifacts(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for r in self.tool_results.iter().filter(|r| r.is_success()) {
            for a in &r.artifacts {
                if !seen.contains(a) {
                    seen.push(a.clone());
                }
            }
        }
        seen
    }

    pub fn summary_text(&self) -> &str {
        self.result
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or("")
    }
}

fn finish_tool() -> ToolDefinition {
    ToolDefinition {
        name: FINISH_TOOL.to_string(),
        description: "Call this tool when you have completed the task successfully. This will \
            immediately end the current task and move to the next step."
            .to_string(),
        parameters: vec![ToolParameter::optional(
            "message",
            "string",
            "Final summary message describing what was accomplished",
        )],
    }
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit).collect();
    format!("{}... [truncated]", kept)
}

fn format_observation(tool_name: &str, result: &ToolResult) -> String {
    if result.is_success() {
        let body = serde_json::to_string_pretty(&result.output)
            .unwrap_or_else(|_| result.output.to_string());
        format!(
            "Tool '{}' succeeded: {}",
            tool_name,
            truncate_chars(&body, OBSERVATION_LIMIT)
        )
    } else {
        format!(
            "Tool '{}' failed: {}",
            tool_name,
            result.error.as_deref().unwrap_or("unknown error")
        )
    }
}

/// Runs one persona through the bounded reasoning-act-observe loop.
pub struct TaskExecutor {
    profile: AgentProfile,
    backend: Arc<dyn ReasoningBackend>,
    registry: Arc<ToolRegistry>,
    workspace: PathBuf,
    max_iterations: usize,
    temperature: f32,
    max_tokens: Option<u32>,
    state: AgentState,
}

impl TaskExecutor {
    pub fn new(
        profile: AgentProfile,
        backend: Arc<dyn ReasoningBackend>,
        registry: Arc<ToolRegistry>,
        workspace: &Path,
    ) -> Self {
        let agent_id = format!(
            "{}_{}",
            profile.kind.as_str(),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let state = AgentState::new(&agent_id, profile.kind.as_str());
        Self {
            profile,
            backend,
            registry,
            workspace: workspace.to_path_buf(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            temperature: 0.7,
            max_tokens: None,
            state,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    pub fn with_generation(mut self, temperature: f32, max_tokens: Option<u32>) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn kind(&self) -> AgentKind {
        self.profile.kind
    }

    fn system_prompt(&self) -> String {
        let now = chrono::Local::now();
        format!(
            "{}\n\n===== CURRENT CONTEXT =====\nCurrent Date: {}\nCurrent Time: {}\nWorkspace: {}\n===========================\n\nRemember to use the current date/time information when relevant to your task.",
            self.profile.system_prompt,
            now.format("%Y-%m-%d"),
            now.format("%Y-%m-%d %H:%M:%S"),
            self.workspace.display()
        )
    }

    fn tool_menu(&self) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self
            .profile
            .tools
            .iter()
            .filter_map(|name| self.registry.get(name))
            .map(|t| t.definition())
            .collect();
        tools.push(finish_tool());
        tools
    }

    fn abort(
        &mut self,
        mut outcome: TaskOutcome,
        iteration: usize,
        reason: AbortReason,
        error: String,
    ) -> TaskOutcome {
        warn!("[{}] task aborted: {}", self.state.agent_id, error);
        self.state.status = AgentStatus::Error;
        outcome.success = false;
        outcome.error = Some(error);
        outcome.abort = Some(reason);
        outcome.iterations = iteration;
        outcome
    }

    fn complete(&mut self, mut outcome: TaskOutcome, iteration: usize, result: String) -> TaskOutcome {
        self.state.status = AgentStatus::Completed;
        outcome.success = true;
        outcome.result = Some(result);
        outcome.iterations = iteration;
        outcome
    }

    pub async fn execute(&mut self, task: &str, prior_context: &[Message]) -> TaskOutcome {
        self.state.status = AgentStatus::Thinking;
        self.state.current_task = Some(task.to_string());
        info!(
            "[{}] starting task: {}",
            self.state.agent_id,
            task.chars().take(120).collect::<String>()
        );

        let mut messages = vec![Message::system(self.system_prompt()), Message::user(task)];
        messages.extend(prior_context.iter().cloned());
        let tools = self.tool_menu();
        let mut outcome = TaskOutcome::default();

        for iteration in 1..=self.max_iterations {
            let mut request = CompletionRequest::new(messages.clone())
                .with_tools(tools.clone())
                .with_temperature(self.temperature);
            request.max_tokens = self.max_tokens;

            let completion = match self.backend.complete(request).await {
                Ok(c) => c,
                Err(e) => {
                    return self.abort(
                        outcome,
                        iteration,
                        AbortReason::Backend,
                        format!("Reasoning backend error: {}", e),
                    );
                }
            };

            let thought = completion.text.trim().to_string();
            if !thought.is_empty() {
                outcome.thoughts.push(thought.clone());
                self.state.last_thought = Some(thought.clone());
            }

            if completion.tool_calls.is_empty() {
                info!("[{}] answered without tool calls", self.state.agent_id);
                return self.complete(outcome, iteration, thought);
            }

            for requested in completion.tool_calls {
                let call = ToolCall::new(&requested.name, requested.arguments, &self.state.agent_id);
                info!("[{}] tool call: {}", self.state.agent_id, call.tool_name);
                outcome.actions.push(call.clone());

                if call.tool_name == FINISH_TOOL {
                    let message = call
                        .arguments
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|m| !m.is_empty())
                        .map(str::to_string);
                    let result = message
                        .or_else(|| (!thought.is_empty()).then(|| thought.clone()))
                        .unwrap_or_else(|| "Task completed".to_string());
                    outcome.finished_early = true;
                    return self.complete(outcome, iteration, result);
                }

                self.state.last_action = Some(call.clone());
                self.state.status = AgentStatus::Acting;

                let tool = match self.registry.resolve(self.profile.kind.as_str(), &call.tool_name)
                {
                    Ok(t) => t,
                    Err(e) => {
                        return self.abort(
                            outcome,
                            iteration,
                            AbortReason::ToolResolution,
                            e.to_string(),
                        );
                    }
                };
                let result = self.registry.execute_call(tool.as_ref(), &call).await;
                let observation = format_observation(&call.tool_name, &result);
                outcome.observations.push(observation.clone());
                outcome.tool_results.push(result);
                self.state.last_observation = Some(observation.clone());

                messages.push(Message::assistant(if thought.is_empty() {
                    format!("Using tool: {}", call.tool_name)
                } else {
                    thought.clone()
                }));
                messages.push(Message::tool(observation));
            }

            self.state.status = AgentStatus::Thinking;
        }

        info!(
            "[{}] hit the iteration cap ({})",
            self.state.agent_id, self.max_iterations
        );
        let cap = self.max_iterations;
        self.complete(outcome, cap, MAX_ITERATIONS_RESULT.to_string())
    }
}
