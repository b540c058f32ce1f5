pub mod files;
pub mod python;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::core::protocol::{ToolCall, ToolDefinition, ToolResult, ToolStatus};
use crate::core::sandbox::CodeSandbox;

/// What a tool hands back on success. Failures are `Err` and become an
/// `error` ToolResult in `ToolRegistry::execute_call`.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub output: Value,
    pub artifacts: Vec<String>,
}

impl ToolOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            artifacts: Vec::new(),
        }
    }

    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, args: Value) -> Result<ToolOutput>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ToolResolutionError {
    #[error("Tool '{0}' not found")]
    NotFound(String),
    #[error("Tool '{tool}' is not available to agent type '{agent_type}'")]
    NotAllowed { tool: String, agent_type: String },
}

/// Agent type → tool names it may call.
const DEFAULT_ALLOW_LISTS: &[(&str, &[&str])] = &[
    ("orchestrator", &["file_system_scanner"]),
    ("planner", &[]),
    (
        "executor",
        &[
            "file_saver",
            "find_in_file",
            "file_system_scanner",
            "python_execution",
        ],
    ),
    ("strategy_synthesizer", &["file_saver"]),
    ("strategy_evaluator", &["python_execution", "file_saver"]),
    ("judger", &["find_in_file", "file_saver"]),
    ("writer", &["find_in_file", "file_saver"]),
];

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    allow_lists: HashMap<String, Vec<String>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Empty registry carrying the default allow-lists.
    pub fn new() -> Self {
        let allow_lists = DEFAULT_ALLOW_LISTS
            .iter()
            .map(|(agent, tools)| {
                (
                    agent.to_string(),
                    tools.iter().map(|t| t.to_string()).collect(),
                )
            })
            .collect();
        Self {
            tools: HashMap::new(),
            allow_lists,
        }
    }

    /// Registry with the shipped workspace tools; `python_execution` only
    /// when a sandbox is supplied.
    pub fn for_workspace(workspace: &Path, sandbox: Option<Arc<CodeSandbox>>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(files::FileSaverTool::new(workspace)));
        registry.register(Arc::new(files::FileSystemScannerTool::new(workspace)));
        registry.register(Arc::new(files::FindInFileTool::new(workspace)));
        if let Some(sandbox) = sandbox {
            registry.register(Arc::new(python::PythonExecutionTool::new(sandbox)));
        }
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        info!("Registering tool: {}", name);
        self.tools.insert(name, tool);
    }

    pub fn allow(&mut self, agent_type: &str, tool_name: &str) {
        let list = self.allow_lists.entry(agent_type.to_string()).or_default();
        if !list.iter().any(|t| t == tool_name) {
            list.push(tool_name.to_string());
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Allowed names for an agent type that are actually registered.
    pub fn list(&self, agent_type: &str) -> Vec<String> {
        self.allow_lists
            .get(agent_type)
            .map(|names| {
                names
                    .iter()
                    .filter(|n| self.tools.contains_key(*n))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn definitions_for(&self, agent_type: &str) -> Vec<ToolDefinition> {
        self.list(agent_type)
            .iter()
            .filter_map(|n| self.tools.get(n))
            .map(|t| t.definition())
            .collect()
    }

    pub fn resolve(
        &self,
        agent_type: &str,
        tool_name: &str,
    ) -> Result<Arc<dyn Tool>, ToolResolutionError> {
        let tool = self
            .get(tool_name)
            .ok_or_else(|| ToolResolutionError::NotFound(tool_name.to_string()))?;
        let allowed = self
            .allow_lists
            .get(agent_type)
            .is_some_and(|names| names.iter().any(|n| n == tool_name));
        if !allowed {
            return Err(ToolResolutionError::NotAllowed {
                tool: tool_name.to_string(),
                agent_type: agent_type.to_string(),
            });
        }
        Ok(tool)
    }

    /// Runs an already resolved tool; a tool error is reported, not raised.
    pub async fn execute_call(&self, tool: &dyn Tool, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let outcome = tool.execute(call.arguments.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(out) => {
                info!("Tool '{}' succeeded in {}ms", call.tool_name, duration_ms);
                ToolResult {
                    call_id: call.call_id.clone(),
                    status: ToolStatus::Success,
                    output: out.output,
                    error: None,
                    artifacts: out.artifacts,
                    duration_ms,
                }
            }
            Err(e) => {
                warn!("Tool '{}' failed: {}", call.tool_name, e);
                ToolResult {
                    call_id: call.call_id.clone(),
                    status: ToolStatus::Error,
                    output: Value::Null,
                    error: Some(e.to_string()),
                    artifacts: Vec::new(),
                    duration_ms,
                }
            }
        }
    }
}

/// Reads a string argument, rejecting missing or non-string values.
pub(crate) fn str_arg<'a>(args: &'a Value, name: &str) -> Result<&'a str> {
    args.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("Missing required string argument '{}'", name))
}
