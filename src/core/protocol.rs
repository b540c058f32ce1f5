//! Typed contracts shared by every layer: messages, tool calls and results,
//! agent state, plans and the per-run workflow context.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

fn default_required() -> bool {
    true
}

impl ToolParameter {
    pub fn required(name: &str, kind: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            description: description.to_string(),
            required: true,
            default: None,
            allowed: None,
        }
    }

    pub fn optional(name: &str, kind: &str, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind, description)
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ToolParameter>,
}

impl ToolDefinition {
    /// Function-calling schema in the chat-completions `tools` shape.
    pub fn to_openai_schema(&self) -> Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = serde_json::json!({
                "type": param.kind,
                "description": param.description,
            });
            if let Some(allowed) = &param.allowed {
                prop["enum"] = serde_json::json!(allowed);
            }
            if let Some(default) = &param.default {
                prop["default"] = default.clone();
            }
            properties.insert(param.name.clone(), prop);
            if param.required {
                required.push(param.name.clone());
            }
        }

        let mut parameters = serde_json::json!({
            "type": "object",
            "properties": properties,
        });
        // Some backends reject an empty `required` array.
        if !required.is_empty() {
            parameters["required"] = serde_json::json!(required);
        }

        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": parameters,
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: Value,
    pub call_id: String,
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    pub fn new(tool_name: &str, arguments: Value, agent_id: &str) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            arguments,
            call_id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub status: ToolStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub artifacts: Vec<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        self.status == ToolStatus::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Thinking,
    Acting,
    Waiting,
    Error,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    pub current_task: Option<String>,
    pub last_thought: Option<String>,
    pub last_action: Option<ToolCall>,
    pub last_observation: Option<String>,
}

impl AgentState {
    pub fn new(agent_id: &str, agent_type: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            status: AgentStatus::Idle,
            current_task: None,
            last_thought: None,
            last_action: None,
            last_observation: None,
        }
    }
}

/// Planner output fields arrive either as prose or as a list of bullet items.
fn string_or_list<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        Text(String),
        List(Vec<Value>),
        Other(Value),
    }

    Ok(match Loose::deserialize(deserializer)? {
        Loose::Text(s) => s,
        Loose::List(items) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join("; "),
        Loose::Other(Value::Null) => String::new(),
        Loose::Other(v) => v.to_string(),
    })
}

fn list_or_string<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Loose {
        List(Vec<String>),
        Text(String),
        Null,
    }

    Ok(match Loose::deserialize(deserializer)? {
        Loose::List(items) => items,
        Loose::Text(s) => s
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect(),
        Loose::Null => Vec::new(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_number: u32,
    pub objective: String,
    #[serde(default, deserialize_with = "list_or_string")]
    pub required_tools: Vec<String>,
    #[serde(default, deserialize_with = "string_or_list")]
    pub inputs: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub outputs: String,
    #[serde(default, deserialize_with = "string_or_list")]
    pub success_criteria: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no steps")]
    Empty,
    #[error("step number {0} appears more than once")]
    DuplicateStep(u32),
    #[error("step number {current} follows {previous}; steps must be increasing")]
    OutOfOrder { previous: u32, current: u32 },
    #[error("planner output did not contain a JSON step array")]
    Unparseable,
}

/// Replaced wholesale on replanning; never mutated step by step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub origin_request: String,
    pub steps: Vec<PlanStep>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn from_steps(origin_request: &str, steps: Vec<PlanStep>) -> Result<Self, PlanError> {
        validate_steps(&steps)?;
        Ok(Self {
            plan_id: format!("plan_{}", uuid::Uuid::new_v4().simple()),
            origin_request: origin_request.to_string(),
            steps,
            created_at: Utc::now(),
        })
    }

    pub fn step(&self, number: u32) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.step_number == number)
    }

    pub fn has_step(&self, number: u32) -> bool {
        self.step(number).is_some()
    }
}

pub fn validate_steps(steps: &[PlanStep]) -> Result<(), PlanError> {
    if steps.is_empty() {
        return Err(PlanError::Empty);
    }
    let mut seen = HashSet::new();
    let mut previous: Option<u32> = None;
    for step in steps {
        if !seen.insert(step.step_number) {
            return Err(PlanError::DuplicateStep(step.step_number));
        }
        if let Some(prev) = previous
            && step.step_number < prev
        {
            return Err(PlanError::OutOfOrder {
                previous: prev,
                current: step.step_number,
            });
        }
        previous = Some(step.step_number);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Success,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStepStatus {
    pub status: StepState,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Initializing,
    Planning,
    Executing,
    Refining,
    Reporting,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Initializing => "initializing",
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::Executing => "executing",
            WorkflowStatus::Refining => "refining",
            WorkflowStatus::Reporting => "reporting",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    pub fn can_transition(self, to: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        if self == to {
            return !self.is_terminal();
        }
        match self {
            Initializing => matches!(to, Planning | Completed | Failed),
            // Planning resets step status, so reporting needs an execution first.
            Planning => matches!(to, Executing | Refining | Completed | Failed),
            Executing | Refining | Reporting => {
                matches!(
                    to,
                    Planning | Executing | Refining | Reporting | Completed | Failed
                )
            }
            Completed | Failed => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub session_id: String,
    pub workspace_path: String,
    pub request: String,
    pub plan: Option<Plan>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowContext {
    pub fn new(session_id: &str, workspace_path: &str, request: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            workspace_path: workspace_path.to_string(),
            request: request.to_string(),
            plan: None,
            status: WorkflowStatus::Initializing,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxAttempt {
    pub attempt_index: usize,
    pub generated_code: String,
    pub stdout: String,
    pub stderr: String,
    pub return_code: Option<i32>,
    pub files_created: Vec<String>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: u32, objective: &str) -> PlanStep {
        PlanStep {
            step_number: n,
            objective: objective.to_string(),
            required_tools: vec![],
            inputs: String::new(),
            outputs: String::new(),
            success_criteria: String::new(),
        }
    }

    #[test]
    fn plan_rejects_duplicate_step_numbers() {
        let err = Plan::from_steps("r", vec![step(1, "a"), step(1, "b")]).unwrap_err();
        assert_eq!(err, PlanError::DuplicateStep(1));
    }

    #[test]
    fn plan_rejects_decreasing_step_numbers() {
        let err = Plan::from_steps("r", vec![step(2, "a"), step(1, "b")]).unwrap_err();
        assert_eq!(
            err,
            PlanError::OutOfOrder {
                previous: 2,
                current: 1
            }
        );
    }

    #[test]
    fn plan_rejects_empty_steps() {
        assert_eq!(Plan::from_steps("r", vec![]).unwrap_err(), PlanError::Empty);
    }

    #[test]
    fn plan_accepts_gapped_increasing_steps() {
        let plan = Plan::from_steps("r", vec![step(1, "a"), step(3, "b")]).unwrap();
        assert!(plan.has_step(3));
        assert!(!plan.has_step(2));
    }

    #[test]
    fn plan_step_accepts_list_fields() {
        let json = r#"{
            "step_number": 1,
            "objective": "Load data",
            "required_tools": "python_execution, file_saver",
            "inputs": ["prices.csv", "params"],
            "outputs": "summary.csv",
            "success_criteria": null
        }"#;
        let step: PlanStep = serde_json::from_str(json).unwrap();
        assert_eq!(step.required_tools, vec!["python_execution", "file_saver"]);
        assert_eq!(step.inputs, "prices.csv; params");
        assert_eq!(step.outputs, "summary.csv");
        assert_eq!(step.success_criteria, "");
    }

    #[test]
    fn openai_schema_omits_empty_required() {
        let def = ToolDefinition {
            name: "scan".to_string(),
            description: "List files".to_string(),
            parameters: vec![],
        };
        let schema = def.to_openai_schema();
        assert_eq!(schema["function"]["name"], "scan");
        assert!(schema["function"]["parameters"].get("required").is_none());
    }

    #[test]
    fn openai_schema_lists_required_parameters() {
        let def = ToolDefinition {
            name: "save".to_string(),
            description: "Save a file".to_string(),
            parameters: vec![
                ToolParameter::required("filename", "string", "target"),
                ToolParameter::optional("append", "boolean", "append mode")
                    .with_default(serde_json::json!(false)),
            ],
        };
        let schema = def.to_openai_schema();
        let params = &schema["function"]["parameters"];
        assert_eq!(params["required"], serde_json::json!(["filename"]));
        assert_eq!(params["properties"]["append"]["default"], false);
    }

    #[test]
    fn tool_calls_get_unique_ids() {
        let a = ToolCall::new("x", serde_json::json!({}), "agent");
        let b = ToolCall::new("x", serde_json::json!({}), "agent");
        assert_ne!(a.call_id, b.call_id);
        assert!(a.call_id.starts_with("call_"));
    }

    #[test]
    fn role_serializes_lowercase() {
        let msg = Message::tool("observation");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
    }
}
