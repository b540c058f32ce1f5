pub mod generic_provider;
pub mod registry;
pub mod text_tools;

#[cfg(test)]
pub(crate) mod scripted;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::core::protocol::{Message, ToolDefinition};

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestedToolCall {
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<RequestedToolCall>,
    pub stop_reason: String,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            stop_reason: "stop".to_string(),
        }
    }

    pub fn with_tool_call(mut self, name: &str, arguments: Value) -> Self {
        self.tool_calls.push(RequestedToolCall {
            name: name.to_string(),
            arguments,
        });
        self.stop_reason = "tool_calls".to_string();
        self
    }
}

/// The remote reasoning service. Implementations own transport and any
/// tool-calling fallbacks; callers only see text plus requested tool calls.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;
}
