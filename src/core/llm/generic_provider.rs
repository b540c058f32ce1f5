use anyhow::{Result, anyhow};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::registry::{ProviderDef, ProviderRegistry};
use super::text_tools::{parse_text_tool_calls, tool_instruction};
use super::{Completion, CompletionRequest, ReasoningBackend, RequestedToolCall};
use crate::core::config::{LlmConfig, ToolProtocol};
use crate::core::protocol::{Message, Role, ToolDefinition};

// ── OpenAI-compatible request/response ──

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Deserialize)]
struct ResponseToolCall {
    function: ResponseFunction,
}

#[derive(Deserialize)]
struct ResponseFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

enum PostOutcome {
    Parsed(ChatResponse),
    Rejected(StatusCode, String),
}

// ── Generic Provider ──

/// Any chat-completions compatible endpoint from the provider registry.
pub struct GenericProvider {
    provider_def: ProviderDef,
    model: String,
    api_key: String,
    protocol: ToolProtocol,
    client: Client,
}

impl GenericProvider {
    pub fn new(
        provider_def: ProviderDef,
        model: &str,
        api_key: String,
        protocol: ToolProtocol,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            provider_def,
            model: model.to_string(),
            api_key,
            protocol,
            client,
        })
    }

    /// Builds the main backend, or the code backend when `for_code` is set.
    pub fn from_config(llm: &LlmConfig, for_code: bool) -> Result<Self> {
        let registry = ProviderRegistry::load()?;
        let provider_id = if for_code {
            llm.code_provider()
        } else {
            &llm.provider
        };
        let mut def = registry
            .get_provider(provider_id)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown LLM provider '{}'", provider_id))?;
        if let Some(url) = &llm.base_url {
            def.base_url = url.clone();
        }
        let model = if for_code {
            llm.code_model()
        } else {
            &llm.model
        };
        let api_key = def.resolve_api_key(llm.api_key.as_deref())?;
        info!("Using {} ({}) for {}", def.name, model, if for_code { "code" } else { "agents" });
        Self::new(
            def,
            model,
            api_key,
            llm.tool_protocol,
            Duration::from_secs(llm.request_timeout_secs),
        )
    }

    fn use_text_tools(&self, tools: &[ToolDefinition]) -> bool {
        if tools.is_empty() {
            return false;
        }
        match self.protocol {
            ToolProtocol::Text => true,
            ToolProtocol::Native => false,
            ToolProtocol::Auto => self.model.to_lowercase().contains("deepseek"),
        }
    }

    async fn post(&self, request: &CompletionRequest, text_mode: bool) -> Result<PostOutcome> {
        let mut messages = to_wire_messages(&request.messages);
        let (tools, tool_choice) = if text_mode {
            attach_tool_instruction(&mut messages, &request.tools);
            debug!("Using text-based tool calling for {} tools", request.tools.len());
            (None, None)
        } else if request.tools.is_empty() {
            (None, None)
        } else {
            let schemas = request.tools.iter().map(|t| t.to_openai_schema()).collect();
            (Some(schemas), Some("auto"))
        };

        let body = ChatRequest {
            model: &self.model,
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream: false,
            tools,
            tool_choice,
        };

        let mut req = self.client.post(&self.provider_def.base_url).json(&body);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }
        for (k, v) in &self.provider_def.extra_headers {
            req = req.header(k, v);
        }

        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            return Ok(PostOutcome::Rejected(
                status,
                res.text().await.unwrap_or_default(),
            ));
        }
        Ok(PostOutcome::Parsed(res.json().await?))
    }
}

#[async_trait]
impl ReasoningBackend for GenericProvider {
    fn name(&self) -> &str {
        &self.provider_def.id
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let text_mode = self.use_text_tools(&request.tools);
        match self.post(&request, text_mode).await? {
            PostOutcome::Parsed(parsed) => parse_response(parsed, text_mode),
            PostOutcome::Rejected(status, body)
                if status == StatusCode::BAD_REQUEST && !text_mode && !request.tools.is_empty() =>
            {
                warn!(
                    "{} rejected native tool calling ({}), retrying with text-based tools",
                    self.provider_def.name, body
                );
                match self.post(&request, true).await? {
                    PostOutcome::Parsed(parsed) => parse_response(parsed, true),
                    PostOutcome::Rejected(status, body) => Err(self.api_error(status, &body)),
                }
            }
            PostOutcome::Rejected(status, body) => Err(self.api_error(status, &body)),
        }
    }
}

impl GenericProvider {
    fn api_error(&self, status: StatusCode, body: &str) -> anyhow::Error {
        anyhow!("{} API Error: {} - {}", self.provider_def.name, status, body)
    }
}

/// `tool` role observations travel as user turns; executor transcripts carry
/// no tool-call ids for a native `tool` message to reference.
fn to_wire_messages(messages: &[Message]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| match m.role {
            Role::Tool => WireMessage {
                role: "user",
                content: format!("[Tool Result]\n{}", m.content),
            },
            role => WireMessage {
                role: role.as_str(),
                content: m.content.clone(),
            },
        })
        .collect()
}

fn attach_tool_instruction(messages: &mut Vec<WireMessage>, tools: &[ToolDefinition]) {
    let instruction = tool_instruction(tools);
    match messages.last_mut() {
        Some(last) if last.role == "user" => last.content.push_str(&instruction),
        _ => messages.push(WireMessage {
            role: "user",
            content: instruction.trim_start().to_string(),
        }),
    }
}

fn parse_arguments(name: &str, raw: Value) -> Value {
    match raw {
        Value::String(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
            warn!("Unparseable arguments for tool '{}': {}", name, e);
            Value::Object(Default::default())
        }),
        Value::Null => Value::Object(Default::default()),
        other => other,
    }
}

fn parse_response(parsed: ChatResponse, text_mode: bool) -> Result<Completion> {
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("LLM response contained no choices"))?;

    let text = choice.message.content.unwrap_or_default();
    info!("LLM response: {}", text.chars().take(50).collect::<String>());

    let mut tool_calls: Vec<RequestedToolCall> = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| RequestedToolCall {
            arguments: parse_arguments(&tc.function.name, tc.function.arguments),
            name: tc.function.name,
        })
        .collect();

    if tool_calls.is_empty() && text_mode && !text.is_empty() {
        tool_calls = parse_text_tool_calls(&text);
        if !tool_calls.is_empty() {
            debug!("Parsed {} tool calls from text response", tool_calls.len());
        }
    }

    Ok(Completion {
        text,
        tool_calls,
        stop_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ToolParameter;
    use serde_json::json;

    fn response(json: Value) -> ChatResponse {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn tool_messages_become_user_turns() {
        let wire = to_wire_messages(&[
            Message::system("sys"),
            Message::assistant("Using tool: file_saver"),
            Message::tool("Tool 'file_saver' succeeded: {}"),
        ]);
        assert_eq!(wire[0].role, "system");
        assert_eq!(wire[2].role, "user");
        assert!(wire[2].content.starts_with("[Tool Result]\n"));
    }

    #[test]
    fn text_instruction_is_appended_to_last_user_message() {
        let mut wire = to_wire_messages(&[Message::system("sys"), Message::user("do it")]);
        let tools = vec![ToolDefinition {
            name: "file_saver".to_string(),
            description: "Save".to_string(),
            parameters: vec![ToolParameter::required("filename", "string", "name")],
        }];
        attach_tool_instruction(&mut wire, &tools);
        assert_eq!(wire.len(), 2);
        assert!(wire[1].content.starts_with("do it"));
        assert!(wire[1].content.contains("file_saver:"));
    }

    #[test]
    fn native_tool_call_arguments_are_decoded() {
        let parsed = response(json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "x",
                        "type": "function",
                        "function": {"name": "find_in_file", "arguments": "{\"filename\":\"a.md\",\"query\":\"alpha\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }));
        let completion = parse_response(parsed, false).unwrap();
        assert_eq!(completion.text, "");
        assert_eq!(completion.tool_calls[0].arguments["query"], "alpha");
        assert_eq!(completion.stop_reason, "tool_calls");
    }

    #[test]
    fn broken_argument_string_becomes_empty_object() {
        let parsed = response(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"name": "t", "arguments": "{not json"}}]
                }
            }]
        }));
        let completion = parse_response(parsed, false).unwrap();
        assert_eq!(completion.tool_calls[0].arguments, json!({}));
        assert_eq!(completion.stop_reason, "stop");
    }

    #[test]
    fn text_mode_scans_content_for_tool_calls() {
        let parsed = response(json!({
            "choices": [{
                "message": {
                    "content": "```json\n{\"action\":\"tool_call\",\"tool\":\"file_system_scanner\",\"arguments\":{}}\n```"
                }
            }]
        }));
        let completion = parse_response(parsed, true).unwrap();
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "file_system_scanner");
    }

    #[test]
    fn empty_choices_is_an_error() {
        assert!(parse_response(response(json!({"choices": []})), false).is_err());
    }

    /// Serves one canned HTTP response per connection and hands back the
    /// request bodies it received.
    async fn serve_responses(
        responses: Vec<(u16, String)>,
    ) -> (String, tokio::task::JoinHandle<Vec<Value>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/v1/chat/completions", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut bodies = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                let body_start = loop {
                    let n = socket.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "connection closed before headers");
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(i) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break i + 4;
                    }
                };
                let head = String::from_utf8_lossy(&buf[..body_start]).to_lowercase();
                let length: usize = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .map(|v| v.trim().parse().unwrap())
                    .unwrap_or(0);
                while buf.len() < body_start + length {
                    let n = socket.read(&mut chunk).await.unwrap();
                    assert!(n > 0, "connection closed before body");
                    buf.extend_from_slice(&chunk[..n]);
                }
                bodies.push(serde_json::from_slice(&buf[body_start..body_start + length]).unwrap());

                let reply = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            bodies
        });
        (url, handle)
    }

    #[tokio::test]
    async fn rejected_native_tools_retry_with_text_protocol() {
        let text_reply = json!({
            "choices": [{
                "message": {
                    "content": "Scanning first.\n```json\n{\"action\": \"tool_call\", \"tool\": \"find_in_file\", \"arguments\": {\"filename\": \"a.md\", \"query\": \"alpha\"}}\n```"
                },
                "finish_reason": "stop"
            }]
        });
        let (url, server) = serve_responses(vec![
            (400, r#"{"error": "tools not supported"}"#.to_string()),
            (200, text_reply.to_string()),
        ])
        .await;

        let def = ProviderDef {
            id: "local".to_string(),
            name: "Local".to_string(),
            base_url: url,
            api_key_env: None,
            default_model: "m".to_string(),
            models: vec![],
            extra_headers: Default::default(),
        };
        let provider = GenericProvider::new(
            def,
            "Qwen/Qwen2.5-72B-Instruct",
            String::new(),
            ToolProtocol::Native,
            Duration::from_secs(10),
        )
        .unwrap();
        let tools = vec![ToolDefinition {
            name: "find_in_file".to_string(),
            description: "Search a file".to_string(),
            parameters: vec![ToolParameter::required("filename", "string", "file")],
        }];
        let request = CompletionRequest::new(vec![Message::user("look for alpha")]).with_tools(tools);

        let completion = provider.complete(request).await.unwrap();
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "find_in_file");
        assert_eq!(completion.tool_calls[0].arguments["query"], "alpha");

        let bodies = server.await.unwrap();
        assert_eq!(bodies.len(), 2);
        assert!(bodies[0].get("tools").is_some());
        assert!(bodies[1].get("tools").is_none());
        assert!(bodies[1].get("tool_choice").is_none());
        let last = bodies[1]["messages"].as_array().unwrap().last().unwrap().clone();
        assert!(last["content"].as_str().unwrap().contains("\"action\": \"tool_call\""));
    }

    #[test]
    fn auto_protocol_uses_text_for_deepseek_models() {
        let registry = ProviderRegistry::load().unwrap();
        let def = registry.get_provider("siliconflow").unwrap().clone();
        let tools = vec![ToolDefinition {
            name: "t".to_string(),
            description: "d".to_string(),
            parameters: vec![],
        }];
        let provider = GenericProvider::new(
            def.clone(),
            "deepseek-ai/DeepSeek-V3.1-Terminus",
            String::new(),
            ToolProtocol::Auto,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(provider.use_text_tools(&tools));
        assert!(!provider.use_text_tools(&[]));

        let provider = GenericProvider::new(
            def,
            "Qwen/Qwen2.5-72B-Instruct",
            String::new(),
            ToolProtocol::Auto,
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!provider.use_text_tools(&tools));
    }
}
