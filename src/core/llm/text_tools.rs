//! Tool calling for models without a native function-calling API: tool
//! definitions are rendered into the prompt and the reply is scanned for
//! `{"action": "tool_call", ...}` objects, fenced or inline.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use super::RequestedToolCall;
use crate::core::protocol::ToolDefinition;

static FENCED_JSON: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```json\s*(\{[\s\S]*?\})\s*```").expect("literal regex"));


pub fn format_tools_as_text(tools: &[ToolDefinition]) -> String {
    let mut lines = Vec::new();
    for tool in tools {
        lines.push(format!("\n{}:", tool.name));
        lines.push(format!("  Description: {}", tool.description));
        lines.push("  Parameters:".to_string());
        for param in &tool.parameters {
            let required = if param.required {
                " (required)"
            } else {
                " (optional)"
            };
            lines.push(format!(
                "    - {} ({}){}: {}",
                param.name, param.kind, required, param.description
            ));
        }
    }
    lines.join("\n")
}

pub fn tool_instruction(tools: &[ToolDefinition]) -> String {
    format!(
        r#"

You have access to the following tools. To use a tool, respond with JSON in this EXACT format:
```json
{{
  "action": "tool_call",
  "tool": "tool_name",
  "arguments": {{
    "arg1": "value1",
    "arg2": "value2"
  }}
}}
```

Available tools:
{}

IMPORTANT:
- Always use the exact JSON format shown above
- Put the JSON in a code block with ```json
- After using a tool, you'll receive the result and can continue reasoning
"#,
        format_tools_as_text(tools)
    )
}

fn as_tool_call(data: &Value, require_action: bool) -> Option<RequestedToolCall> {
    if require_action && data.get("action").and_then(Value::as_str) != Some("tool_call") {
        return None;
    }
    let name = data.get("tool")?.as_str()?;
    let arguments = data.get("arguments")?.clone();
    Some(RequestedToolCall {
        name: name.to_string(),
        arguments,
    })
}

/// Fenced objects first; bare inline objects only when no fenced call was found.
pub fn parse_text_tool_calls(content: &str) -> Vec<RequestedToolCall> {
    let mut calls = Vec::new();

    for caps in FENCED_JSON.captures_iter(content) {
        match serde_json::from_str::<Value>(&caps[1]) {
            Ok(data) => {
                if let Some(call) = as_tool_call(&data, true) {
                    calls.push(call);
                }
            }
            Err(e) => warn!("Failed to parse tool call JSON: {}", e),
        }
    }

    if calls.is_empty() {
        calls = scan_bare_tool_calls(content);
    }

    calls
}

/// Tries a JSON value at every `{`; a matched call resumes the scan after its
/// closing brace so nested `arguments` objects are not re-read.
fn scan_bare_tool_calls(content: &str) -> Vec<RequestedToolCall> {
    let mut calls = Vec::new();
    let mut pos = 0;
    while let Some(offset) = content[pos..].find('{') {
        let start = pos + offset;
        let mut stream = serde_json::Deserializer::from_str(&content[start..]).into_iter::<Value>();
        if let Some(Ok(data)) = stream.next()
            && let Some(call) = as_tool_call(&data, true)
        {
            calls.push(call);
            pos = start + stream.byte_offset();
            continue;
        }
        pos = start + 1;
    }
    calls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ToolParameter;
    use serde_json::json;

    #[test]
    fn parses_fenced_tool_call() {
        let reply = "I will save it.\n```json\n{\"action\": \"tool_call\", \"tool\": \"file_saver\", \"arguments\": {\"filename\": \"a.txt\", \"content\": \"x\"}}\n```";
        let calls = parse_text_tool_calls(reply);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "file_saver");
        assert_eq!(calls[0].arguments["filename"], "a.txt");
    }

    #[test]
    fn ignores_fenced_objects_without_tool_call_action() {
        let reply = "```json\n{\"result\": 42}\n```";
        assert!(parse_text_tool_calls(reply).is_empty());
    }

    #[test]
    fn falls_back_to_bare_object() {
        let reply = r#"Calling {"action": "tool_call", "tool": "file_system_scanner", "arguments": null} now"#;
        let calls = parse_text_tool_calls(reply);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arguments, json!(null));
    }

    #[test]
    fn bare_object_with_nested_arguments() {
        let reply = r#"I will save it. {"action": "tool_call", "tool": "file_saver", "arguments": {"filename": "a.md", "content": "x"}}"#;
        let calls = parse_text_tool_calls(reply);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "file_saver");
        assert_eq!(calls[0].arguments, json!({"filename": "a.md", "content": "x"}));
    }

    #[test]
    fn bare_scan_skips_unrelated_braces() {
        let reply = r#"Stats {mean: 2} then {"note": 1} and {"action": "tool_call", "tool": "find_in_file", "arguments": {"filename": "r.md", "query": "{x}"}} done {"action": "tool_call", "tool": "file_system_scanner", "arguments": {}}"#;
        let calls = parse_text_tool_calls(reply);
        let names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["find_in_file", "file_system_scanner"]);
        assert_eq!(calls[0].arguments["query"], "{x}");
    }

    #[test]
    fn plain_prose_yields_nothing() {
        assert!(parse_text_tool_calls("The mean is 3.2.").is_empty());
    }

    #[test]
    fn instruction_lists_parameters() {
        let tools = vec![ToolDefinition {
            name: "find_in_file".to_string(),
            description: "Search a file".to_string(),
            parameters: vec![
                ToolParameter::required("filename", "string", "file"),
                ToolParameter::optional("context_lines", "integer", "lines around"),
            ],
        }];
        let text = tool_instruction(&tools);
        assert!(text.contains("\"action\": \"tool_call\""));
        assert!(text.contains("- filename (string) (required): file"));
        assert!(text.contains("- context_lines (integer) (optional): lines around"));
    }
}
