use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::{Tool, ToolOutput, str_arg};
use crate::core::protocol::{ToolDefinition, ToolParameter};
use crate::core::sandbox::CodeSandbox;

/// Exposes the Code Sandbox to agents. A run that exhausts its attempts is
/// still `Ok`; the model reads `success: false` from the output.
pub struct PythonExecutionTool {
    sandbox: Arc<CodeSandbox>,
}

impl PythonExecutionTool {
    pub fn new(sandbox: Arc<CodeSandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Tool for PythonExecutionTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "python_execution".to_string(),
            description: "Executes a Python analysis task end-to-end in a sandbox. Provide a \
                natural-language task description; the tool generates the code, runs it in the \
                workspace directory and repairs it from the error output until it succeeds. \
                Mention required input files, the analytical steps, and the tables or plots to \
                produce with their filenames. Successful runs save the generated script in the \
                workspace."
                .to_string(),
            parameters: vec![
                ToolParameter::required(
                    "task_description",
                    "string",
                    "Self-contained description of the analysis: data sources, processing steps, \
                     output file names, metrics and plots.",
                ),
                ToolParameter::optional(
                    "session_id",
                    "string",
                    "Identifier used to label the generation session.",
                ),
                ToolParameter::optional(
                    "preferred_source_name",
                    "string",
                    "Base name for the saved script; the final name is '<name>_<timestamp>.py'.",
                ),
            ],
        }
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput> {
        let task = str_arg(&args, "task_description")?;
        let session_id = args.get("session_id").and_then(Value::as_str);
        let preferred = args.get("preferred_source_name").and_then(Value::as_str);

        let report = self.sandbox.execute(task, session_id, preferred).await?;
        Ok(ToolOutput::new(report.to_json()).with_artifacts(report.artifacts()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::llm::Completion;
    use crate::core::llm::scripted::ScriptedBackend;
    use crate::core::sandbox::runner::scripted::{ScriptedRunner, failed, ok};
    use serde_json::json;

    #[tokio::test]
    async fn tool_reports_attempts_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(ScriptedBackend::new(vec![
            Completion::text("```python\nopen('x.csv')\n```"),
            Completion::text("```python\nopen('x.csv','w')\n```"),
        ]));
        let runner = Arc::new(ScriptedRunner::new(vec![
            failed("FileNotFoundError: x.csv"),
            ok("", &["x.csv"]),
        ]));
        let sandbox = Arc::new(CodeSandbox::new(backend, runner, dir.path()));
        let tool = PythonExecutionTool::new(sandbox);

        let out = tool
            .execute(json!({"task_description": "create x.csv", "preferred_source_name": "make_x"}))
            .await
            .unwrap();
        assert_eq!(out.output["success"], true);
        assert_eq!(out.output["total_attempts"], 2);
        assert_eq!(out.output["attempts"][0]["success"], false);
        assert_eq!(out.artifacts[0], "x.csv");
        assert!(out.artifacts[1].starts_with("make_x_"));
    }

    #[tokio::test]
    async fn missing_task_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Arc::new(CodeSandbox::new(
            Arc::new(ScriptedBackend::new(vec![])),
            Arc::new(ScriptedRunner::new(vec![])),
            dir.path(),
        ));
        let tool = PythonExecutionTool::new(sandbox);
        assert!(tool.execute(json!({})).await.is_err());
    }
}
