//! Code Sandbox: turns a natural-language analysis task into one generated
//! script, runs it in a subprocess, and feeds diagnostics back to the model
//! until an attempt succeeds or the attempt ceiling is reached.

pub mod runner;

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::llm::{CompletionRequest, ReasoningBackend};
use crate::core::protocol::{Message, SandboxAttempt};
use runner::CodeRunner;

pub const DEFAULT_MAX_ATTEMPTS: usize = 10;
const OUTPUT_LIMIT: usize = 2000;
const CODE_LIMIT: usize = 6000;

static PYTHON_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```python\s*(.*?)```").expect("literal regex"));
static ANY_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:[A-Za-z0-9_+-]*\r?\n)?(.*?)```").expect("literal regex")
});
static SLUG_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("literal regex"));
static NAME_SEPARATORS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9_-]+").expect("literal regex"));

const SYSTEM_PROMPT: &str = "You are a senior quantitative developer working inside a restricted Python sandbox. Generate a complete Python script that fulfills the user's task description inside a single code block. Follow these rules strictly:

MANDATORY PRACTICES FOR DATA ANALYSIS:
1. Always print() intermediate steps and results (data loading confirmations, calculation steps, key statistics, final metrics).
2. Always save analysis results to files: tables as CSV, figures as PNG saved with plt.savefig(...) followed by plt.close().
3. Choose filenames that clearly communicate content (e.g. 'processed_data.csv', 'strategy_performance.png') and print a confirmation for every file written.
4. Back every quantitative conclusion with data exploration.

ADDITIONAL REQUIREMENTS:
- The current working directory is the session workspace; reference local files with relative paths.
- Respond with exactly one Python code block and no surrounding prose.
- The code must be self-contained and restartable; import every library it uses.
- Avoid deprecated pandas APIs.
- Check for input files and raise informative errors when they are missing.
- Write files only inside the current working directory; do not create subdirectories.
- Do not generate assertions or test cases, even if the task mentions success criteria.";

/// Full history of one sandbox invocation.
#[derive(Debug, Clone)]
pub struct SandboxReport {
    pub session_id: String,
    pub task_description: String,
    pub success: bool,
    pub attempts: Vec<SandboxAttempt>,
    pub max_attempts: usize,
    /// Workspace-relative name of the persisted script, on success.
    pub persisted_code: Option<String>,
}

impl SandboxReport {
    pub fn final_attempt(&self) -> Option<&SandboxAttempt> {
        self.attempts.last()
    }

    pub fn artifacts(&self) -> Vec<String> {
        let mut artifacts: Vec<String> = self
            .final_attempt()
            .map(|a| a.files_created.clone())
            .unwrap_or_default();
        if let Some(code) = &self.persisted_code {
            artifacts.push(code.clone());
        }
        artifacts
    }

    pub fn to_json(&self) -> Value {
        let last = self.final_attempt();
        json!({
            "success": self.success,
            "session_id": self.session_id,
            "total_attempts": self.attempts.len(),
            "max_attempts": self.max_attempts,
            "return_code": last.and_then(|a| a.return_code),
            "timed_out": last.map(|a| a.timed_out).unwrap_or(false),
            "stdout": truncate(last.map(|a| a.stdout.as_str()).unwrap_or(""), OUTPUT_LIMIT),
            "stderr": truncate(last.map(|a| a.stderr.as_str()).unwrap_or(""), OUTPUT_LIMIT),
            "files_created": last.map(|a| a.files_created.clone()).unwrap_or_default(),
            "persisted_code": self.persisted_code,
            "attempts": self.attempts.iter().map(|a| json!({
                "attempt": a.attempt_index,
                "success": a.success,
                "return_code": a.return_code,
                "timed_out": a.timed_out,
                "duration_ms": a.duration_ms,
                "files_created": a.files_created,
                "stderr": truncate(&a.stderr, 500),
            })).collect::<Vec<_>>(),
        })
    }
}

pub struct CodeSandbox {
    backend: Arc<dyn ReasoningBackend>,
    runner: Arc<dyn CodeRunner>,
    workspace: PathBuf,
    max_attempts: usize,
    temperature: f32,
    max_tokens: u32,
}

impl CodeSandbox {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        runner: Arc<dyn CodeRunner>,
        workspace: &Path,
    ) -> Self {
        Self {
            backend,
            runner,
            workspace: workspace.to_path_buf(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            temperature: 0.2,
            max_tokens: 2048,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_generation(mut self, temperature: f32, max_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }

    pub async fn execute(
        &self,
        task_description: &str,
        session_id: Option<&str>,
        preferred_source_name: Option<&str>,
    ) -> Result<SandboxReport> {
        let task = task_description.trim();
        if task.is_empty() {
            bail!("task_description is required and cannot be empty");
        }
        let session_id = session_id
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let short_id: String = session_id.chars().take(8).collect();

        let mut messages = vec![
            Message::system(SYSTEM_PROMPT),
            Message::user(format!(
                "You are preparing code for session {} inside the analysis sandbox.\n\
                 Task description:\n{}\n\nReturn only the Python code block.",
                short_id, task
            )),
        ];
        let mut attempts: Vec<SandboxAttempt> = Vec::new();

        for attempt_index in 1..=self.max_attempts {
            info!(
                "Attempt {}/{} for session {}",
                attempt_index, self.max_attempts, short_id
            );

            let request = CompletionRequest::new(messages.clone())
                .with_temperature(self.temperature)
                .with_max_tokens(self.max_tokens);
            let completion = self.backend.complete(request).await?;
            let raw = completion.text.trim().to_string();
            messages.push(Message::assistant(raw.clone()));

            let attempt = match extract_code_block(&raw) {
                None => {
                    warn!("Attempt {} returned no code block", attempt_index);
                    SandboxAttempt {
                        attempt_index,
                        generated_code: String::new(),
                        stdout: String::new(),
                        stderr: "The response did not contain a fenced code block.".to_string(),
                        return_code: None,
                        files_created: Vec::new(),
                        duration_ms: 0,
                        timed_out: false,
                        success: false,
                    }
                }
                Some(code) => match self.runner.run(&code, &self.workspace).await {
                    Err(e) => {
                        warn!("Attempt {} could not be run: {:#}", attempt_index, e);
                        SandboxAttempt {
                            attempt_index,
                            generated_code: code,
                            stdout: String::new(),
                            stderr: format!("Sandbox runner error: {:#}", e),
                            return_code: None,
                            files_created: Vec::new(),
                            duration_ms: 0,
                            timed_out: false,
                            success: false,
                        }
                    }
                    Ok(outcome) => {
                        let success = outcome.succeeded();
                        if success {
                            info!("Attempt {} succeeded in {}ms", attempt_index, outcome.duration_ms);
                        } else {
                            warn!(
                                "Attempt {} failed (return code {:?}): {}",
                                attempt_index,
                                outcome.return_code,
                                truncate(&outcome.stderr, 300)
                            );
                        }
                        SandboxAttempt {
                            attempt_index,
                            generated_code: code,
                            stdout: outcome.stdout,
                            stderr: outcome.stderr,
                            return_code: outcome.return_code,
                            files_created: outcome.files_created,
                            duration_ms: outcome.duration_ms,
                            timed_out: outcome.timed_out,
                            success,
                        }
                    }
                },
            };

            let success = attempt.success;
            attempts.push(attempt);
            if success {
                break;
            }
            if attempt_index < self.max_attempts {
                messages.push(Message::user(build_feedback_prompt(
                    &attempts,
                    self.max_attempts,
                )));
            }
        }

        let success = attempts.last().is_some_and(|a| a.success);
        let mut persisted_code = None;
        if let Some(last) = attempts.last().filter(|a| a.success) {
            persisted_code = Some(persist_generated_code(
                &self.workspace,
                &last.generated_code,
                task,
                preferred_source_name,
                Utc::now(),
            )
            .await?);
        } else {
            error!(
                "All {} attempts failed for session {}",
                attempts.len(),
                short_id
            );
        }

        Ok(SandboxReport {
            session_id,
            task_description: task.to_string(),
            success,
            attempts,
            max_attempts: self.max_attempts,
            persisted_code,
        })
    }
}

/// One fenced block: a `python` tagged block wins over any other fence.
pub fn extract_code_block(content: &str) -> Option<String> {
    PYTHON_BLOCK
        .captures(content)
        .or_else(|| ANY_BLOCK.captures(content))
        .map(|caps| caps[1].trim().to_string())
        .filter(|code| !code.is_empty())
}

fn truncate(value: &str, limit: usize) -> String {
    let value = value.trim();
    if value.chars().count() <= limit {
        return value.to_string();
    }
    let kept: String = value.chars().take(limit.saturating_sub(3)).collect();
    format!("{}...", kept)
}

/// Next user turn after a failed attempt, derived only from the history.
pub fn build_feedback_prompt(attempts: &[SandboxAttempt], max_attempts: usize) -> String {
    let Some(last) = attempts.last() else {
        return "Return only the Python code block.".to_string();
    };
    let remaining = max_attempts.saturating_sub(last.attempt_index);

    if last.generated_code.is_empty() {
        return format!(
            "The previous response (attempt {} of {}) did not contain a fenced Python code block. \
             {} attempts remain. Respond with exactly one ```python code block and no prose.",
            last.attempt_index, max_attempts, remaining
        );
    }

    let or_empty = |s: String| if s.is_empty() { "<empty>".to_string() } else { s };
    let stdout = or_empty(truncate(&last.stdout, OUTPUT_LIMIT));
    let stderr = or_empty(truncate(&last.stderr, OUTPUT_LIMIT));
    let code = truncate(&last.generated_code, CODE_LIMIT);
    let files = if last.files_created.is_empty() {
        "none".to_string()
    } else {
        last.files_created.join(", ")
    };
    let status = if last.timed_out {
        "timed out and was terminated".to_string()
    } else {
        match last.return_code {
            Some(code) => format!("exited with return_code {}", code),
            None => "exited without a return code".to_string(),
        }
    };

    format!(
        "The previous code attempt (attempt {} of {}) {} and did not complete successfully. \
         {} attempts remain.\n\
         Files created: {}.\n\
         Please analyze the diagnostics below, incorporate any useful progress (e.g., existing files), \
         revise the previous code rather than starting from scratch, and respond with a corrected, \
         self-contained Python code block that follows all sandbox rules.\n\n\
         Previous attempt code:\n```python\n{}\n```\n\n\
         STDOUT:\n```text\n{}\n```\n\n\
         STDERR:\n```text\n{}\n```",
        last.attempt_index, max_attempts, status, remaining, files, code, stdout, stderr
    )
}

fn source_slug(task_description: &str, preferred: Option<&str>) -> String {
    let base = match preferred.map(str::trim).filter(|p| !p.is_empty()) {
        Some(name) => NAME_SEPARATORS
            .replace_all(name.trim_end_matches(".py"), "_")
            .trim_matches('_')
            .to_string(),
        None => SLUG_SEPARATORS
            .replace_all(&task_description.to_lowercase(), "_")
            .trim_matches('_')
            .to_string(),
    };
    let base: String = base.chars().take(80).collect();
    if base.is_empty() {
        "python_task".to_string()
    } else {
        base
    }
}

/// Writes `<slug>_<YYYYmmddHHMMSS>.py`, appending `_1`, `_2`, ... on collision.
pub async fn persist_generated_code(
    workspace: &Path,
    code: &str,
    task_description: &str,
    preferred_source_name: Option<&str>,
    now: DateTime<Utc>,
) -> Result<String> {
    tokio::fs::create_dir_all(workspace).await?;
    let base = format!(
        "{}_{}",
        source_slug(task_description, preferred_source_name),
        now.format("%Y%m%d%H%M%S")
    );
    let mut filename = format!("{}.py", base);
    let mut counter = 1;
    while tokio::fs::try_exists(workspace.join(&filename)).await? {
        filename = format!("{}_{}.py", base, counter);
        counter += 1;
    }
    tokio::fs::write(workspace.join(&filename), code).await?;
    info!("Saved generated code as {}", filename);
    Ok(filename)
}
