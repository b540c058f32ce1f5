use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::tools::files::scan_workspace;

/// One execution of generated code.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process never reported an exit status (timeout, signal).
    pub return_code: Option<i32>,
    pub files_created: Vec<String>,
    pub duration_ms: u64,
    pub timed_out: bool,
    /// Whether the final stdout line was the wrapper's summary record.
    pub summary_parsed: bool,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.summary_parsed && self.return_code == Some(0)
    }
}

#[async_trait]
pub trait CodeRunner: Send + Sync {
    async fn run(&self, code: &str, workspace: &Path) -> Result<RunOutcome>;
}

const WRAPPER_TEMPLATE: &str = r#"import base64
import io
import json
import os
import sys
import traceback
from contextlib import redirect_stderr, redirect_stdout

os.chdir(base64.b64decode('__WORKSPACE_B64__').decode('utf-8'))
files_before = set(os.listdir('.'))
stdout_buffer = io.StringIO()
stderr_buffer = io.StringIO()
user_code = base64.b64decode('__CODE_B64__').decode('utf-8')
return_code = 0

try:
    with redirect_stdout(stdout_buffer), redirect_stderr(stderr_buffer):
        exec(compile(user_code, '<generated>', 'exec'), {'__name__': '__main__'})
except SystemExit as exc:
    if exc.code not in (None, 0):
        return_code = 1
        stderr_buffer.write('SystemExit: ' + str(exc.code) + chr(10))
except BaseException:
    return_code = 1
    stderr_buffer.write(traceback.format_exc())

files_after = set(os.listdir('.'))
summary = {
    'stdout': stdout_buffer.getvalue(),
    'stderr': stderr_buffer.getvalue(),
    'files_created': sorted(files_after - files_before),
    'return_code': return_code,
}
sys.stdout.write(chr(10) + json.dumps(summary) + chr(10))
sys.stdout.flush()
sys.exit(return_code)
"#;

/// Python wrapper that runs `code` inside `workspace` and prints the summary
/// record as its last stdout line. Both values travel base64-encoded.
pub fn wrapper_script(code: &str, workspace: &Path) -> String {
    WRAPPER_TEMPLATE
        .replace(
            "__WORKSPACE_B64__",
            &B64.encode(workspace.to_string_lossy().as_bytes()),
        )
        .replace("__CODE_B64__", &B64.encode(code.as_bytes()))
}

#[derive(Deserialize)]
struct WrapperSummary {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    #[serde(default)]
    files_created: Vec<String>,
    return_code: i32,
}

/// Decodes raw process output. The summary is only trusted when it is the
/// last non-empty stdout line.
pub fn interpret_output(raw_stdout: &str, raw_stderr: &str, exit_code: Option<i32>) -> RunOutcome {
    let summary = raw_stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .and_then(|l| serde_json::from_str::<WrapperSummary>(l.trim()).ok());

    match summary {
        Some(s) => {
            let mut stderr = s.stderr;
            if !raw_stderr.trim().is_empty() {
                if !stderr.is_empty() && !stderr.ends_with('\n') {
                    stderr.push('\n');
                }
                stderr.push_str(raw_stderr);
            }
            let return_code = match exit_code {
                Some(0) => Some(s.return_code),
                other => other,
            };
            RunOutcome {
                stdout: s.stdout,
                stderr,
                return_code,
                files_created: s.files_created,
                summary_parsed: true,
                ..Default::default()
            }
        }
        None => RunOutcome {
            stdout: raw_stdout.to_string(),
            stderr: raw_stderr.to_string(),
            return_code: exit_code,
            summary_parsed: false,
            ..Default::default()
        },
    }
}

async fn file_names(workspace: &Path) -> BTreeSet<String> {
    match scan_workspace(workspace).await {
        Ok(files) => files.into_iter().map(|f| f.name).collect(),
        Err(e) => {
            warn!("Could not inventory {:?}: {}", workspace, e);
            BTreeSet::new()
        }
    }
}

/// Runs code through an interpreter subprocess pinned to the workspace.
pub struct ProcessRunner {
    interpreter: String,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(interpreter: &str, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.to_string(),
            timeout,
        }
    }

    /// Executes an already wrapped script. The process is killed if it
    /// outlives the timeout.
    pub async fn run_script(&self, script: &str, workspace: &Path) -> Result<RunOutcome> {
        tokio::fs::create_dir_all(workspace).await?;
        let before = file_names(workspace).await;

        let script_path =
            std::env::temp_dir().join(format!("agentflow_{}.py", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&script_path, script).await?;

        let start = Instant::now();
        let child = Command::new(&self.interpreter)
            .arg(&script_path)
            .current_dir(workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(c) => c,
            Err(e) => {
                let _ = tokio::fs::remove_file(&script_path).await;
                return Err(anyhow::anyhow!(
                    "Failed to start interpreter '{}': {}",
                    self.interpreter,
                    e
                ));
            }
        };

        let waited = tokio::time::timeout(self.timeout, child.wait_with_output()).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        let _ = tokio::fs::remove_file(&script_path).await;

        let mut outcome = match waited {
            Err(_) => {
                warn!("Execution timed out after {}s, process killed", self.timeout.as_secs());
                RunOutcome {
                    stderr: format!(
                        "Execution timed out after {} seconds and was terminated.",
                        self.timeout.as_secs()
                    ),
                    timed_out: true,
                    ..Default::default()
                }
            }
            Ok(output) => {
                let output = output?;
                let stdout = String::from_utf8_lossy(&output.stdout);
                let stderr = String::from_utf8_lossy(&output.stderr);
                debug!("Interpreter exited with {:?}", output.status.code());
                interpret_output(&stdout, &stderr, output.status.code())
            }
        };

        let after = file_names(workspace).await;
        let mut created: BTreeSet<String> = after.difference(&before).cloned().collect();
        created.extend(outcome.files_created.drain(..));
        outcome.files_created = created.into_iter().collect();
        outcome.duration_ms = duration_ms;

        info!(
            "Execution finished in {}ms (return code {:?}, {} files created)",
            duration_ms,
            outcome.return_code,
            outcome.files_created.len()
        );
        Ok(outcome)
    }
}

#[async_trait]
impl CodeRunner for ProcessRunner {
    async fn run(&self, code: &str, workspace: &Path) -> Result<RunOutcome> {
        let absolute = if workspace.is_absolute() {
            workspace.to_path_buf()
        } else {
            std::env::current_dir()?.join(workspace)
        };
        self.run_script(&wrapper_script(code, &absolute), &absolute).await
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays outcomes in order and materializes their `files_created`
    /// inside the workspace.
    pub struct ScriptedRunner {
        outcomes: Mutex<VecDeque<RunOutcome>>,
        codes: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn new(outcomes: Vec<RunOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                codes: Mutex::new(Vec::new()),
            }
        }

        pub fn codes(&self) -> Vec<String> {
            self.codes.lock().unwrap().clone()
        }
    }

    pub fn ok(stdout: &str, files: &[&str]) -> RunOutcome {
        RunOutcome {
            stdout: stdout.to_string(),
            return_code: Some(0),
            files_created: files.iter().map(|f| f.to_string()).collect(),
            summary_parsed: true,
            duration_ms: 5,
            ..Default::default()
        }
    }

    pub fn failed(stderr: &str) -> RunOutcome {
        RunOutcome {
            stderr: stderr.to_string(),
            return_code: Some(1),
            summary_parsed: true,
            duration_ms: 5,
            ..Default::default()
        }
    }

    #[async_trait]
    impl CodeRunner for ScriptedRunner {
        async fn run(&self, code: &str, workspace: &Path) -> Result<RunOutcome> {
            self.codes.lock().unwrap().push(code.to_string());
            let outcome = self
                .outcomes
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("scripted runner exhausted"))?;
            for f in &outcome.files_created {
                std::fs::write(workspace.join(f), "")?;
            }
            Ok(outcome)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_on_last_line_is_decoded() {
        let stdout = "noise\n{\"stdout\": \"mean=2.5\\n\", \"stderr\": \"\", \"files_created\": [\"summary.csv\"], \"return_code\": 0}\n";
        let outcome = interpret_output(stdout, "", Some(0));
        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, "mean=2.5\n");
        assert_eq!(outcome.files_created, vec!["summary.csv"]);
    }

    #[test]
    fn missing_summary_fails_even_with_zero_exit() {
        let outcome = interpret_output("all good\n", "", Some(0));
        assert!(!outcome.summary_parsed);
        assert!(!outcome.succeeded());
        assert_eq!(outcome.stdout, "all good\n");
    }

    #[test]
    fn summary_not_on_last_line_is_ignored() {
        let stdout = "{\"stdout\": \"\", \"stderr\": \"\", \"files_created\": [], \"return_code\": 0}\ntrailing\n";
        assert!(!interpret_output(stdout, "", Some(0)).succeeded());
    }

    #[test]
    fn nonzero_exit_overrides_summary() {
        let stdout = "{\"stdout\": \"\", \"stderr\": \"boom\", \"files_created\": [], \"return_code\": 1}";
        let outcome = interpret_output(stdout, "", Some(1));
        assert_eq!(outcome.return_code, Some(1));
        assert_eq!(outcome.stderr, "boom");
        assert!(!outcome.succeeded());
    }

    #[test]
    fn wrapper_embeds_encoded_code_only() {
        let code = "print('it''s \"quoted\"')";
        let script = wrapper_script(code, Path::new("/tmp/ws"));
        assert!(!script.contains(code));
        assert!(script.contains(&B64.encode(code)));
        assert!(script.contains(&B64.encode("/tmp/ws")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_reports_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new("sh", Duration::from_secs(10));
        let script = "echo 1,2 > out.csv\necho '{\"stdout\": \"ok\", \"stderr\": \"\", \"files_created\": [], \"return_code\": 0}'\n";
        let outcome = runner.run_script(script, dir.path()).await.unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.files_created, vec!["out.csv"]);
        assert!(dir.path().join("out.csv").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_kills_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new("sh", Duration::from_millis(300));
        let started = Instant::now();
        let outcome = runner.run_script("sleep 5\n", dir.path()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(outcome.timed_out);
        assert_eq!(outcome.return_code, None);
        assert!(!outcome.succeeded());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_runner_surfaces_raw_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new("sh", Duration::from_secs(10));
        let outcome = runner
            .run_script("echo oops >&2\nexit 3\n", dir.path())
            .await
            .unwrap();
        assert_eq!(outcome.return_code, Some(3));
        assert_eq!(outcome.stderr.trim(), "oops");
        assert!(!outcome.summary_parsed);
    }

    #[tokio::test]
    async fn missing_interpreter_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new("definitely-not-an-interpreter-xyz", Duration::from_secs(1));
        assert!(runner.run("print(1)", dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn python_wrapper_round_trip_when_available() {
        let available = std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if !available {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new("python3", Duration::from_secs(30));

        let ok = runner
            .run("open('summary.csv', 'w').write('x\\n1\\n')\nprint('saved')", dir.path())
            .await
            .unwrap();
        assert!(ok.succeeded(), "{:?}", ok);
        assert_eq!(ok.stdout.trim(), "saved");
        assert_eq!(ok.files_created, vec!["summary.csv"]);

        let failed = runner
            .run("open('missing.csv').read()", dir.path())
            .await
            .unwrap();
        assert!(!failed.succeeded());
        assert_eq!(failed.return_code, Some(1));
        assert!(failed.stderr.contains("FileNotFoundError"));
    }
}
