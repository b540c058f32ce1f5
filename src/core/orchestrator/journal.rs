//! Append-only markdown record of a run. The writer persona receives the
//! whole file, so every dispatch lands here with its full trace.

use anyhow::{Context, Result};
use chrono::Local;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::core::agent::TaskOutcome;
use crate::core::protocol::{Plan, ToolCall};

const OBSERVATION_PREVIEW: usize = 300;

fn now() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn preview(text: &str, limit: usize) -> String {
    if text.chars().count() > limit {
        format!("{}...", text.chars().take(limit).collect::<String>())
    } else {
        text.to_string()
    }
}

/// One journaled dispatch.
#[derive(Debug, Clone, Default)]
pub struct StepEntry {
    pub number: u32,
    pub objective: String,
    pub success: bool,
    pub iterations: Option<usize>,
    pub thoughts: Vec<String>,
    pub actions: Vec<ToolCall>,
    pub observations: Vec<String>,
    pub files_created: Vec<String>,
    pub result: String,
}

impl StepEntry {
    pub fn from_outcome(number: u32, objective: &str, outcome: &TaskOutcome, files_created: Vec<String>) -> Self {
        Self {
            number,
            objective: objective.to_string(),
            success: outcome.success,
            iterations: Some(outcome.iterations),
            thoughts: outcome.thoughts.clone(),
            actions: outcome.actions.clone(),
            observations: outcome.observations.clone(),
            files_created,
            result: outcome.summary_text().to_string(),
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "## Step {}: {}\n", self.number, self.objective);
        let _ = writeln!(out, "**Timestamp:** {}", now());
        let _ = writeln!(
            out,
            "**Status:** {}",
            if self.success { "✅ Success" } else { "❌ Failed" }
        );
        let _ = writeln!(
            out,
            "**Iterations Used:** {}\n",
            self.iterations
                .map(|n| n.to_string())
                .unwrap_or_else(|| "N/A".to_string())
        );
        let _ = writeln!(out, "### Input\n```\n{}\n```\n", self.objective);

        out.push_str("### Thoughts and Reasoning\n");
        if self.thoughts.is_empty() {
            out.push_str("No thoughts recorded.\n");
        }
        for (i, t) in self.thoughts.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, t);
        }

        out.push_str("\n### Actions Taken\n");
        if self.actions.is_empty() {
            out.push_str("No actions taken.\n");
        }
        for a in &self.actions {
            let _ = writeln!(out, "- **{}** with arguments: `{}`", a.tool_name, a.arguments);
        }

        out.push_str("\n### Observations\n");
        if self.observations.is_empty() {
            out.push_str("No observations recorded.\n");
        }
        for (i, o) in self.observations.iter().enumerate() {
            let _ = writeln!(out, "{}. {}", i + 1, preview(o, OBSERVATION_PREVIEW));
        }

        out.push_str("\n### Files Created\n");
        if self.files_created.is_empty() {
            out.push_str("No new files created.\n");
        }
        for f in &self.files_created {
            let _ = writeln!(out, "- `{}`", f);
        }

        let result = if self.result.is_empty() {
            "No result"
        } else {
            &self.result
        };
        let _ = write!(out, "\n### Final Result\n```\n{}\n```\n\n---\n\n", result);
        out
    }
}

pub struct Journal {
    path: PathBuf,
}

impl Journal {
    /// Creates (truncating) the journal with its header.
    pub async fn create(path: &Path, session_id: &str, request: &str) -> Result<Self> {
        let header = format!(
            "# Workflow Execution Journal\n\n**Session ID:** {}\n**User Request:** {}\n**Started:** {}\n\n---\n\n",
            session_id,
            request,
            now()
        );
        tokio::fs::write(path, header)
            .await
            .with_context(|| format!("Failed to create journal {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, text: &str) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open journal {:?}", self.path))?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn read_all(&self) -> Result<String> {
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }

    pub async fn log_step(&self, entry: &StepEntry) -> Result<()> {
        self.append(&entry.render()).await
    }

    pub async fn log_plan(&self, plan: &Plan, snapshot_name: &str, fallback: bool) -> Result<()> {
        let mut out = format!(
            "## Planning Phase\n\n**Planner Agent** created a {}-step plan{}:\n\n",
            plan.steps.len(),
            if fallback { " (fallback plan)" } else { "" }
        );
        for step in &plan.steps {
            let _ = writeln!(out, "{}. {}", step.step_number, step.objective);
        }
        let _ = write!(
            out,
            "\n**Plan saved to:** `{}`\n**Generated:** {}\n\n---\n\n",
            snapshot_name,
            now()
        );
        self.append(&out).await
    }

    pub async fn log_refused(&self, agent: &str, reason: &str) -> Result<()> {
        self.append(&format!(
            "## ⚠️ Dispatch Refused\n\n**Agent:** {}\n**Reason:** {}\n**Time:** {}\n\n---\n\n",
            agent,
            reason,
            now()
        ))
        .await
    }

    pub async fn log_refinement_start(&self, iterations: usize) -> Result<()> {
        self.append(&format!(
            "## Strategy Refinement Loop ({} Iterations)\n\n**Started:** {}\n\n",
            iterations,
            now()
        ))
        .await
    }

    pub async fn log_refinement_complete(&self, iterations: usize) -> Result<()> {
        self.append(&format!(
            "**Strategy Refinement Complete**\n- Total iterations: {}\n- Final strategy: `strategy_v{}.py`\n- Completed: {}\n\n---\n\n",
            iterations,
            iterations,
            now()
        ))
        .await
    }

    pub async fn log_report_created(&self, deliverable: &str) -> Result<()> {
        self.append(&format!(
            "## Final Report Generation\n\n**Writer Agent** completed the final report.\n\n**Report saved to:** `{}`\n**Completed:** {}\n\n---\n\n",
            deliverable,
            now()
        ))
        .await
    }

    pub async fn log_failure(&self, error: &str) -> Result<()> {
        self.append(&format!(
            "## ❌ Workflow Failed\n\n**Error:** {}\n**Time:** {}\n\n",
            error,
            now()
        ))
        .await
    }

    pub async fn log_incomplete(&self, decisions: usize) -> Result<()> {
        self.append(&format!(
            "## ⚠️ Workflow Incomplete\n\n**Reason:** Maximum orchestration decisions reached before workflow completion. Review plan and orchestrator instructions.\n**Decisions Made:** {}\n**Time:** {}\n\n",
            decisions,
            now()
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn header_then_entries_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(&dir.path().join("main_journal.md"), "s1", "Analyse SPY")
            .await
            .unwrap();
        let entry = StepEntry {
            number: 2,
            objective: "Download data".to_string(),
            success: true,
            iterations: Some(3),
            thoughts: vec!["look first".to_string()],
            actions: vec![ToolCall::new("file_saver", json!({"filename": "a.csv"}), "executor_1")],
            observations: vec!["o".repeat(400)],
            files_created: vec!["a.csv".to_string()],
            result: "done".to_string(),
        };
        journal.log_step(&entry).await.unwrap();
        journal.log_failure("boom").await.unwrap();

        let text = journal.read_all().await.unwrap();
        assert!(text.starts_with("# Workflow Execution Journal"));
        assert!(text.contains("**Session ID:** s1"));
        assert!(text.contains("## Step 2: Download data"));
        assert!(text.contains("**Status:** ✅ Success"));
        assert!(text.contains("- **file_saver** with arguments: `{\"filename\":\"a.csv\"}`"));
        assert!(text.contains(&format!("1. {}...", "o".repeat(300))));
        assert!(text.contains("- `a.csv`"));
        let step_at = text.find("## Step 2").unwrap();
        let fail_at = text.find("## ❌ Workflow Failed").unwrap();
        assert!(step_at < fail_at);
    }

    #[test]
    fn empty_sections_have_placeholders() {
        let text = StepEntry {
            number: 1,
            objective: "x".to_string(),
            ..Default::default()
        }
        .render();
        assert!(text.contains("**Status:** ❌ Failed"));
        assert!(text.contains("**Iterations Used:** N/A"));
        assert!(text.contains("No thoughts recorded."));
        assert!(text.contains("No actions taken."));
        assert!(text.contains("No new files created."));
        assert!(text.contains("```\nNo result\n```"));
    }
}
