use std::collections::BTreeMap;

use crate::core::protocol::{Plan, PlanStepStatus, StepState, WorkflowStatus};

pub type StepStatusMap = BTreeMap<u32, PlanStepStatus>;

pub fn format_plan_progress(plan: Option<&Plan>, status: &StepStatusMap) -> String {
    let Some(plan) = plan else {
        return "No plan yet. Request Planner to generate a comprehensive plan.".to_string();
    };
    let mut lines = Vec::with_capacity(plan.steps.len() * 2);
    for step in &plan.steps {
        let (badge, detail) = match status.get(&step.step_number) {
            Some(info) => {
                let summary = info.summary.trim();
                match info.status {
                    StepState::Success if summary.is_empty() => ("✅", "SUCCESS".to_string()),
                    StepState::Success => ("✅", format!("SUCCESS - {}", summary)),
                    StepState::Failed if summary.is_empty() => ("⚠️", "FAILED".to_string()),
                    StepState::Failed => ("⚠️", format!("FAILED - {}", summary)),
                    StepState::Pending if summary.is_empty() => ("ℹ️", "IN PROGRESS".to_string()),
                    StepState::Pending => ("ℹ️", summary.to_string()),
                }
            }
            None => ("⬜", "PENDING".to_string()),
        };
        lines.push(format!("{} Step {}: {}", badge, step.step_number, step.objective));
        lines.push(format!("   ↳ {}", detail));
    }
    lines.join("\n")
}

pub fn steps_completed(status: &StepStatusMap) -> usize {
    status
        .values()
        .filter(|s| s.status == StepState::Success)
        .count()
}

#[derive(Debug, Clone, Copy)]
pub struct StateSnapshot {
    pub status: WorkflowStatus,
    pub decisions_made: usize,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub refinement_iterations: usize,
    pub deliverable_exists: bool,
}

pub fn format_state_summary(s: &StateSnapshot) -> String {
    [
        format!("Workflow status: {}", s.status.as_str()),
        format!("Decisions made so far: {}", s.decisions_made),
        format!("Plan steps completed: {}/{}", s.steps_completed, s.steps_total),
        format!(
            "Strategy refinement iterations completed: {}",
            s.refinement_iterations
        ),
        format!(
            "Final report created: {}",
            if s.deliverable_exists { "Yes" } else { "No" }
        ),
    ]
    .join("\n")
}

/// First line of an outcome, capped at 160 chars, prefixed SUCCESS or STATUS.
pub fn summarize_outcome(success: bool, text: &str) -> String {
    let line = text.trim().lines().next().unwrap_or("").trim();
    let line = if line.chars().count() > 160 {
        format!("{}...", line.chars().take(157).collect::<String>())
    } else {
        line.to_string()
    };
    let body = if line.is_empty() {
        "No further details provided.".to_string()
    } else {
        line
    };
    format!("{}: {}", if success { "SUCCESS" } else { "STATUS" }, body)
}
