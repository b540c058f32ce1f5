use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tracing::{info, warn};

use crate::core::protocol::{Plan, PlanError, PlanStep, validate_steps};

static FENCED_ARRAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\[.*?\])\s*```").expect("fenced array regex"));
static TICKER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2,5}\b").expect("ticker regex"));

/// The instruction handed to the planner persona.
pub fn planner_task(request: &str, deliverable: &str) -> String {
    format!(
        "Create a detailed, comprehensive plan for the following request:\n\n{request}\n\n\
         Each step must be SELF-CONTAINED:\n\
         - Objective: specific parameters, tickers, periods, and trading cost or settlement assumptions where relevant\n\
         - Inputs: exact files, formats and parameters; Python execution must use only datasets already in the workspace\n\
         - Outputs: exact file names, formats, metrics and charts, versioned (v1, v2) when iterations are expected\n\
         - Success criteria: measurable checks such as file existence or metric ranges\n\n\
         Start with a research step that saves its findings to a workspace note, inspect data files before \
         transforming them, consolidate strategy refinement into one step, and end with a reporting step whose \
         deliverable is `{deliverable}`.\n\n\
         Return ONLY the JSON array of steps."
    )
}

fn candidate_arrays(response: &str) -> Vec<&str> {
    let mut out: Vec<&str> = FENCED_ARRAY
        .captures_iter(response)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    if let (Some(start), Some(end)) = (response.find('['), response.rfind(']'))
        && end > start
    {
        out.push(&response[start..=end]);
    }
    out
}

/// Step array from planner output. Steps declared out of order are
/// renumbered 1..n in declaration order.
pub fn parse_plan_steps(response: &str) -> Result<Vec<PlanStep>, PlanError> {
    let mut steps = candidate_arrays(response)
        .into_iter()
        .find_map(|text| serde_json::from_str::<Vec<PlanStep>>(text).ok())
        .ok_or(PlanError::Unparseable)?;

    match validate_steps(&steps) {
        Ok(()) => Ok(steps),
        Err(PlanError::Empty) => Err(PlanError::Empty),
        Err(e) => {
            warn!("Planner steps rejected ({}); renumbering in declaration order", e);
            for (i, step) in steps.iter_mut().enumerate() {
                step.step_number = i as u32 + 1;
            }
            Ok(steps)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Strategy,
    Exploration,
    Hypothesis,
}

pub fn classify_request(request: &str) -> RequestKind {
    let lowered = request.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| lowered.contains(w));
    if has(&["hypothesis", "test", "significance", "statistical", "p-value"]) {
        RequestKind::Hypothesis
    } else if has(&["explore", "eda", "visual", "dashboard", "pattern", "insight", "analysis"]) {
        RequestKind::Exploration
    } else {
        RequestKind::Strategy
    }
}

fn step(n: u32, objective: String, tools: &[&str], inputs: &str, outputs: &str, criteria: &str) -> PlanStep {
    PlanStep {
        step_number: n,
        objective,
        required_tools: tools.iter().map(|t| t.to_string()).collect(),
        inputs: inputs.to_string(),
        outputs: outputs.to_string(),
        success_criteria: criteria.to_string(),
    }
}

/// Generic research, analysis and report plan for when the planner output
/// cannot be used.
pub fn fallback_steps(request: &str, deliverable: &str) -> Vec<PlanStep> {
    let subject = TICKER
        .find(request)
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| "the requested instrument".to_string());

    let middle = match classify_request(request) {
        RequestKind::Strategy => step(
            3,
            format!("Implement and backtest the strategy on {subject}, then run the refinement loop comparing versions net of costs"),
            &["python_execution", "file_saver"],
            "Dataset and notes from steps 1-2",
            "strategy_v1.py .. strategy_vN.py, results_vN.json, evaluation_vN.md",
            "Every strategy version has results and an evaluation",
        ),
        RequestKind::Exploration => step(
            3,
            format!("Explore {subject}: distributions, trends, correlations and charts"),
            &["python_execution", "file_saver"],
            "Dataset and notes from steps 1-2",
            "eda_metrics.json and PNG charts",
            "Metrics file exists and charts are saved",
        ),
        RequestKind::Hypothesis => step(
            3,
            format!("State and test the hypotheses about {subject} with appropriate statistics"),
            &["python_execution", "file_saver"],
            "Dataset and notes from steps 1-2",
            "hypothesis_test_results.json and diagnostic charts",
            "Each hypothesis has a test statistic, p-value and decision",
        ),
    };

    vec![
        step(
            1,
            format!("Research background and context for: {}", request.trim()),
            &["file_saver"],
            "The user request",
            "research_notes.md",
            "research_notes.md exists and summarises sources",
        ),
        step(
            2,
            format!("Inspect the available data for {subject}: schema, columns, missing values"),
            &["file_system_scanner", "python_execution", "file_saver"],
            "Data files present in the workspace",
            "data_structure_notes_v1.md",
            "Notes describe every dataset used later",
        ),
        middle,
        step(
            4,
            "Write the final report embedding charts and linking supporting files".to_string(),
            &["find_in_file", "file_saver"],
            "All artifacts produced by the previous steps",
            deliverable,
            &format!("{deliverable} exists and references concrete metrics"),
        ),
    ]
}

/// Plan from planner output, or the fallback plan when nothing usable came back.
pub fn plan_from_response(request: &str, response: &str, deliverable: &str) -> (Plan, bool) {
    let parsed = parse_plan_steps(response).and_then(|steps| Plan::from_steps(request, steps));
    match parsed {
        Ok(plan) => (plan, false),
        Err(e) => {
            warn!("Planner output unusable ({}); using fallback plan", e);
            let steps = fallback_steps(request, deliverable);
            let plan = Plan::from_steps(request, steps.clone()).unwrap_or_else(|_| Plan {
                plan_id: format!("plan_{}", uuid::Uuid::new_v4().simple()),
                origin_request: request.to_string(),
                steps,
                created_at: chrono::Utc::now(),
            });
            (plan, true)
        }
    }
}

pub async fn save_plan_snapshot(path: &Path, plan: &Plan) -> Result<()> {
    let json = serde_json::to_string_pretty(plan)?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write plan snapshot {:?}", path))?;
    info!("Plan snapshot saved to {:?}", path);
    Ok(())
}

pub async fn load_plan_snapshot(path: &Path) -> Result<Plan> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read plan snapshot {:?}", path))?;
    let plan = serde_json::from_str(&text)?;
    Ok(plan)
}
