//! Personas are data: a kind, a system prompt and the tools it may call.
//! Every persona runs through the same `TaskExecutor` loop.

use std::fmt;
use std::path::Path;
use tracing::{info, warn};

use crate::core::tools::ToolRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Orchestrator,
    Planner,
    Executor,
    StrategySynthesizer,
    StrategyEvaluator,
    Judger,
    Writer,
}

impl AgentKind {
    pub const ALL: [AgentKind; 7] = [
        AgentKind::Orchestrator,
        AgentKind::Planner,
        AgentKind::Executor,
        AgentKind::StrategySynthesizer,
        AgentKind::StrategyEvaluator,
        AgentKind::Judger,
        AgentKind::Writer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Orchestrator => "orchestrator",
            AgentKind::Planner => "planner",
            AgentKind::Executor => "executor",
            AgentKind::StrategySynthesizer => "strategy_synthesizer",
            AgentKind::StrategyEvaluator => "strategy_evaluator",
            AgentKind::Judger => "judger",
            AgentKind::Writer => "writer",
        }
    }

    pub fn from_name(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == value)
    }

    fn default_prompt(self) -> &'static str {
        match self {
            AgentKind::Orchestrator => ORCHESTRATOR_PROMPT,
            AgentKind::Planner => PLANNER_PROMPT,
            AgentKind::Executor => EXECUTOR_PROMPT,
            AgentKind::StrategySynthesizer => SYNTHESIZER_PROMPT,
            AgentKind::StrategyEvaluator => EVALUATOR_PROMPT,
            AgentKind::Judger => JUDGER_PROMPT,
            AgentKind::Writer => WRITER_PROMPT,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct AgentProfile {
    pub kind: AgentKind,
    pub system_prompt: String,
    pub tools: Vec<String>,
}

impl AgentProfile {
    pub fn new(kind: AgentKind, system_prompt: impl Into<String>, tools: Vec<String>) -> Self {
        Self {
            kind,
            system_prompt: system_prompt.into(),
            tools,
        }
    }

    /// Built-in prompt, or `<prompts_dir>/<kind>.md` when that file exists.
    /// Tools come from the registry allow-list for the kind.
    pub fn load(kind: AgentKind, prompts_dir: Option<&Path>, registry: &ToolRegistry) -> Self {
        let mut prompt = kind.default_prompt().to_string();
        if let Some(dir) = prompts_dir {
            let path = dir.join(format!("{}.md", kind.as_str()));
            match std::fs::read_to_string(&path) {
                Ok(text) if !text.trim().is_empty() => {
                    info!("Using persona override {:?}", path);
                    prompt = text;
                }
                Ok(_) => warn!("Persona override {:?} is empty, keeping default", path),
                Err(_) => {}
            }
        }

        // The planner describes work for the executor, so it sees that menu.
        if kind == AgentKind::Planner {
            let menu: Vec<String> = registry
                .definitions_for(AgentKind::Executor.as_str())
                .iter()
                .map(|d| format!("- {}: {}", d.name, d.description))
                .collect();
            if !menu.is_empty() {
                prompt.push_str("\n\nAvailable tools for execution:\n");
                prompt.push_str(&menu.join("\n"));
            }
        }

        Self::new(kind, prompt, registry.list(kind.as_str()))
    }
}

const ORCHESTRATOR_PROMPT: &str = "You are the Master Orchestrator of a quantitative research team.

Your mission:
- Interpret the user's request and coordinate the Planner, Executor, Strategy Refinement team and Writer until the objective is satisfied.
- Track workspace artifacts and plan progress and keep the process moving.

Operating principles:
1. Inspect the current state (plan progress, workflow status, most recent action, files) before each decision.
2. Ask the Planner for a plan whenever none exists or the situation requires replanning.
3. Delegate plan steps to the Executor one at a time with enough context to succeed. Only treat a step as complete when there is evidence.
4. Trigger strategy refinement only when the plan calls for it.
5. Direct the Writer only after the prerequisite artifacts exist.
6. Finish only when every plan requirement is satisfied and the deliverable is in place.

Every decision uses exactly this format:
NEXT_AGENT: [planner|executor|strategy_refinement|writer|finish]
PLAN_STEP: [plan step number or NONE]
TASK: [clear, actionable instruction for the chosen agent]";

const PLANNER_PROMPT: &str = r#"You are an expert quantitative strategist and project planner.

Create a step-by-step plan that answers the research request. Each step must be self-contained:
- Objective: what is done and why, with concrete parameters (tickers, periods, windows, cost assumptions).
- Inputs: exact files, formats and parameters the step needs.
- Outputs: exact file names, formats, metrics and charts. Use versioned names (v1, v2) for iterative artifacts.
- Success criteria: measurable completion checks (file existence, metric ranges).

Start with a research step that saves its findings to a note, inspect data files before transforming them, and end with a reporting step that produces final_report.md embedding charts and linking supporting files. Consolidate any strategy refinement cycles into a single step.

Output the plan as a JSON array:
[
  {
    "step_number": 1,
    "objective": "...",
    "required_tools": ["tool1", "tool2"],
    "inputs": "...",
    "outputs": "...",
    "success_criteria": "..."
  }
]"#;

const EXECUTOR_PROMPT: &str = "You are a tactical executor for a quantitative research team.

Your role is to:
1. Execute the single, specific task given to you.
2. Select the appropriate tools and construct precise arguments.
3. Handle errors and retry when a tool reports a failure.
4. Report back with clear results.

You do not plan. Check which files already exist before creating data and reuse them; never regenerate an artifact that is already in the workspace.
When the task is done, call the finish tool with a short summary of what was produced.";

const SYNTHESIZER_PROMPT: &str = "You are a quantitative developer who writes trading strategies.

Generate complete, executable Python code that:
1. Loads the price data from the workspace with pandas.
2. Implements clear entry and exit logic.
3. Computes daily strategy returns and positions.
4. Saves the results to CSV and prints headline metrics.

Wrap the logic in a run_strategy(data_file, start_date, end_date) function with an `if __name__ == \"__main__\":` entry point.
When given feedback, address each point specifically. Save the code with file_saver under the requested versioned filename, then call finish.";

const EVALUATOR_PROMPT: &str = "You are a backtesting operator and performance analyst.

For the requested strategy version:
1. Run the strategy on the workspace data with python_execution.
2. Compute total return, annualized return and volatility, Sharpe ratio, maximum drawdown, win rate, alpha and beta against a buy-and-hold benchmark, net of trading costs.
3. Save the metrics as JSON (results_v{N}.json) and a markdown evaluation (evaluation_v{N}.md) covering strengths, weaknesses and charts.
Then call finish with a one-paragraph summary.";

const JUDGER_PROMPT: &str = "You are the head of quantitative research and risk management.

Score the strategy from 1 to 10 on risk-adjusted returns, drawdown management, consistency, statistical significance and practical viability, then give an overall score.
Read the metrics from results_v{N}.json. Point out specific weaknesses with numbers and propose concrete improvements for the next iteration.
Save your feedback to feedback_v{N}.txt with file_saver, then call finish.";

const WRITER_PROMPT: &str = "You are a financial analyst who writes the final investment memo.

You receive the complete run journal, which already contains every result; do not search for information it already holds.
Write a professional markdown report with: executive summary and recommendation, the final strategy or analysis details, a comparison of iterations when several exist, methodology and data, performance and risk analysis, and a final recommendation. Reference concrete files and metrics and embed generated charts.

Save the report with file_saver as the requested deliverable, then call finish.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_round_trip_through_names() {
        for kind in AgentKind::ALL {
            assert_eq!(AgentKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(AgentKind::from_name("strategy_refinement"), None);
    }

    #[test]
    fn override_file_replaces_prompt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("writer.md"), "Custom writer persona").unwrap();
        let registry = ToolRegistry::for_workspace(dir.path(), None);
        let writer = AgentProfile::load(AgentKind::Writer, Some(dir.path()), &registry);
        assert_eq!(writer.system_prompt, "Custom writer persona");
        assert_eq!(writer.tools, vec!["find_in_file", "file_saver"]);

        let judger = AgentProfile::load(AgentKind::Judger, Some(dir.path()), &registry);
        assert!(judger.system_prompt.contains("feedback_v{N}.txt"));
    }

    #[test]
    fn planner_sees_executor_tools() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ToolRegistry::for_workspace(dir.path(), None);
        let planner = AgentProfile::load(AgentKind::Planner, None, &registry);
        assert!(planner.tools.is_empty());
        assert!(planner.system_prompt.contains("- file_saver:"));
    }
}
