use anyhow::Result;
use std::path::Path;
use tracing::info;

use super::journal::Journal;
use super::types::AgentFactory;
use crate::core::agent::AgentKind;

pub fn synthesizer_task(request: &str, iteration: usize, feedback: Option<&str>) -> String {
    match feedback {
        Some(feedback) if iteration > 1 => format!(
            "Refine the previous strategy based on this feedback:\n\n{feedback}\n\n\
             Generate improved strategy code for iteration {iteration}.\n\
             Save the code to 'strategy_v{iteration}.py'."
        ),
        _ => format!(
            "Generate a trading strategy for: {request}\n\n\
             Create complete, executable Python code following the standard template.\n\
             Save the code to 'strategy_v{iteration}.py'."
        ),
    }
}

pub fn evaluator_task(iteration: usize, total: usize) -> String {
    format!(
        "Execute the strategy in strategy_v{iteration}.py and evaluate its performance.\n\n\
         REQUIRED TASKS:\n\
         1. Run the strategy code using python_execution\n\
         2. Compute total return, Sharpe ratio, max drawdown, volatility, win rate, alpha and beta against buy-and-hold\n\
         3. Save metrics to results_v{iteration}.json\n\
         4. Save a comprehensive evaluation report to evaluation_v{iteration}.md covering metrics, risk, \
         trading statistics, strengths, weaknesses and recommendations for the next iteration\n\n\
         This is iteration {iteration} of {total}. Be thorough and analytical."
    )
}

pub fn judger_task(iteration: usize) -> String {
    format!(
        "Evaluate the strategy from iteration {iteration}.\n\n\
         1. Read results_v{iteration}.json\n\
         2. Analyze all metrics against the rubric\n\
         3. Provide a score (1-10) and detailed feedback\n\
         4. Save feedback to feedback_v{iteration}.txt\n\n\
         Be specific about strengths and weaknesses.\n\
         Provide actionable suggestions for the next iteration."
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefinementOutcome {
    pub iterations: usize,
    pub strategies: Vec<String>,
    pub feedback_files: Vec<String>,
}

impl RefinementOutcome {
    pub fn summary(&self) -> String {
        format!(
            "Strategy refinement loop completed ({} iterations, {} strategy files).",
            self.iterations,
            self.strategies.len()
        )
    }
}

/// Synthesize, evaluate, judge; the judger's feedback file feeds the next
/// synthesis. Sub-agent failures are journaled and the loop carries on.
pub async fn run_refinement(
    agents: &AgentFactory,
    journal: &Journal,
    workspace: &Path,
    request: &str,
    iterations: usize,
) -> Result<RefinementOutcome> {
    journal.log_refinement_start(iterations).await?;
    let mut outcome = RefinementOutcome::default();
    let mut feedback: Option<String> = None;

    for i in 1..=iterations {
        info!("Strategy iteration {}/{}", i, iterations);
        journal.append(&format!("### Iteration {}\n\n", i)).await?;

        let mut synthesizer = agents.build(AgentKind::StrategySynthesizer);
        let synth = synthesizer
            .execute(&synthesizer_task(request, i, feedback.as_deref()), &[])
            .await;
        let strategy = format!("strategy_v{}.py", i);
        let strategy_exists = workspace.join(&strategy).exists();
        if strategy_exists {
            outcome.strategies.push(strategy.clone());
        }
        journal
            .append(&format!(
                "**Strategy Synthesizer:**\n- Generated: {}\n- Feedback incorporated: {}\n- Agent success: {}\n\n",
                if strategy_exists {
                    format!("`{}`", strategy)
                } else {
                    format!("⚠️ `{}` not found", strategy)
                },
                if feedback.is_some() { "Yes" } else { "No (first iteration)" },
                synth.success
            ))
            .await?;

        let mut evaluator = agents.build(AgentKind::StrategyEvaluator);
        let eval = evaluator.execute(&evaluator_task(i, iterations), &[]).await;
        let report = format!("evaluation_v{}.md", i);
        journal
            .append(&format!(
                "**Strategy Evaluator:**\n- Backtest completed: {}\n- Results saved to: `results_v{}.json`\n- Evaluation report: {}\n\n",
                eval.success,
                i,
                if workspace.join(&report).exists() {
                    format!("✅ `{}`", report)
                } else {
                    "⚠️ Not generated".to_string()
                }
            ))
            .await?;

        let mut judger = agents.build(AgentKind::Judger);
        judger.execute(&judger_task(i), &[]).await;
        let feedback_file = format!("feedback_v{}.txt", i);
        match tokio::fs::read_to_string(workspace.join(&feedback_file)).await {
            Ok(text) => {
                journal
                    .append(&format!(
                        "**Judger:**\n- Feedback saved to: `{}`\n- Key suggestions: {}...\n\n",
                        feedback_file,
                        text.chars().take(200).collect::<String>()
                    ))
                    .await?;
                outcome.feedback_files.push(feedback_file);
                feedback = Some(text);
            }
            Err(_) => {
                journal
                    .append(&format!("**Judger:**\n- ⚠️ `{}` was not created\n\n", feedback_file))
                    .await?;
            }
        }
        outcome.iterations = i;
    }

    journal.log_refinement_complete(iterations).await?;
    Ok(outcome)
}
