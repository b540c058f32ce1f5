pub mod decision;
pub mod journal;
pub mod plan;
pub mod progress;
pub mod refinement;
pub mod types;
pub mod workspace;

use anyhow::Context;
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::core::agent::{AbortReason, AgentKind};
use crate::core::config::AppConfig;
use crate::core::llm::ReasoningBackend;
use crate::core::llm::generic_provider::GenericProvider;
use crate::core::protocol::{Plan, PlanStepStatus, StepState, WorkflowContext, WorkflowStatus};
use crate::core::sandbox::CodeSandbox;
use crate::core::sandbox::runner::{CodeRunner, ProcessRunner};
use crate::core::tools::{Tool, ToolRegistry};

pub use decision::{Decision, DecisionError, parse_decision};
pub use journal::{Journal, StepEntry};
pub use progress::StepStatusMap;
pub use types::{AgentFactory, OrchestratorError, RunReport};

use progress::{StateSnapshot, format_plan_progress, format_state_summary, steps_completed, summarize_outcome};
use workspace::{Inventory, with_existing_files};

const CONTEXT_FILE: &str = "context.json";
const RETRY_SUFFIX: &str = "\n\nYour previous response did not follow the exact format. Reply again with ONLY the three required lines.";

/// `<YYYY-mm-dd_HH-MM-SS>_<first 30 chars, non-alphanumerics as _>`.
pub fn session_id_for(request: &str, now: DateTime<Local>) -> String {
    let safe: String = request
        .chars()
        .take(30)
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}", now.format("%Y-%m-%d_%H-%M-%S"), safe)
}

pub struct Orchestrator {
    config: AppConfig,
    backend: Arc<dyn ReasoningBackend>,
    code_backend: Arc<dyn ReasoningBackend>,
    runner: Arc<dyn CodeRunner>,
    host_tools: Vec<Arc<dyn Tool>>,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn ReasoningBackend>,
        code_backend: Arc<dyn ReasoningBackend>,
        runner: Arc<dyn CodeRunner>,
    ) -> Self {
        Self {
            config,
            backend,
            code_backend,
            runner,
            host_tools: Vec::new(),
        }
    }

    /// Production wiring: configured providers and the interpreter subprocess.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let backend = Arc::new(GenericProvider::from_config(&config.llm, false)?);
        let code_backend = Arc::new(GenericProvider::from_config(&config.llm, true)?);
        let runner = Arc::new(ProcessRunner::new(
            &config.sandbox.interpreter,
            Duration::from_secs(config.sandbox.timeout_secs),
        ));
        Ok(Self::new(config, backend, code_backend, runner))
    }

    /// Registers a host tool (search, market data, ...) for the executor.
    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.host_tools.push(tool);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn workspace_for(&self, session_id: &str) -> PathBuf {
        self.config.workspace.root.join(session_id)
    }

    fn registry_for(&self, workspace: &Path) -> ToolRegistry {
        let sandbox = CodeSandbox::new(self.code_backend.clone(), self.runner.clone(), workspace)
            .with_max_attempts(self.config.sandbox.max_attempts)
            .with_generation(
                self.config.llm.code_temperature,
                self.config.llm.code_max_tokens,
            );
        let mut registry = ToolRegistry::for_workspace(workspace, Some(Arc::new(sandbox)));
        for tool in &self.host_tools {
            let name = tool.definition().name;
            registry.register(tool.clone());
            registry.allow(AgentKind::Executor.as_str(), &name);
        }
        registry
    }

    pub async fn run(
        &self,
        request: &str,
        session_id: Option<&str>,
    ) -> Result<RunReport, OrchestratorError> {
        let session_id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| session_id_for(request, Local::now()));
        let workspace = self.workspace_for(&session_id);
        tokio::fs::create_dir_all(&workspace)
            .await
            .with_context(|| format!("Failed to create workspace {:?}", workspace))?;

        let journal = Journal::create(
            &workspace.join(&self.config.workspace.journal),
            &session_id,
            request,
        )
        .await?;
        info!("[{}] Initialized journal: {:?}", session_id, journal.path());

        let agents = AgentFactory {
            backend: self.backend.clone(),
            registry: Arc::new(self.registry_for(&workspace)),
            workspace: workspace.clone(),
            prompts_dir: self.config.workspace.prompts_dir.clone(),
            max_iterations: self.config.orchestration.agent_max_iterations,
            temperature: self.config.llm.temperature,
            max_tokens: Some(self.config.llm.max_tokens),
        };

        let mut run = Run {
            config: &self.config,
            context: WorkflowContext::new(&session_id, &workspace.to_string_lossy(), request),
            workspace,
            journal,
            agents,
            step_status: StepStatusMap::new(),
            last_action: "Workflow initialized.".to_string(),
            decisions: 0,
            refinement_iterations: 0,
            deliverable_created: false,
            journal_counter: 0,
        };
        run.save_context().await?;

        match run.drive().await {
            Ok(()) => Ok(run.report()),
            Err(e) => {
                error!("[{}] Workflow failed: {}", session_id, e);
                run.context.status = WorkflowStatus::Failed;
                run.context.updated_at = Utc::now();
                if !matches!(e, OrchestratorError::DecisionBudgetExhausted { .. })
                    && let Err(log_err) = run.journal.log_failure(&e.to_string()).await
                {
                    warn!("Could not journal failure: {}", log_err);
                }
                if let Err(ctx_err) = run.save_context().await {
                    warn!("Could not save context: {}", ctx_err);
                }
                Err(e)
            }
        }
    }
}

/// Mutable state of one run.
struct Run<'a> {
    config: &'a AppConfig,
    context: WorkflowContext,
    workspace: PathBuf,
    journal: Journal,
    agents: AgentFactory,
    step_status: StepStatusMap,
    last_action: String,
    decisions: usize,
    refinement_iterations: usize,
    deliverable_created: bool,
    journal_counter: u32,
}

impl Run<'_> {
    fn session(&self) -> &str {
        &self.context.session_id
    }

    fn plan(&self) -> Option<&Plan> {
        self.context.plan.as_ref()
    }

    fn deliverable_path(&self) -> PathBuf {
        self.workspace.join(&self.config.workspace.deliverable)
    }

    async fn deliverable_exists(&self) -> bool {
        tokio::fs::try_exists(self.deliverable_path())
            .await
            .unwrap_or(false)
    }

    async fn save_context(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.context)?;
        tokio::fs::write(self.workspace.join(CONTEXT_FILE), json).await?;
        Ok(())
    }

    async fn transition(&mut self, to: WorkflowStatus) -> Result<(), OrchestratorError> {
        let from = self.context.status;
        if !from.can_transition(to) {
            return Err(OrchestratorError::IllegalTransition {
                from: from.as_str(),
                to: to.as_str(),
            });
        }
        if from != to {
            info!("[{}] status {} -> {}", self.session(), from.as_str(), to.as_str());
            self.context.status = to;
            self.context.updated_at = Utc::now();
            self.save_context().await?;
        }
        Ok(())
    }

    fn report(&self) -> RunReport {
        let deliverable = self.deliverable_path();
        RunReport {
            session_id: self.context.session_id.clone(),
            workspace: self.workspace.clone(),
            status: self.context.status,
            decisions: self.decisions,
            deliverable: deliverable.exists().then_some(deliverable),
            steps_completed: steps_completed(&self.step_status),
            steps_total: self.plan().map(|p| p.steps.len()).unwrap_or(0),
        }
    }

    async fn drive(&mut self) -> Result<(), OrchestratorError> {
        let budget = self.config.orchestration.max_decisions;
        while self.decisions < budget {
            let decision = self.decide().await?;
            self.decisions += 1;
            info!(
                "[{}] Decision {} -> agent={}, plan_step={:?}",
                self.session(),
                self.decisions,
                decision.agent_name(),
                decision.step()
            );

            match decision {
                Decision::Finish => {
                    self.transition(WorkflowStatus::Completed).await?;
                    self.last_action = "Workflow marked complete by orchestrator.".to_string();
                    if !self.deliverable_exists().await {
                        warn!(
                            "[{}] Completed without {}. Verify requirements.",
                            self.session(),
                            self.config.workspace.deliverable
                        );
                    }
                    info!("[{}] Workflow completed", self.session());
                    return Ok(());
                }
                Decision::Planner { task } => self.dispatch_planner(task.as_deref()).await?,
                Decision::Executor { step, task } => self.dispatch_executor(step, &task).await?,
                Decision::Refine { step, task } => self.dispatch_refinement(step, &task).await?,
                Decision::Writer { step, task } => self.dispatch_writer(step, &task).await?,
            }
        }

        warn!("[{}] Decision budget of {} exhausted", self.session(), budget);
        self.journal.log_incomplete(self.decisions).await?;
        Err(OrchestratorError::DecisionBudgetExhausted {
            decisions: self.decisions,
        })
    }

    async fn decision_prompt(&self) -> Result<String, OrchestratorError> {
        let inventory = Inventory::scan(&self.workspace).await?;
        let snapshot = StateSnapshot {
            status: self.context.status,
            decisions_made: self.decisions,
            steps_completed: steps_completed(&self.step_status),
            steps_total: self.plan().map(|p| p.steps.len()).unwrap_or(0),
            refinement_iterations: self.refinement_iterations,
            deliverable_exists: self.deliverable_created
                || inventory.contains(&self.config.workspace.deliverable),
        };
        let plan_details = match self.plan() {
            Some(plan) => serde_json::to_string_pretty(plan).map_err(anyhow::Error::from)?,
            None => "No plan yet".to_string(),
        };
        Ok(format!(
            "User Request: {}\n\nWorkflow State:\n{}\n\nMost Recent Action:\n{}\n\nPlan Progress:\n{}\n\nPlan Details (JSON):\n{}\n\nFiles in Workspace:\n{}\n\n\
             Determine the next agent to invoke and provide a precise task.\n\
             Respond ONLY with three lines in this exact format (no additional text before or after):\n\
             NEXT_AGENT: <planner|executor|strategy_refinement|writer|finish>\n\
             PLAN_STEP: <plan step number or NONE>\n\
             TASK: <clear, actionable instruction for the chosen agent>",
            self.context.request,
            format_state_summary(&snapshot),
            self.last_action,
            format_plan_progress(self.plan(), &self.step_status),
            plan_details,
            inventory.describe()
        ))
    }

    /// Asks the orchestrator persona, re-prompting with a format correction
    /// until the reply parses or the attempt budget runs out.
    async fn decide(&mut self) -> Result<Decision, OrchestratorError> {
        let base = self.decision_prompt().await?;
        let attempts = self.config.orchestration.decision_attempts;
        let mut last_response = String::new();
        let mut last_error = DecisionError::MissingSelector;
        let mut aborted: Option<(AbortReason, String)> = None;

        for attempt in 1..=attempts {
            let prompt = if attempt == 1 {
                base.clone()
            } else {
                format!("{}{}", base, RETRY_SUFFIX)
            };
            let mut orchestrator = self.agents.build(AgentKind::Orchestrator);
            let outcome = orchestrator.execute(&prompt, &[]).await;
            let response = if outcome.success {
                aborted = None;
                outcome.result.unwrap_or_default()
            } else {
                let reason = outcome.abort.unwrap_or(AbortReason::ToolResolution);
                aborted = Some((reason, outcome.error.unwrap_or_default()));
                String::new()
            };

            match parse_decision(&response) {
                Ok(decision) => return Ok(decision),
                Err(e) => {
                    warn!(
                        "[{}] Decision attempt {}/{} unusable: {}",
                        self.session(),
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e;
                    last_response = response;
                }
            }
        }

        match aborted {
            Some((AbortReason::Backend, msg)) => return Err(OrchestratorError::Backend(msg)),
            Some((AbortReason::ToolResolution, msg)) => {
                return Err(OrchestratorError::AgentAborted(msg));
            }
            None => {}
        }
        Err(OrchestratorError::InvalidDecision {
            attempts,
            source: last_error,
            last_response,
        })
    }

    async fn refuse(&mut self, agent: &str, reason: &str) -> Result<(), OrchestratorError> {
        warn!("[{}] Refusing {}: {}", self.session(), agent, reason);
        self.journal.log_refused(agent, reason).await?;
        self.last_action = format!("Dispatch to {} refused: {}", agent, reason);
        Ok(())
    }

    /// Journal number for a dispatch, and whether status may be recorded.
    fn step_slot(&mut self, declared: Option<u32>) -> (u32, bool) {
        self.journal_counter += 1;
        match declared {
            Some(n) if self.plan().is_some_and(|p| p.has_step(n)) => (n, true),
            Some(n) => {
                warn!("[{}] Step {} is not in the plan; not recording status", self.session(), n);
                (self.journal_counter, false)
            }
            None => (self.journal_counter, false),
        }
    }

    fn record_step(&mut self, number: u32, recordable: bool, success: bool, summary: String) {
        if recordable {
            self.step_status.insert(
                number,
                PlanStepStatus {
                    status: if success {
                        StepState::Success
                    } else {
                        StepState::Failed
                    },
                    summary: summary.clone(),
                },
            );
        }
        self.last_action = summary;
    }

    async fn dispatch_planner(&mut self, guidance: Option<&str>) -> Result<(), OrchestratorError> {
        self.transition(WorkflowStatus::Planning).await?;
        info!("[{}] Planner selected to create or update plan", self.session());

        let mut task = plan::planner_task(&self.context.request, &self.config.workspace.deliverable);
        if let Some(g) = guidance.filter(|g| !g.trim().is_empty()) {
            task.push_str(&format!("\n\nOrchestrator guidance:\n{}", g));
        }
        let mut planner = self.agents.build(AgentKind::Planner);
        let outcome = planner.execute(&task, &[]).await;
        let response = outcome.result.clone().unwrap_or_default();

        let (new_plan, fallback) = plan::plan_from_response(
            &self.context.request,
            &response,
            &self.config.workspace.deliverable,
        );
        let snapshot = &self.config.workspace.plan_snapshot;
        plan::save_plan_snapshot(&self.workspace.join(snapshot), &new_plan).await?;
        self.journal.log_plan(&new_plan, snapshot, fallback).await?;
        info!("[{}] Plan created with {} steps", self.session(), new_plan.steps.len());

        self.last_action = format!(
            "Planner produced {}plan with {} steps.",
            if fallback { "fallback " } else { "" },
            new_plan.steps.len()
        );
        self.context.plan = Some(new_plan);
        self.step_status.clear();
        self.transition(WorkflowStatus::Executing).await
    }

    async fn dispatch_executor(&mut self, step: Option<u32>, task: &str) -> Result<(), OrchestratorError> {
        if self.plan().is_none() {
            return self.refuse("executor", "no plan exists yet; call the planner first").await;
        }
        self.transition(WorkflowStatus::Executing).await?;
        info!(
            "[{}] Delegating to Executor: {}",
            self.session(),
            task.chars().take(120).collect::<String>()
        );

        let before = Inventory::scan(&self.workspace).await?;
        let enhanced = with_existing_files(task, &before.names());
        let mut executor = self.agents.build(AgentKind::Executor);
        let outcome = executor.execute(&enhanced, &[]).await;
        info!("[{}] Executor success: {}", self.session(), outcome.success);
        let after = Inventory::scan(&self.workspace).await?;

        let (number, recordable) = self.step_slot(step);
        let entry = StepEntry::from_outcome(number, task, &outcome, before.created_since(&after));
        self.journal.log_step(&entry).await?;
        let summary = summarize_outcome(outcome.success, outcome.summary_text());
        self.record_step(number, recordable, outcome.success, summary);
        Ok(())
    }

    async fn dispatch_refinement(&mut self, step: Option<u32>, task: &str) -> Result<(), OrchestratorError> {
        if self.plan().is_none() {
            return self
                .refuse("strategy_refinement", "no plan exists yet; call the planner first")
                .await;
        }
        self.transition(WorkflowStatus::Refining).await?;
        info!("[{}] Initiating strategy refinement loop: {}", self.session(), task);

        let before = Inventory::scan(&self.workspace).await?;
        let iterations = self.config.orchestration.refinement_iterations;
        let outcome = refinement::run_refinement(
            &self.agents,
            &self.journal,
            &self.workspace,
            &self.context.request,
            iterations,
        )
        .await?;
        self.refinement_iterations = outcome.iterations;
        let after = Inventory::scan(&self.workspace).await?;

        let summary = outcome.summary();
        let (number, recordable) = self.step_slot(step);
        let entry = StepEntry {
            number,
            objective: "Execute strategy refinement loop".to_string(),
            success: true,
            iterations: Some(outcome.iterations),
            files_created: before.created_since(&after),
            result: summary.clone(),
            ..Default::default()
        };
        self.journal.log_step(&entry).await?;
        self.record_step(number, recordable, true, summary);
        self.transition(WorkflowStatus::Executing).await
    }

    async fn dispatch_writer(&mut self, step: Option<u32>, task: &str) -> Result<(), OrchestratorError> {
        if steps_completed(&self.step_status) == 0 {
            return self
                .refuse("writer", "no plan step has succeeded yet; there is nothing to report")
                .await;
        }
        self.transition(WorkflowStatus::Reporting).await?;
        info!("[{}] Delegating to Writer for final report", self.session());

        let before = Inventory::scan(&self.workspace).await?;
        let journal_text = self.journal.read_all().await?;
        let deliverable = self.config.workspace.deliverable.clone();
        let brief = writer_task(
            &self.context.request,
            task,
            &journal_text,
            &before.names().into_iter().collect::<Vec<_>>(),
            &deliverable,
        );
        let mut writer = self.agents.build(AgentKind::Writer);
        let outcome = writer.execute(&brief, &[]).await;
        let after = Inventory::scan(&self.workspace).await?;

        // The file on disk decides, whatever the writer reported.
        let exists = self.deliverable_exists().await;
        let (number, recordable) = self.step_slot(step);
        let mut entry = StepEntry::from_outcome(number, task, &outcome, before.created_since(&after));
        entry.success = exists;
        self.journal.log_step(&entry).await?;

        let summary = if exists {
            self.deliverable_created = true;
            self.journal.log_report_created(&deliverable).await?;
            info!("[{}] Final report created: {:?}", self.session(), self.deliverable_path());
            format!("Final report created at {}.", deliverable)
        } else {
            warn!("[{}] {} was not created", self.session(), deliverable);
            format!("Writer completed task but {} not found.", deliverable)
        };
        self.record_step(number, recordable, exists, summary);
        self.transition(WorkflowStatus::Executing).await
    }
}

pub fn writer_task(
    request: &str,
    instructions: &str,
    journal: &str,
    files: &[String],
    deliverable: &str,
) -> String {
    let files_list = files
        .iter()
        .map(|f| format!("- {}", f))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Generate a comprehensive investment memo for the completed analysis.\n\n\
         Original Request: {request}\n\n\
         Orchestrator instructions: {instructions}\n\n\
         ### Complete Workflow Journal\n\n\
         The following is the complete execution journal with all context, thoughts, actions, and results:\n\n\
         ```markdown\n{journal}\n```\n\n\
         Available files in workspace (for reference):\n{files_list}\n\n\
         If several strategy versions exist, state which file is the final recommended strategy and compare \
         every version in a table. Reference specific files as evidence.\n\n\
         You have ALL the information you need in the journal above. Save the report to {deliverable} and call finish() when done."
    )
}

#[cfg(test)]
mod tests;
