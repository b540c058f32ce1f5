use anyhow::{Context, Result, bail};
use chrono::Local;
use console::style;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::CommandArgs;
use agentflow::core::config::AppConfig;
use agentflow::core::llm::generic_provider::GenericProvider;
use agentflow::core::llm::registry::ProviderRegistry;
use agentflow::core::orchestrator::{Orchestrator, session_id_for};
use agentflow::core::protocol::WorkflowStatus;
use agentflow::core::sandbox::CodeSandbox;
use agentflow::core::sandbox::runner::ProcessRunner;
use agentflow::core::terminal;
use agentflow::logging;

pub async fn run_workflow(args: &CommandArgs) -> Result<()> {
    let tee = logging::init(args.verbose);
    let config = AppConfig::load(args.config.as_deref()).await?;
    let orchestrator = Orchestrator::from_config(config)?;

    let session = args
        .session
        .clone()
        .unwrap_or_else(|| session_id_for(&args.prompt, Local::now()));
    let workspace = orchestrator.workspace_for(&session);
    tokio::fs::create_dir_all(&workspace)
        .await
        .with_context(|| format!("Failed to create workspace {:?}", workspace))?;
    tee.attach(&workspace.join("run.log"))?;

    terminal::print_banner();
    terminal::print_info(&format!("Session {} in {}", session, workspace.display()));

    let result = orchestrator.run(&args.prompt, Some(&session)).await;
    tee.detach();

    let report = result?;
    terminal::print_run_report(&report);
    if report.status != WorkflowStatus::Completed {
        bail!("Run ended in state {}", report.status.as_str());
    }
    Ok(())
}

pub async fn run_sandbox(args: &CommandArgs) -> Result<()> {
    let tee = logging::init(args.verbose);
    let config = AppConfig::load(args.config.as_deref()).await?;

    let session = args
        .session
        .clone()
        .unwrap_or_else(|| format!("sandbox_{}", Local::now().format("%Y-%m-%d_%H-%M-%S")));
    let workspace = config.workspace.root.join(&session);
    tokio::fs::create_dir_all(&workspace).await?;
    tee.attach(&workspace.join("run.log"))?;

    let backend = Arc::new(GenericProvider::from_config(&config.llm, true)?);
    let runner = Arc::new(ProcessRunner::new(
        &config.sandbox.interpreter,
        Duration::from_secs(config.sandbox.timeout_secs),
    ));
    let sandbox = CodeSandbox::new(backend, runner, &workspace)
        .with_max_attempts(config.sandbox.max_attempts)
        .with_generation(config.llm.code_temperature, config.llm.code_max_tokens);

    terminal::print_step(&format!("Sandbox task in {}", workspace.display()));
    let result = sandbox
        .execute(&args.task, Some(&session), args.name.as_deref())
        .await;
    tee.detach();

    let report = result?;
    terminal::print_sandbox_report(&report);
    if !report.success {
        bail!("Sandbox task failed after {} attempts", report.attempts.len());
    }
    Ok(())
}

pub async fn list_workspaces(args: &CommandArgs) -> Result<()> {
    let config = AppConfig::load(args.config.as_deref()).await?;
    let root = &config.workspace.root;
    if !root.exists() {
        terminal::print_info(&format!("No workspaces under {}", root.display()));
        return Ok(());
    }

    let mut sessions = Vec::new();
    let mut entries = tokio::fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_dir() {
            continue;
        }
        let modified = meta.modified().ok();
        sessions.push((modified, entry.file_name().to_string_lossy().into_owned(), entry.path()));
    }
    sessions.sort_by(|a, b| b.0.cmp(&a.0));

    terminal::print_step(&format!("{} session(s) in {}", sessions.len(), root.display()));
    for (_, name, path) in sessions {
        let marker = if path.join(&config.workspace.deliverable).exists() {
            style("report").green()
        } else {
            style("no report").dim()
        };
        println!("  {:<60} {}", name, marker);
    }
    Ok(())
}

pub async fn show_config(args: &CommandArgs) -> Result<()> {
    let path = args.config.clone().unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load(args.config.as_deref()).await?;
    info!("Effective configuration resolved");
    terminal::print_status("Config file", &path.display().to_string());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

pub fn list_providers() -> Result<()> {
    let registry = ProviderRegistry::load()?;
    for provider in &registry.providers {
        let key = provider.api_key_env.as_deref().unwrap_or("(no key needed)");
        println!(
            "  {:<12} {:<36} {}",
            style(&provider.id).green(),
            provider.default_model,
            style(key).dim()
        );
    }
    Ok(())
}
