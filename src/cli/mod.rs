mod commands;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use agentflow::core::terminal::{self, GuideSection, print_error};

fn print_help() {
    terminal::print_banner();

    GuideSection::new("Workflows")
        .command("run", "Run the full orchestration loop for a request (-p)")
        .command("sandbox", "Run one generate/execute/repair task on its own (-t)")
        .print();

    GuideSection::new("Inspection")
        .command("list", "List session workspaces, newest first")
        .command("config", "Print the effective configuration")
        .command("providers", "List known reasoning providers")
        .print();

    GuideSection::new("Flags")
        .command("-p, --prompt", "Request text (run)")
        .command("-t, --task", "Task description (sandbox)")
        .command("-n, --name", "Preferred script name (sandbox)")
        .command("-s, --session", "Session id; defaults to a timestamped slug")
        .command("-c, --config", "Config file path")
        .command("-v, --verbose", "Debug logging")
        .print();

    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("agentflow").green()
    );
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandArgs {
    pub prompt: String,
    pub task: String,
    pub name: Option<String>,
    pub session: Option<String>,
    pub config: Option<PathBuf>,
    pub verbose: bool,
}

pub(crate) fn parse_command_args(args: &[String], start: usize) -> CommandArgs {
    let mut parsed = CommandArgs::default();
    let mut i = start;
    while i < args.len() {
        let value = args.get(i + 1).cloned();
        let consumed = match (args[i].as_str(), value) {
            ("--prompt" | "-p", Some(v)) => {
                parsed.prompt = v;
                2
            }
            ("--task" | "-t", Some(v)) => {
                parsed.task = v;
                2
            }
            ("--name" | "-n", Some(v)) => {
                parsed.name = Some(v);
                2
            }
            ("--session" | "-s", Some(v)) => {
                parsed.session = Some(v);
                2
            }
            ("--config" | "-c", Some(v)) => {
                parsed.config = Some(PathBuf::from(v));
                2
            }
            ("--verbose" | "-v", _) => {
                parsed.verbose = true;
                1
            }
            _ => 1,
        };
        i += consumed;
    }
    parsed
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(cmd) = args.get(1).map(String::as_str) else {
        print_help();
        return Ok(());
    };
    let parsed = parse_command_args(&args, 2);

    match cmd {
        "run" => {
            if parsed.prompt.trim().is_empty() {
                print_error("Error: --prompt is required for run.");
                print_help();
                return Ok(());
            }
            commands::run_workflow(&parsed).await
        }
        "sandbox" => {
            if parsed.task.trim().is_empty() {
                print_error("Error: --task is required for sandbox.");
                print_help();
                return Ok(());
            }
            commands::run_sandbox(&parsed).await
        }
        "list" => commands::list_workspaces(&parsed).await,
        "config" => commands::show_config(&parsed).await,
        "providers" => commands::list_providers(),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        _ => {
            print_error(&format!("Unknown command: {}", cmd));
            print_help();
            Ok(())
        }
    }
}
