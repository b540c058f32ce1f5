use console::{Emoji, style};

use crate::core::orchestrator::RunReport;
use crate::core::sandbox::SandboxReport;

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "");
pub static FOLDER: Emoji<'_, '_> = Emoji("📁 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}

pub fn print_banner() {
    println!();
    println!(
        "{}{}",
        ROCKET,
        style("agentflow").bold().magenta()
    );
    println!(
        "{}\n",
        style("Plans, delegates and repairs until the report exists.").cyan()
    );
}

/// Titled block of aligned `command  description` rows.
pub struct GuideSection {
    title: String,
    rows: Vec<(String, String)>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.rows.push((name.to_string(), description.to_string()));
        self
    }

    pub fn print(&self) {
        println!(" {}", style(&self.title).bold().underlined());
        let width = self.rows.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
        for (name, description) in &self.rows {
            println!(
                "   {:<width$}  {}",
                style(name).green(),
                description,
                width = width
            );
        }
        println!();
    }
}

pub fn print_run_report(report: &RunReport) {
    print_step(&format!("Session {}", report.session_id));
    print_status("Status", report.status.as_str());
    print_status("Decisions", &report.decisions.to_string());
    print_status(
        "Plan steps",
        &format!("{}/{} completed", report.steps_completed, report.steps_total),
    );
    println!("  {} {}", FOLDER, report.workspace.display());
    match &report.deliverable {
        Some(path) => print_success(&format!("Deliverable: {}", path.display())),
        None => print_warn("No deliverable was produced."),
    }
}

pub fn print_sandbox_report(report: &SandboxReport) {
    for attempt in &report.attempts {
        let verdict = if attempt.success {
            style("ok").green()
        } else if attempt.timed_out {
            style("timeout").yellow()
        } else {
            style("failed").red()
        };
        println!(
            "  #{:<2} {:<8} rc={:<5} {:>6}ms  files: {}",
            attempt.attempt_index,
            verdict,
            attempt
                .return_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string()),
            attempt.duration_ms,
            if attempt.files_created.is_empty() {
                "-".to_string()
            } else {
                attempt.files_created.join(", ")
            }
        );
    }
    if report.success {
        let code = report.persisted_code.as_deref().unwrap_or("-");
        print_success(&format!(
            "Succeeded after {} attempt(s); code saved as {}",
            report.attempts.len(),
            code
        ));
    } else {
        print_warn(&format!(
            "No successful run in {} attempt(s).",
            report.attempts.len()
        ));
        if let Some(last) = report.final_attempt()
            && !last.stderr.trim().is_empty()
        {
            eprintln!("{}", style(last.stderr.trim()).dim());
        }
    }
}
