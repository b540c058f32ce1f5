use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static AGENT_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[-*\s]*NEXT[_\s-]*AGENT\s*[:=]\s*(.+)$").expect("agent line regex")
});
static STEP_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[-*\s]*PLAN[_\s-]*STEP\s*[:=]\s*(.+)$").expect("step line regex")
});
static TASK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^[-*\s]*TASK\s*[:=]\s*(.*)$").expect("task line regex"));
static SELECTOR_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^[-*\s]*(NEXT[_\s-]*AGENT|PLAN[_\s-]*STEP)\b").expect("selector regex")
});

/// One controller decision. Non-terminal variants always carry a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Planner { task: Option<String> },
    Executor { step: Option<u32>, task: String },
    Refine { step: Option<u32>, task: String },
    Writer { step: Option<u32>, task: String },
    Finish,
}

impl Decision {
    pub fn agent_name(&self) -> &'static str {
        match self {
            Decision::Planner { .. } => "planner",
            Decision::Executor { .. } => "executor",
            Decision::Refine { .. } => "strategy_refinement",
            Decision::Writer { .. } => "writer",
            Decision::Finish => "finish",
        }
    }

    pub fn step(&self) -> Option<u32> {
        match self {
            Decision::Executor { step, .. }
            | Decision::Refine { step, .. }
            | Decision::Writer { step, .. } => *step,
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecisionError {
    #[error("response has no NEXT_AGENT line")]
    MissingSelector,
    #[error("unknown agent '{0}'")]
    UnknownAgent(String),
    #[error("agent '{0}' was selected without a TASK")]
    MissingTask(String),
}

/// The three raw fields as found in the reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDecision {
    pub agent: Option<String>,
    pub step: Option<u32>,
    pub task: Option<String>,
}

fn normalize_agent(value: &str) -> String {
    value
        .trim()
        .trim_matches(|c: char| matches!(c, '[' | ']' | '<' | '>' | '`' | '*' | '"' | '\''))
        .trim()
        .to_lowercase()
}

/// Reads a step number; `NONE` or anything non-numeric means no step.
fn parse_step(value: &str) -> Option<u32> {
    let cleaned = value
        .trim()
        .trim_matches(|c: char| matches!(c, '[' | ']' | '<' | '>' | '`' | '*'));
    let cleaned = cleaned
        .strip_prefix("Step ")
        .or_else(|| cleaned.strip_prefix("step "))
        .unwrap_or(cleaned);
    cleaned.trim().parse().ok()
}

/// Scans line by line. A TASK block runs over subsequent non-empty lines
/// until a selector-like line appears; the last occurrence of each field wins.
pub fn scan_decision(response: &str) -> RawDecision {
    let mut raw = RawDecision::default();
    let mut task_lines: Vec<String> = Vec::new();
    let mut collecting = false;

    for line in response.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(caps) = AGENT_LINE.captures(line) {
            raw.agent = Some(normalize_agent(&caps[1]));
            collecting = false;
            continue;
        }
        if let Some(caps) = STEP_LINE.captures(line) {
            raw.step = parse_step(&caps[1]);
            collecting = false;
            continue;
        }
        if let Some(caps) = TASK_LINE.captures(line) {
            task_lines.clear();
            let first = caps[1].trim();
            if !first.is_empty() {
                task_lines.push(first.to_string());
            }
            collecting = true;
            continue;
        }
        if collecting {
            if SELECTOR_LIKE.is_match(line) {
                collecting = false;
                continue;
            }
            task_lines.push(line.to_string());
        }
    }

    let task = task_lines.join("\n").trim().to_string();
    if !task.is_empty() {
        raw.task = Some(task);
    }
    raw
}

pub fn parse_decision(response: &str) -> Result<Decision, DecisionError> {
    let raw = scan_decision(response);
    let agent = raw
        .agent
        .filter(|a| !a.is_empty())
        .ok_or(DecisionError::MissingSelector)?;

    let need_task = |name: &str| {
        raw.task
            .clone()
            .ok_or_else(|| DecisionError::MissingTask(name.to_string()))
    };

    match agent.as_str() {
        "finish" => Ok(Decision::Finish),
        "planner" => Ok(Decision::Planner {
            task: raw.task.clone(),
        }),
        "executor" => Ok(Decision::Executor {
            step: raw.step,
            task: need_task("executor")?,
        }),
        "strategy_refinement" | "refinement" | "refine" => Ok(Decision::Refine {
            step: raw.step,
            task: need_task("strategy_refinement")?,
        }),
        "writer" => Ok(Decision::Writer {
            step: raw.step,
            task: need_task("writer")?,
        }),
        _ => Err(DecisionError::UnknownAgent(agent)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_the_three_fields() {
        let d = parse_decision("NEXT_AGENT: executor\nPLAN_STEP: 2\nTASK: Download SPY data").unwrap();
        assert_eq!(
            d,
            Decision::Executor {
                step: Some(2),
                task: "Download SPY data".to_string()
            }
        );
    }

    #[test]
    fn tolerates_decoration_and_separators() {
        let reply = "Sure, here is my decision.\n\n**Next Agent = Writer**\n- plan-step: NONE\n* Task:\nWrite the report.\nEmbed the charts.";
        let d = parse_decision(reply).unwrap();
        assert_eq!(
            d,
            Decision::Writer {
                step: None,
                task: "Write the report.\nEmbed the charts.".to_string()
            }
        );
    }

    #[test]
    fn task_block_stops_at_selector_line() {
        let raw = scan_decision("TASK: first\nsecond\nNEXT_AGENT: executor\nthird");
        assert_eq!(raw.task.as_deref(), Some("first\nsecond"));
        assert_eq!(raw.agent.as_deref(), Some("executor"));
    }

    #[test]
    fn non_numeric_step_is_none() {
        assert_eq!(parse_step("NONE"), None);
        assert_eq!(parse_step("two"), None);
        assert_eq!(parse_step("[3]"), Some(3));
        assert_eq!(parse_step("Step 4"), Some(4));
    }

    #[test]
    fn finish_and_planner_need_no_task() {
        assert_eq!(parse_decision("NEXT_AGENT: finish").unwrap(), Decision::Finish);
        assert_eq!(
            parse_decision("NEXT_AGENT: planner\nPLAN_STEP: NONE").unwrap(),
            Decision::Planner { task: None }
        );
    }

    #[test]
    fn errors_are_typed() {
        assert_eq!(parse_decision("I think we should plan."), Err(DecisionError::MissingSelector));
        assert_eq!(
            parse_decision("NEXT_AGENT: researcher\nTASK: look around"),
            Err(DecisionError::UnknownAgent("researcher".to_string()))
        );
        assert_eq!(
            parse_decision("NEXT_AGENT: executor\nPLAN_STEP: 1\nTASK:"),
            Err(DecisionError::MissingTask("executor".to_string()))
        );
    }

    #[test]
    fn selector_aliases_map_to_refine() {
        let d = parse_decision("NEXT_AGENT: [strategy_refinement]\nPLAN_STEP: 4\nTASK: run three iterations").unwrap();
        assert_eq!(d.agent_name(), "strategy_refinement");
        assert_eq!(d.step(), Some(4));
    }
}
