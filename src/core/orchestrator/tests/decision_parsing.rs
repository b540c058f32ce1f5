use crate::core::orchestrator::decision::{Decision, DecisionError, parse_decision, scan_decision};

#[test]
fn well_formed_reply_parses_identically_every_time() {
    let replies = [
        "NEXT_AGENT: executor\nPLAN_STEP: 3\nTASK: Compute rolling volatility and save vol.csv",
        "NEXT_AGENT: planner\nPLAN_STEP: NONE\nTASK: Replan around the missing dataset",
        "NEXT_AGENT: writer\nPLAN_STEP: 5\nTASK: Write final_report.md",
        "NEXT_AGENT: finish\nPLAN_STEP: NONE\nTASK: All deliverables exist",
    ];
    for reply in replies {
        let first = parse_decision(reply);
        for _ in 0..3 {
            assert_eq!(parse_decision(reply), first, "reply: {}", reply);
        }
        assert!(first.is_ok());
    }
}

#[test]
fn empty_task_is_fatal_only_for_delegating_selectors() {
    assert_eq!(
        parse_decision("NEXT_AGENT: executor\nPLAN_STEP: 1\nTASK:"),
        Err(DecisionError::MissingTask("executor".to_string()))
    );
    assert_eq!(
        parse_decision("NEXT_AGENT: writer\nTASK:   "),
        Err(DecisionError::MissingTask("writer".to_string()))
    );
    assert_eq!(parse_decision("NEXT_AGENT: finish\nTASK:"), Ok(Decision::Finish));
}

#[test]
fn verbose_reply_with_reasoning_first() {
    let reply = "Looking at the workspace, step 1 produced research_notes.md.\n\
                 The data has not been downloaded yet.\n\n\
                 NEXT_AGENT: executor\n\
                 PLAN_STEP: 2\n\
                 TASK: Load SPY_prices.csv,\n\
                 check the schema,\n\
                 and save data_structure_notes_v1.md";
    match parse_decision(reply).unwrap() {
        Decision::Executor { step, task } => {
            assert_eq!(step, Some(2));
            assert_eq!(
                task,
                "Load SPY_prices.csv,\ncheck the schema,\nand save data_structure_notes_v1.md"
            );
        }
        other => panic!("unexpected decision {:?}", other),
    }
}

#[test]
fn later_fields_override_earlier_ones() {
    let raw = scan_decision("NEXT_AGENT: planner\nTASK: a\nNEXT_AGENT: executor\nTASK: b");
    assert_eq!(raw.agent.as_deref(), Some("executor"));
    assert_eq!(raw.task.as_deref(), Some("b"));
}
