//! Replay determinism at the single-turn level: identical history must
//! produce identical scheduling decisions, and diverging orchestrator code
//! must be detected rather than silently corrupting history.

use duratask::{run_turn, Decision, DurableOutput, HistoryEvent};

fn started(event_id: u64) -> HistoryEvent {
    HistoryEvent::OrchestrationStarted {
        event_id,
        name: "Pipeline".into(),
        version: "1.0.0".into(),
        input: String::new(),
        started_at_ms: 1_000,
        parent_instance: None,
        parent_id: None,
    }
}

#[test]
fn first_turn_records_schedule_and_suspends() {
    let orchestrator = |ctx: duratask::OrchestrationContext| async move {
        let doubled = ctx.schedule_activity("Double", "21").into_activity().await?;
        Ok(doubled)
    };

    let out = run_turn(vec![started(1)], "inst", 1, 1_000, orchestrator);
    assert!(out.output.is_none());
    assert!(out.nondeterminism.is_none());
    assert_eq!(
        out.decisions,
        vec![Decision::CallActivity {
            scheduling_event_id: 2,
            name: "Double".into(),
            input: "21".into(),
        }]
    );
    assert!(matches!(
        out.history.last(),
        Some(HistoryEvent::ActivityScheduled { event_id: 2, .. })
    ));
}

#[test]
fn replaying_a_recorded_history_yields_identical_decisions() {
    let orchestrator = |ctx: duratask::OrchestrationContext| async move {
        let a = ctx.schedule_activity("Double", "21").into_activity().await?;
        let b = ctx.schedule_activity("Echo", a.clone()).into_activity().await?;
        Ok(format!("{a}/{b}"))
    };

    // Drive manually: run, satisfy the pending schedule, run again.
    let mut history = vec![started(1)];
    let mut recorded_decisions = Vec::new();
    loop {
        let out = run_turn(history.clone(), "inst", 1, 1_000, orchestrator);
        assert!(out.nondeterminism.is_none());
        history = out.history;
        recorded_decisions.extend(out.decisions.clone());
        if let Some(result) = out.output {
            assert_eq!(result.unwrap(), "42/42");
            break;
        }
        for d in out.decisions {
            if let Decision::CallActivity {
                scheduling_event_id,
                name,
                input,
            } = d
            {
                let result = match name.as_str() {
                    "Double" => (input.parse::<i64>().unwrap() * 2).to_string(),
                    _ => input,
                };
                let next_id = history.last().unwrap().event_id() + 1;
                history.push(HistoryEvent::ActivityCompleted {
                    event_id: next_id,
                    source_event_id: scheduling_event_id,
                    result,
                });
            }
        }
    }
    assert_eq!(recorded_decisions.len(), 2);

    // Full replay over the finished history: same output, no new decisions.
    for _ in 0..2 {
        let out = run_turn(history.clone(), "inst", 1, 9_999, orchestrator);
        assert!(out.decisions.is_empty(), "replay must not schedule new work");
        assert!(out.nondeterminism.is_none());
        assert_eq!(out.output.unwrap().unwrap(), "42/42");
        assert_eq!(out.history, history, "replay must not grow history");
    }
}

#[test]
fn swapped_orchestrator_code_is_detected_as_nondeterministic() {
    let original = |ctx: duratask::OrchestrationContext| async move {
        let a = ctx.schedule_activity("Double", "21").into_activity().await?;
        Ok(a)
    };
    let out = run_turn(vec![started(1)], "inst", 1, 1_000, original);
    let mut history = out.history;
    history.push(HistoryEvent::ActivityCompleted {
        event_id: 3,
        source_event_id: 2,
        result: "42".into(),
    });

    // Same history, different code: a timer where an activity was recorded.
    let swapped = |ctx: duratask::OrchestrationContext| async move {
        ctx.schedule_timer(500).into_timer().await;
        Ok(String::new())
    };
    let out = run_turn(history, "inst", 1, 1_000, swapped);
    let err = out.nondeterminism.expect("divergence must be detected");
    assert!(err.contains("nondeterministic"), "got: {err}");
}

#[test]
fn changed_activity_input_is_detected_as_nondeterministic() {
    let original = |ctx: duratask::OrchestrationContext| async move {
        ctx.schedule_activity("Double", "21").into_activity().await
    };
    let history = run_turn(vec![started(1)], "inst", 1, 1_000, original).history;

    let changed = |ctx: duratask::OrchestrationContext| async move {
        ctx.schedule_activity("Double", "99").into_activity().await
    };
    let out = run_turn(history, "inst", 1, 1_000, changed);
    assert!(out.nondeterminism.is_some());
}

#[test]
fn runtime_values_are_captured_once_and_replayed() {
    let orchestrator = |ctx: duratask::OrchestrationContext| async move {
        let guid = ctx.new_guid();
        let now = ctx.utc_now_ms();
        let a = ctx.schedule_activity("Echo", "x").into_activity().await?;
        Ok(format!("{guid}:{now}:{a}"))
    };

    let out = run_turn(vec![started(1)], "inst", 1, 5_000, orchestrator);
    let mut history = out.history;
    let sched_id = history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::ActivityScheduled { event_id, .. } => Some(*event_id),
            _ => None,
        })
        .unwrap();
    let next_id = history.last().unwrap().event_id() + 1;
    history.push(HistoryEvent::ActivityCompleted {
        event_id: next_id,
        source_event_id: sched_id,
        result: "x".into(),
    });

    // A different wall clock on replay must not change the recorded values.
    let first = run_turn(history.clone(), "inst", 1, 7_000, orchestrator)
        .output
        .unwrap()
        .unwrap();
    let second = run_turn(history, "inst", 1, 8_500, orchestrator)
        .output
        .unwrap()
        .unwrap();
    assert_eq!(first, second);
    assert!(first.contains(":5000:"), "utc_now must come from the recorded turn");
}

#[test]
fn join_observes_results_in_recorded_completion_order() {
    let orchestrator = |ctx: duratask::OrchestrationContext| async move {
        let futs = vec![
            ctx.schedule_activity("Id", "2"),
            ctx.schedule_activity("Id", "4"),
            ctx.schedule_activity("Id", "6"),
        ];
        let outputs = ctx.join(futs).await;
        let mut seen = Vec::new();
        let mut sum = 0i64;
        for out in outputs {
            match out {
                DurableOutput::Activity(Ok(v)) => {
                    sum += v.parse::<i64>().unwrap();
                    seen.push(v);
                }
                other => return Err(format!("unexpected output: {other:?}")),
            }
        }
        Ok(format!("{}:{sum}", seen.join(",")))
    };

    let out = run_turn(vec![started(1)], "inst", 1, 1_000, orchestrator);
    assert_eq!(out.decisions.len(), 3);
    let mut history = out.history;

    // Completions arrive out of schedule order: 6 first, then 2, then 4.
    let ids: Vec<u64> = history
        .iter()
        .filter_map(|e| match e {
            HistoryEvent::ActivityScheduled { event_id, .. } => Some(*event_id),
            _ => None,
        })
        .collect();
    let mut next_id = history.last().unwrap().event_id() + 1;
    for (source, result) in [(ids[2], "6"), (ids[0], "2"), (ids[1], "4")] {
        history.push(HistoryEvent::ActivityCompleted {
            event_id: next_id,
            source_event_id: source,
            result: result.into(),
        });
        next_id += 1;
    }

    let out = run_turn(history, "inst", 1, 1_000, orchestrator);
    let result = out.output.unwrap().unwrap();
    // Aggregation sees all three regardless of order, in completion order.
    assert_eq!(result, "6,2,4:12");
}

#[test]
fn select_winner_is_the_first_recorded_completion() {
    let orchestrator = |ctx: duratask::OrchestrationContext| async move {
        let activity = ctx.schedule_activity("Slow", "x");
        let timer = ctx.schedule_timer(1_000);
        let (winner, _) = ctx.select(vec![activity, timer]).await;
        if winner == 1 {
            Ok("timeout".to_string())
        } else {
            Ok("activity".to_string())
        }
    };

    let out = run_turn(vec![started(1)], "inst", 1, 1_000, orchestrator);
    let mut history = out.history;
    let timer_id = history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::TimerCreated { event_id, .. } => Some(*event_id),
            _ => None,
        })
        .unwrap();
    let next_id = history.last().unwrap().event_id() + 1;
    history.push(HistoryEvent::TimerFired {
        event_id: next_id,
        source_event_id: timer_id,
        fire_at_ms: 2_000,
    });

    let out = run_turn(history.clone(), "inst", 1, 1_000, orchestrator);
    assert_eq!(out.output.unwrap().unwrap(), "timeout");

    // Late activity completion after the lost race does not change the result.
    let activity_id = history
        .iter()
        .find_map(|e| match e {
            HistoryEvent::ActivityScheduled { event_id, .. } => Some(*event_id),
            _ => None,
        })
        .unwrap();
    let next_id = history.last().unwrap().event_id() + 1;
    history.push(HistoryEvent::ActivityCompleted {
        event_id: next_id,
        source_event_id: activity_id,
        result: "late".into(),
    });
    let out = run_turn(history, "inst", 1, 1_000, orchestrator);
    assert_eq!(out.output.unwrap().unwrap(), "timeout");
}
