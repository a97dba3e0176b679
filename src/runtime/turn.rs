//! One orchestration turn: completion batch -> replay -> history delta.
//!
//! Lifecycle per locked batch: convert queue messages into completion events
//! (with duplicate and staleness filtering and nondeterminism checks), replay
//! the orchestrator against baseline + delta, then hand the combined delta
//! and follow-on work items back for one atomic commit.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::{EntityCaller, WorkItem};
use crate::runtime::OrchestrationHandler;
use crate::{run_turn, Decision, HistoryEvent};

/// Outcome of executing the orchestrator for one turn.
#[derive(Debug)]
pub(crate) enum TurnResult {
    /// Suspended at a new scheduling point; instance keeps running.
    Continue,
    Completed(String),
    Failed(String),
    ContinueAsNew(String),
}

pub(crate) struct OrchestrationTurn {
    instance: String,
    execution_id: u64,
    baseline_history: Vec<HistoryEvent>,
    history_delta: Vec<HistoryEvent>,
    decisions: Vec<Decision>,
    next_event_id: u64,
    nondet_error: Option<String>,
    /// Reason when a terminate control was applied this turn.
    terminated: Option<String>,
}

impl OrchestrationTurn {
    pub fn new(instance: String, execution_id: u64, baseline_history: Vec<HistoryEvent>) -> Self {
        let next_event_id = baseline_history
            .last()
            .map(|e| e.event_id() + 1)
            .unwrap_or(crate::INITIAL_EVENT_ID);
        Self {
            instance,
            execution_id,
            baseline_history,
            history_delta: Vec::new(),
            decisions: Vec::new(),
            next_event_id,
            nondet_error: None,
            terminated: None,
        }
    }

    pub fn baseline_len(&self) -> u64 {
        self.baseline_history.len() as u64
    }

    pub fn history_delta(&self) -> &[HistoryEvent] {
        &self.history_delta
    }

    pub fn take_history_delta(&mut self) -> Vec<HistoryEvent> {
        std::mem::take(&mut self.history_delta)
    }

    pub fn final_history(&self) -> Vec<HistoryEvent> {
        let mut h = self.baseline_history.clone();
        h.extend(self.history_delta.clone());
        h
    }

    pub fn terminated_reason(&self) -> Option<&str> {
        self.terminated.as_deref()
    }

    fn push_event(&mut self, mut event: HistoryEvent) {
        event.set_event_id(self.next_event_id);
        self.next_event_id += 1;
        self.history_delta.push(event);
    }

    /// Seed the started event for a brand-new execution.
    pub fn push_started(&mut self, event: HistoryEvent) {
        self.push_event(event);
    }

    fn all_events(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.baseline_history.iter().chain(self.history_delta.iter())
    }

    pub fn is_suspended(&self) -> bool {
        let mut suspended = false;
        for e in self.all_events() {
            match e {
                HistoryEvent::ExecutionSuspended { .. } => suspended = true,
                HistoryEvent::ExecutionResumed { .. } => suspended = false,
                _ => {}
            }
        }
        suspended
    }

    fn schedule_kind_of(&self, id: u64) -> Option<&'static str> {
        self.all_events().find_map(|e| match e {
            HistoryEvent::ActivityScheduled { event_id, .. } if *event_id == id => Some("activity"),
            HistoryEvent::TimerCreated { event_id, .. } if *event_id == id => Some("timer"),
            HistoryEvent::SubOrchestrationScheduled { event_id, .. } if *event_id == id => Some("suborchestration"),
            HistoryEvent::EntityOperationScheduled { event_id, .. } if *event_id == id => Some("entity"),
            _ => None,
        })
    }

    fn completion_recorded(&self, id: u64) -> bool {
        self.all_events().any(|e| match e {
            HistoryEvent::ActivityCompleted { source_event_id, .. }
            | HistoryEvent::ActivityFailed { source_event_id, .. }
            | HistoryEvent::TimerFired { source_event_id, .. }
            | HistoryEvent::SubOrchestrationCompleted { source_event_id, .. }
            | HistoryEvent::SubOrchestrationFailed { source_event_id, .. }
            | HistoryEvent::EntityOperationCompleted { source_event_id, .. }
            | HistoryEvent::EntityOperationFailed { source_event_id, .. } => *source_event_id == id,
            _ => false,
        })
    }

    fn validate_schedule(&mut self, id: u64, expected: &'static str) -> bool {
        match self.schedule_kind_of(id) {
            Some(kind) if kind == expected => true,
            Some(kind) => {
                self.nondet_error = Some(format!(
                    "nondeterministic: completion kind mismatch for id={id}: scheduled '{kind}', completed '{expected}'"
                ));
                false
            }
            None => {
                self.nondet_error = Some(format!("nondeterministic: no matching schedule for completion id={id}"));
                false
            }
        }
    }

    /// Stage 1: fold the message batch into completion/control events.
    pub fn prep_completions(&mut self, messages: Vec<WorkItem>) {
        for msg in messages {
            match msg {
                WorkItem::ActivityCompleted {
                    execution_id,
                    id,
                    result,
                    ..
                } => {
                    if execution_id != self.execution_id {
                        warn!(instance = %self.instance, id, "dropping completion from a previous execution");
                        continue;
                    }
                    if self.completion_recorded(id) {
                        warn!(instance = %self.instance, id, "dropping duplicate activity completion");
                        continue;
                    }
                    if self.validate_schedule(id, "activity") {
                        self.push_event(HistoryEvent::ActivityCompleted {
                            event_id: 0,
                            source_event_id: id,
                            result,
                        });
                    }
                }
                WorkItem::ActivityFailed {
                    execution_id, id, error, ..
                } => {
                    if execution_id != self.execution_id {
                        warn!(instance = %self.instance, id, "dropping completion from a previous execution");
                        continue;
                    }
                    if self.completion_recorded(id) {
                        continue;
                    }
                    if self.validate_schedule(id, "activity") {
                        self.push_event(HistoryEvent::ActivityFailed {
                            event_id: 0,
                            source_event_id: id,
                            error,
                        });
                    }
                }
                WorkItem::TimerFired {
                    execution_id,
                    id,
                    fire_at_ms,
                    ..
                } => {
                    if execution_id != self.execution_id || self.completion_recorded(id) {
                        continue;
                    }
                    if self.validate_schedule(id, "timer") {
                        self.push_event(HistoryEvent::TimerFired {
                            event_id: 0,
                            source_event_id: id,
                            fire_at_ms,
                        });
                    }
                }
                WorkItem::ExternalRaised { name, data, .. } => {
                    // Buffered: recorded whether or not a subscription exists
                    // yet. A later wait will observe it.
                    let duplicate = self.all_events().any(|e| {
                        matches!(e, HistoryEvent::ExternalRaised { name: n, data: d, .. } if *n == name && *d == data)
                    });
                    if duplicate {
                        warn!(instance = %self.instance, event = %name, "dropping duplicate external event");
                        continue;
                    }
                    self.push_event(HistoryEvent::ExternalRaised {
                        event_id: 0,
                        name,
                        data,
                    });
                }
                WorkItem::SubOrchCompleted {
                    parent_execution_id,
                    parent_id,
                    result,
                    ..
                } => {
                    if parent_execution_id != self.execution_id || self.completion_recorded(parent_id) {
                        continue;
                    }
                    if self.validate_schedule(parent_id, "suborchestration") {
                        self.push_event(HistoryEvent::SubOrchestrationCompleted {
                            event_id: 0,
                            source_event_id: parent_id,
                            result,
                        });
                    }
                }
                WorkItem::SubOrchFailed {
                    parent_execution_id,
                    parent_id,
                    error,
                    ..
                } => {
                    if parent_execution_id != self.execution_id || self.completion_recorded(parent_id) {
                        continue;
                    }
                    if self.validate_schedule(parent_id, "suborchestration") {
                        self.push_event(HistoryEvent::SubOrchestrationFailed {
                            event_id: 0,
                            source_event_id: parent_id,
                            error,
                        });
                    }
                }
                WorkItem::EntityOpCompleted {
                    execution_id, id, result, ..
                } => {
                    if execution_id != self.execution_id || self.completion_recorded(id) {
                        continue;
                    }
                    if self.validate_schedule(id, "entity") {
                        self.push_event(HistoryEvent::EntityOperationCompleted {
                            event_id: 0,
                            source_event_id: id,
                            result,
                        });
                    }
                }
                WorkItem::EntityOpFailed {
                    execution_id, id, error, ..
                } => {
                    if execution_id != self.execution_id || self.completion_recorded(id) {
                        continue;
                    }
                    if self.validate_schedule(id, "entity") {
                        self.push_event(HistoryEvent::EntityOperationFailed {
                            event_id: 0,
                            source_event_id: id,
                            error,
                        });
                    }
                }
                WorkItem::SuspendInstance { reason, .. } => {
                    if !self.is_suspended() && self.terminated.is_none() {
                        self.push_event(HistoryEvent::ExecutionSuspended { event_id: 0, reason });
                    }
                }
                WorkItem::ResumeInstance { reason, .. } => {
                    if self.is_suspended() {
                        self.push_event(HistoryEvent::ExecutionResumed { event_id: 0, reason });
                    }
                }
                WorkItem::TerminateInstance { reason, .. } => {
                    if self.terminated.is_none() {
                        self.terminated = Some(reason.clone());
                        self.push_event(HistoryEvent::OrchestrationTerminated { event_id: 0, reason });
                    }
                }
                other => {
                    warn!(instance = %self.instance, kind = other.kind(), "unexpected item in completion batch");
                }
            }
        }
        debug!(
            instance = %self.instance,
            events = self.history_delta.len(),
            "completion batch folded into history delta"
        );
    }

    /// Stage 2: replay the orchestrator against baseline + delta.
    pub fn execute(
        &mut self,
        handler: Arc<dyn OrchestrationHandler>,
        input: String,
        turn_wall_ms: u64,
    ) -> TurnResult {
        if let Some(err) = self.nondet_error.clone() {
            return TurnResult::Failed(err);
        }

        let working = self.final_history();
        let working_len = working.len();
        let instance = self.instance.clone();
        let execution_id = self.execution_id;

        let run = catch_unwind(AssertUnwindSafe(|| {
            run_turn(working, &instance, execution_id, turn_wall_ms, move |ctx| {
                let handler = handler.clone();
                let input = input.clone();
                async move { handler.invoke(ctx, input).await }
            })
        }));

        let output = match run {
            Ok(o) => o,
            Err(payload) => {
                let msg = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "orchestration panicked".to_string()
                };
                return TurnResult::Failed(format!("orchestration panicked: {msg}"));
            }
        };

        if let Some(err) = output.nondeterminism {
            return TurnResult::Failed(err);
        }

        if output.history.len() > working_len {
            self.history_delta.extend(output.history[working_len..].to_vec());
            self.next_event_id = output.history.last().map(|e| e.event_id() + 1).unwrap_or(self.next_event_id);
        }
        self.decisions = output.decisions;

        if let Some(input) = output.continued_as_new {
            return TurnResult::ContinueAsNew(input);
        }
        match output.output {
            Some(Ok(result)) => TurnResult::Completed(result),
            Some(Err(error)) => TurnResult::Failed(error),
            None => TurnResult::Continue,
        }
    }

    /// Append a terminal event produced by the turn result.
    pub fn push_terminal(&mut self, event: HistoryEvent) {
        self.push_event(event);
    }

    pub fn made_progress(&self) -> bool {
        !self.history_delta.is_empty()
    }

    /// Convert recorded decisions into queue work items:
    /// (worker, timer, orchestrator, entity).
    pub fn work_items(&self) -> (Vec<WorkItem>, Vec<WorkItem>, Vec<WorkItem>, Vec<WorkItem>) {
        let mut worker = Vec::new();
        let mut timer = Vec::new();
        let mut orchestrator = Vec::new();
        let mut entity = Vec::new();
        for d in &self.decisions {
            match d {
                Decision::CallActivity {
                    scheduling_event_id,
                    name,
                    input,
                } => worker.push(WorkItem::ActivityExecute {
                    instance: self.instance.clone(),
                    execution_id: self.execution_id,
                    id: *scheduling_event_id,
                    name: name.clone(),
                    input: input.clone(),
                }),
                Decision::CreateTimer {
                    scheduling_event_id,
                    fire_at_ms,
                } => timer.push(WorkItem::TimerSchedule {
                    instance: self.instance.clone(),
                    execution_id: self.execution_id,
                    id: *scheduling_event_id,
                    fire_at_ms: *fire_at_ms,
                }),
                Decision::WaitExternal { .. } => {}
                Decision::StartSubOrchestration {
                    scheduling_event_id,
                    name,
                    instance,
                    input,
                } => orchestrator.push(WorkItem::StartOrchestration {
                    instance: instance.clone(),
                    orchestration: name.clone(),
                    version: None,
                    input: input.clone(),
                    parent_instance: Some(self.instance.clone()),
                    parent_id: Some(*scheduling_event_id),
                }),
                Decision::CallEntity {
                    scheduling_event_id,
                    entity: entity_id,
                    op,
                    input,
                    signal,
                } => entity.push(WorkItem::EntityOperation {
                    entity: entity_id.clone(),
                    op: op.clone(),
                    input: input.clone(),
                    caller: if *signal {
                        None
                    } else {
                        Some(EntityCaller {
                            instance: self.instance.clone(),
                            execution_id: self.execution_id,
                            id: *scheduling_event_id,
                        })
                    },
                }),
                Decision::ContinueAsNew { .. } => {}
            }
        }
        (worker, timer, orchestrator, entity)
    }
}
