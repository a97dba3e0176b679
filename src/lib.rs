//! Durable orchestration engine.
//!
//! Orchestrations are long-running workflows persisted as append-only event
//! histories and executed by deterministic replay: orchestrator code re-runs
//! from the top on every trigger, consuming recorded events instead of
//! re-performing side effects, until it reaches a new suspension point or
//! completes. Activities, timers, sub-orchestrations, external events and
//! entity operations are the suspension points; each one is correlated to its
//! completion through history event ids.
//!
//! The crate is split into:
//! - this module: the event model, the orchestration context and the
//!   single-turn replay executor,
//! - [`futures`]: the durable future machinery (claim/consume against history),
//! - [`backend`]: pluggable durable storage (history, queues, entity state),
//! - [`runtime`]: the dispatcher loops that drive orchestrations, activities,
//!   timers and entities against a backend,
//! - [`client`]: the management surface (start, signal, terminate, purge).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

pub mod backend;
pub mod client;
mod futures;
pub mod retry;
pub mod runtime;

pub use crate::futures::{DurableFuture, DurableOutput, JoinFuture, SelectFuture};
pub use client::{Client, ClientError, PurgeOutcome, RetentionPolicy, TerminalStatus};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use runtime::status::{OrchestrationStatus, WaitError};
pub use runtime::{
    ActivityContext, ActivityRegistry, EntityContext, EntityRegistry, OrchestrationRegistry, Runtime, RuntimeOptions,
};

/// First event id of every execution.
pub const INITIAL_EVENT_ID: u64 = 1;
/// First execution id of every instance.
pub const INITIAL_EXECUTION_ID: u64 = 1;

pub(crate) const RUNTIME_OP_GUID: &str = "guid";
pub(crate) const RUNTIME_OP_UTC_NOW: &str = "utcnow";

/// Identity of a durable entity: a named handler plus a partition key.
///
/// Operations against the same `(name, key)` pair are serialized; distinct
/// keys process independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub name: String,
    pub key: String,
}

impl EntityId {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.key)
    }
}

/// One entry in an orchestration's append-only history.
///
/// `event_id` is monotonic per execution starting at [`INITIAL_EVENT_ID`] and
/// defines the total order replay observes. Completion events reference the
/// scheduling event they answer through `source_event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryEvent {
    OrchestrationStarted {
        event_id: u64,
        name: String,
        version: String,
        input: String,
        started_at_ms: u64,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    ActivityScheduled {
        event_id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    ActivityFailed {
        event_id: u64,
        source_event_id: u64,
        error: String,
    },
    TimerCreated {
        event_id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        event_id: u64,
        source_event_id: u64,
        fire_at_ms: u64,
    },
    ExternalSubscribed {
        event_id: u64,
        name: String,
    },
    /// An external event delivered into history. Raises are buffered: the
    /// event may precede the matching subscription, in which case a later
    /// wait observes it.
    ExternalRaised {
        event_id: u64,
        name: String,
        data: String,
    },
    SubOrchestrationScheduled {
        event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        event_id: u64,
        source_event_id: u64,
        error: String,
    },
    EntityOperationScheduled {
        event_id: u64,
        entity: EntityId,
        op: String,
        input: String,
        signal: bool,
    },
    EntityOperationCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    EntityOperationFailed {
        event_id: u64,
        source_event_id: u64,
        error: String,
    },
    /// A non-deterministic value (guid, wall clock, trace marker) captured on
    /// first execution and replayed verbatim afterwards.
    RuntimeValue {
        event_id: u64,
        op: String,
        value: String,
    },
    CustomStatusSet {
        event_id: u64,
        value: String,
    },
    ExecutionSuspended {
        event_id: u64,
        reason: String,
    },
    ExecutionResumed {
        event_id: u64,
        reason: String,
    },
    OrchestrationCompleted {
        event_id: u64,
        output: String,
    },
    OrchestrationFailed {
        event_id: u64,
        error: String,
    },
    OrchestrationTerminated {
        event_id: u64,
        reason: String,
    },
    OrchestrationContinuedAsNew {
        event_id: u64,
        input: String,
    },
}

impl HistoryEvent {
    pub fn event_id(&self) -> u64 {
        match self {
            HistoryEvent::OrchestrationStarted { event_id, .. }
            | HistoryEvent::ActivityScheduled { event_id, .. }
            | HistoryEvent::ActivityCompleted { event_id, .. }
            | HistoryEvent::ActivityFailed { event_id, .. }
            | HistoryEvent::TimerCreated { event_id, .. }
            | HistoryEvent::TimerFired { event_id, .. }
            | HistoryEvent::ExternalSubscribed { event_id, .. }
            | HistoryEvent::ExternalRaised { event_id, .. }
            | HistoryEvent::SubOrchestrationScheduled { event_id, .. }
            | HistoryEvent::SubOrchestrationCompleted { event_id, .. }
            | HistoryEvent::SubOrchestrationFailed { event_id, .. }
            | HistoryEvent::EntityOperationScheduled { event_id, .. }
            | HistoryEvent::EntityOperationCompleted { event_id, .. }
            | HistoryEvent::EntityOperationFailed { event_id, .. }
            | HistoryEvent::RuntimeValue { event_id, .. }
            | HistoryEvent::CustomStatusSet { event_id, .. }
            | HistoryEvent::ExecutionSuspended { event_id, .. }
            | HistoryEvent::ExecutionResumed { event_id, .. }
            | HistoryEvent::OrchestrationCompleted { event_id, .. }
            | HistoryEvent::OrchestrationFailed { event_id, .. }
            | HistoryEvent::OrchestrationTerminated { event_id, .. }
            | HistoryEvent::OrchestrationContinuedAsNew { event_id, .. } => *event_id,
        }
    }

    pub(crate) fn set_event_id(&mut self, id: u64) {
        match self {
            HistoryEvent::OrchestrationStarted { event_id, .. }
            | HistoryEvent::ActivityScheduled { event_id, .. }
            | HistoryEvent::ActivityCompleted { event_id, .. }
            | HistoryEvent::ActivityFailed { event_id, .. }
            | HistoryEvent::TimerCreated { event_id, .. }
            | HistoryEvent::TimerFired { event_id, .. }
            | HistoryEvent::ExternalSubscribed { event_id, .. }
            | HistoryEvent::ExternalRaised { event_id, .. }
            | HistoryEvent::SubOrchestrationScheduled { event_id, .. }
            | HistoryEvent::SubOrchestrationCompleted { event_id, .. }
            | HistoryEvent::SubOrchestrationFailed { event_id, .. }
            | HistoryEvent::EntityOperationScheduled { event_id, .. }
            | HistoryEvent::EntityOperationCompleted { event_id, .. }
            | HistoryEvent::EntityOperationFailed { event_id, .. }
            | HistoryEvent::RuntimeValue { event_id, .. }
            | HistoryEvent::CustomStatusSet { event_id, .. }
            | HistoryEvent::ExecutionSuspended { event_id, .. }
            | HistoryEvent::ExecutionResumed { event_id, .. }
            | HistoryEvent::OrchestrationCompleted { event_id, .. }
            | HistoryEvent::OrchestrationFailed { event_id, .. }
            | HistoryEvent::OrchestrationTerminated { event_id, .. }
            | HistoryEvent::OrchestrationContinuedAsNew { event_id, .. } => *event_id = id,
        }
    }

    /// Terminal events close an execution; nothing may be appended after one.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HistoryEvent::OrchestrationCompleted { .. }
                | HistoryEvent::OrchestrationFailed { .. }
                | HistoryEvent::OrchestrationTerminated { .. }
                | HistoryEvent::OrchestrationContinuedAsNew { .. }
        )
    }

    /// Completion events answer a scheduling event and are consumed by replay
    /// in history order.
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            HistoryEvent::ActivityCompleted { .. }
                | HistoryEvent::ActivityFailed { .. }
                | HistoryEvent::TimerFired { .. }
                | HistoryEvent::ExternalRaised { .. }
                | HistoryEvent::SubOrchestrationCompleted { .. }
                | HistoryEvent::SubOrchestrationFailed { .. }
                | HistoryEvent::EntityOperationCompleted { .. }
                | HistoryEvent::EntityOperationFailed { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            HistoryEvent::OrchestrationStarted { .. } => "OrchestrationStarted",
            HistoryEvent::ActivityScheduled { .. } => "ActivityScheduled",
            HistoryEvent::ActivityCompleted { .. } => "ActivityCompleted",
            HistoryEvent::ActivityFailed { .. } => "ActivityFailed",
            HistoryEvent::TimerCreated { .. } => "TimerCreated",
            HistoryEvent::TimerFired { .. } => "TimerFired",
            HistoryEvent::ExternalSubscribed { .. } => "ExternalSubscribed",
            HistoryEvent::ExternalRaised { .. } => "ExternalRaised",
            HistoryEvent::SubOrchestrationScheduled { .. } => "SubOrchestrationScheduled",
            HistoryEvent::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            HistoryEvent::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            HistoryEvent::EntityOperationScheduled { .. } => "EntityOperationScheduled",
            HistoryEvent::EntityOperationCompleted { .. } => "EntityOperationCompleted",
            HistoryEvent::EntityOperationFailed { .. } => "EntityOperationFailed",
            HistoryEvent::RuntimeValue { .. } => "RuntimeValue",
            HistoryEvent::CustomStatusSet { .. } => "CustomStatusSet",
            HistoryEvent::ExecutionSuspended { .. } => "ExecutionSuspended",
            HistoryEvent::ExecutionResumed { .. } => "ExecutionResumed",
            HistoryEvent::OrchestrationCompleted { .. } => "OrchestrationCompleted",
            HistoryEvent::OrchestrationFailed { .. } => "OrchestrationFailed",
            HistoryEvent::OrchestrationTerminated { .. } => "OrchestrationTerminated",
            HistoryEvent::OrchestrationContinuedAsNew { .. } => "OrchestrationContinuedAsNew",
        }
    }
}

/// A side effect requested by orchestrator code during a turn.
///
/// Decisions are recorded the first time a scheduling point executes; on
/// replay the corresponding history event is claimed instead and no decision
/// is produced. The runtime converts decisions into durable work items in the
/// same commit that persists the history delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    CallActivity {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    WaitExternal {
        scheduling_event_id: u64,
        name: String,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    CallEntity {
        scheduling_event_id: u64,
        entity: EntityId,
        op: String,
        input: String,
        signal: bool,
    },
    ContinueAsNew {
        input: String,
    },
}

/// Shared state behind [`OrchestrationContext`]: the working history, the
/// replay cursors and everything recorded during the current turn.
pub(crate) struct CtxInner {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    pub(crate) history: Vec<HistoryEvent>,
    pub(crate) next_event_id: u64,
    /// Scheduling events already matched to a live future this turn.
    pub(crate) claimed_scheduling: HashSet<u64>,
    /// Completion events already consumed this turn (FIFO gate).
    pub(crate) consumed_completions: HashSet<u64>,
    /// Scheduling ids whose completions lost a select race; their completions
    /// never block FIFO consumption.
    pub(crate) cancelled_sources: HashSet<u64>,
    pub(crate) decisions: Vec<Decision>,
    /// Logical clock: started-at of the current execution, advanced by
    /// consumed timer firings. Never read from the live system clock.
    pub(crate) logical_now_ms: u64,
    /// Wall clock at turn start; only consulted when recording new events.
    pub(crate) turn_wall_ms: u64,
    pub(crate) guid_seq: u64,
    pub(crate) nondeterminism: Option<String>,
    pub(crate) continue_as_new: bool,
}

impl CtxInner {
    fn new(history: Vec<HistoryEvent>, instance: String, execution_id: u64, turn_wall_ms: u64) -> Self {
        let next_event_id = history.last().map(|e| e.event_id() + 1).unwrap_or(INITIAL_EVENT_ID);
        let logical_now_ms = history
            .iter()
            .rev()
            .find_map(|e| match e {
                HistoryEvent::OrchestrationStarted { started_at_ms, .. } => Some(*started_at_ms),
                _ => None,
            })
            .unwrap_or(turn_wall_ms);
        Self {
            instance,
            execution_id,
            history,
            next_event_id,
            claimed_scheduling: HashSet::new(),
            consumed_completions: HashSet::new(),
            cancelled_sources: HashSet::new(),
            decisions: Vec::new(),
            logical_now_ms,
            turn_wall_ms,
            guid_seq: 0,
            nondeterminism: None,
            continue_as_new: false,
        }
    }

    pub(crate) fn allocate_event_id(&mut self) -> u64 {
        let id = self.next_event_id;
        self.next_event_id += 1;
        id
    }

    pub(crate) fn observe_time(&mut self, fire_at_ms: u64) {
        if fire_at_ms > self.logical_now_ms {
            self.logical_now_ms = fire_at_ms;
        }
    }

    pub(crate) fn record_decision(&mut self, d: Decision) {
        self.decisions.push(d);
    }

    /// Claim a recorded `RuntimeValue` by op, or record a fresh one with the
    /// value the closure computes. Runtime values do not participate in the
    /// strict scheduling order; they match loosely among unclaimed events of
    /// the same op.
    fn claim_or_record_runtime_value(&mut self, op: &str, live_value: impl FnOnce(&mut Self) -> String) -> String {
        let found = self.history.iter().find_map(|e| match e {
            HistoryEvent::RuntimeValue { event_id, op: o, value }
                if o == op && !self.claimed_scheduling.contains(event_id) =>
            {
                Some((*event_id, value.clone()))
            }
            _ => None,
        });
        if let Some((event_id, value)) = found {
            self.claimed_scheduling.insert(event_id);
            return value;
        }
        let value = live_value(self);
        let event_id = self.allocate_event_id();
        self.claimed_scheduling.insert(event_id);
        self.history.push(HistoryEvent::RuntimeValue {
            event_id,
            op: op.to_string(),
            value: value.clone(),
        });
        value
    }
}

/// Handle passed to orchestrator code. Cheap to clone; all scheduling APIs
/// return [`DurableFuture`]s that replay against the instance history.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(history: Vec<HistoryEvent>, instance: String, execution_id: u64, turn_wall_ms: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(history, instance, execution_id, turn_wall_ms))),
        }
    }

    /// Instance id of the orchestration being replayed.
    pub fn instance(&self) -> String {
        self.inner.lock().unwrap().instance.clone()
    }

    /// Execution id (starts at 1, incremented by continue-as-new).
    pub fn execution_id(&self) -> u64 {
        self.inner.lock().unwrap().execution_id
    }

    /// Deterministic logical clock in epoch milliseconds: the execution's
    /// start time advanced by fired timers. Stable across replays.
    pub fn now_ms(&self) -> u64 {
        self.inner.lock().unwrap().logical_now_ms
    }

    /// Wall-clock milliseconds, captured once and replayed thereafter.
    pub fn utc_now_ms(&self) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let v = inner.claim_or_record_runtime_value(RUNTIME_OP_UTC_NOW, |i| i.turn_wall_ms.to_string());
        v.parse().unwrap_or(0)
    }

    /// A fresh guid on first execution, the recorded one on replay.
    pub fn new_guid(&self) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.claim_or_record_runtime_value(RUNTIME_OP_GUID, |i| {
            i.guid_seq += 1;
            generate_guid(i.guid_seq)
        })
    }

    /// Replay-aware tracing: emits once when first executed, silent on replay.
    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace("INFO", message.into());
    }

    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace("WARN", message.into());
    }

    pub fn trace_error(&self, message: impl Into<String>) {
        self.trace("ERROR", message.into());
    }

    fn trace(&self, level: &str, message: String) {
        let mut inner = self.inner.lock().unwrap();
        let op = format!("trace:{level}:{message}");
        let instance = inner.instance.clone();
        let execution_id = inner.execution_id;
        // The closure only runs on first execution, so replay stays quiet.
        inner.claim_or_record_runtime_value(&op, |_| {
            match level {
                "ERROR" => {
                    tracing::error!(target: "duratask::orchestration", instance = %instance, execution_id, "{message}")
                }
                "WARN" => {
                    tracing::warn!(target: "duratask::orchestration", instance = %instance, execution_id, "{message}")
                }
                _ => tracing::info!(target: "duratask::orchestration", instance = %instance, execution_id, "{message}"),
            }
            String::new()
        });
    }

    /// Publish an opaque custom status value, visible through the client.
    pub fn set_custom_status(&self, value: impl Into<String>) {
        let value = value.into();
        let mut inner = self.inner.lock().unwrap();
        let found = inner.history.iter().find_map(|e| match e {
            HistoryEvent::CustomStatusSet { event_id, .. } if !inner.claimed_scheduling.contains(event_id) => {
                Some(*event_id)
            }
            _ => None,
        });
        if let Some(event_id) = found {
            inner.claimed_scheduling.insert(event_id);
            return;
        }
        let event_id = inner.allocate_event_id();
        inner.claimed_scheduling.insert(event_id);
        inner.history.push(HistoryEvent::CustomStatusSet { event_id, value });
    }

    /// Restart this instance with a fresh history and new input. The returned
    /// future never resolves; the current execution ends at this suspension.
    pub fn continue_as_new(&self, input: impl Into<String>) -> DurableFuture {
        let input = input.into();
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.continue_as_new {
                inner.continue_as_new = true;
                inner.record_decision(Decision::ContinueAsNew { input });
            }
        }
        crate::futures::never(self.clone())
    }

    pub(crate) fn take_decisions(&self) -> Vec<Decision> {
        std::mem::take(&mut self.inner.lock().unwrap().decisions)
    }

    pub(crate) fn nondeterminism(&self) -> Option<String> {
        self.inner.lock().unwrap().nondeterminism.clone()
    }

    pub(crate) fn final_history(&self) -> Vec<HistoryEvent> {
        self.inner.lock().unwrap().history.clone()
    }
}

/// Everything a single replay turn produced.
pub struct TurnOutput {
    /// Working history: baseline plus events recorded during this turn.
    pub history: Vec<HistoryEvent>,
    /// Newly recorded side-effect requests, in scheduling order.
    pub decisions: Vec<Decision>,
    /// Set when the orchestrator function returned.
    pub output: Option<Result<String, String>>,
    /// Set when replay diverged from recorded history.
    pub nondeterminism: Option<String>,
    /// Set when the orchestrator requested continue-as-new.
    pub continued_as_new: Option<String>,
}

/// Execute one cooperative turn of an orchestrator function against history.
///
/// The future is polled on a no-op waker until it neither completes nor
/// consumes further recorded completions: an async orchestrator makes all
/// the progress the recorded history allows, then suspends at the first
/// scheduling point with no recorded completion.
pub fn run_turn<F>(
    history: Vec<HistoryEvent>,
    instance: &str,
    execution_id: u64,
    turn_wall_ms: u64,
    orchestrator: impl FnOnce(OrchestrationContext) -> F,
) -> TurnOutput
where
    F: Future<Output = Result<String, String>>,
{
    let ctx = OrchestrationContext::new(history, instance.to_string(), execution_id, turn_wall_ms);
    let mut fut = orchestrator(ctx.clone());
    // Fixed-point polling: consuming one completion can unblock the FIFO
    // gate for another future that was already polled this pass, so re-poll
    // until a pass makes no progress. This keeps plain future combinators
    // (futures::join etc.) live alongside the context's own join/select.
    let poll = loop {
        let consumed_before = ctx.inner.lock().unwrap().consumed_completions.len();
        match poll_once(&mut fut) {
            Poll::Ready(out) => break Poll::Ready(out),
            Poll::Pending => {
                let consumed_after = ctx.inner.lock().unwrap().consumed_completions.len();
                if consumed_after == consumed_before {
                    break Poll::Pending;
                }
            }
        }
    };

    let mut decisions = Vec::new();
    let mut can_input = None;
    for d in ctx.take_decisions() {
        match d {
            Decision::ContinueAsNew { input } => can_input = Some(input),
            other => decisions.push(other),
        }
    }

    TurnOutput {
        history: ctx.final_history(),
        decisions,
        output: match poll {
            Poll::Ready(out) => Some(out),
            Poll::Pending => None,
        },
        nondeterminism: ctx.nondeterminism(),
        continued_as_new: can_input,
    }
}

fn noop_waker() -> Waker {
    unsafe fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    unsafe fn wake(_: *const ()) {}
    unsafe fn wake_by_ref(_: *const ()) {}
    unsafe fn drop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

fn poll_once<F: Future>(fut: &mut F) -> Poll<F::Output> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    // The future never moves between polls within run_turn.
    let pinned = unsafe { std::pin::Pin::new_unchecked(fut) };
    pinned.poll(&mut cx)
}

/// Epoch milliseconds from the system clock. Runtime-side only; orchestrator
/// code goes through the logical clock instead.
pub(crate) fn wall_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Uuid-shaped id derived from the clock plus a caller-supplied counter.
pub(crate) fn generate_guid(seq: u64) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (nanos >> 96) as u32,
        ((nanos >> 80) & 0xFFFF) as u16,
        (seq & 0xFFFF) as u16,
        ((nanos >> 64) & 0xFFFF) as u16,
        (nanos & 0xFFFF_FFFF_FFFF) as u64
    )
}

/// JSON codec used by the typed registration and client helpers.
pub(crate) mod codec {
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<String, String> {
        serde_json::to_string(value).map_err(|e| format!("encode: {e}"))
    }

    pub fn decode<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, String> {
        serde_json::from_str(s).map_err(|e| format!("decode: {e}"))
    }
}
