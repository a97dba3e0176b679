//! Durable futures: the replay-aware suspension points of orchestrator code.
//!
//! Every scheduling API on [`OrchestrationContext`] returns a [`DurableFuture`].
//! Polling one first *claims* the next unclaimed scheduling event in history
//! (adopting the recorded event on replay, or appending a new event plus a
//! [`Decision`] on first execution) and then resolves once the correlated
//! completion event is present and consumable.
//!
//! Correlated completions (activity, timer, sub-orchestration, entity) are
//! consumed strictly in recorded history order: a completion may only be
//! consumed once every earlier correlated completion has been consumed or
//! cancelled by a lost select race. That gate is what makes `join`/`select`
//! and interleaved awaits deterministic. External events are uncorrelated and
//! buffered; they are consumed per name in arrival order and neither block
//! nor are blocked by the gate.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::{CtxInner, Decision, EntityId, HistoryEvent, OrchestrationContext};

/// Resolved value of a durable suspension point.
#[derive(Debug, Clone)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
    SubOrchestration(Result<String, String>),
    Entity(Result<String, String>),
}

/// What a polling future expects the next scheduling event to be. A mismatch
/// against the recorded event is a nondeterminism fault.
enum Want<'a> {
    Activity { name: &'a str, input: &'a str },
    Timer,
    External { name: &'a str },
    SubOrch { name: &'a str, input: &'a str },
    Entity { entity: &'a EntityId, op: &'a str, signal: bool },
}

impl Want<'_> {
    fn describe(&self) -> String {
        match self {
            Want::Activity { name, input } => format!("ActivityScheduled('{name}','{input}')"),
            Want::Timer => "TimerCreated".to_string(),
            Want::External { name } => format!("ExternalSubscribed('{name}')"),
            Want::SubOrch { name, input } => format!("SubOrchestrationScheduled('{name}','{input}')"),
            Want::Entity { entity, op, signal } => {
                format!("EntityOperationScheduled('{entity}','{op}',signal={signal})")
            }
        }
    }
}

struct Claimed {
    event_id: u64,
    /// Child instance recorded for a sub-orchestration schedule.
    child_instance: Option<String>,
}

impl CtxInner {
    /// Find the next unclaimed scheduling event and match it against `want`.
    ///
    /// `Ok(Some(_))` adopts the recorded event (replay); `Ok(None)` means the
    /// caller is past the end of recorded schedules and must record a new one;
    /// `Err(())` records a nondeterminism fault (the flag is set here).
    fn claim_next_scheduling(&mut self, want: &Want<'_>) -> Result<Option<Claimed>, ()> {
        let mut found: Option<(usize, u64)> = None;
        for (idx, event) in self.history.iter().enumerate() {
            let event_id = event.event_id();
            if self.claimed_scheduling.contains(&event_id) {
                continue;
            }
            match event {
                HistoryEvent::ActivityScheduled { .. }
                | HistoryEvent::TimerCreated { .. }
                | HistoryEvent::ExternalSubscribed { .. }
                | HistoryEvent::SubOrchestrationScheduled { .. }
                | HistoryEvent::EntityOperationScheduled { .. } => {
                    found = Some((idx, event_id));
                    break;
                }
                _ => {}
            }
        }

        let Some((idx, event_id)) = found else {
            return Ok(None);
        };

        let matches = |event: &HistoryEvent| -> Option<Option<String>> {
            match (event, want) {
                (HistoryEvent::ActivityScheduled { name, input, .. }, Want::Activity { name: n, input: i }) => {
                    (name.as_str() == *n && input.as_str() == *i).then_some(None)
                }
                (HistoryEvent::TimerCreated { .. }, Want::Timer) => Some(None),
                (HistoryEvent::ExternalSubscribed { name, .. }, Want::External { name: n }) => {
                    (name.as_str() == *n).then_some(None)
                }
                (
                    HistoryEvent::SubOrchestrationScheduled { name, input, instance, .. },
                    Want::SubOrch { name: n, input: i },
                ) => (name.as_str() == *n && input.as_str() == *i).then_some(Some(instance.clone())),
                (
                    HistoryEvent::EntityOperationScheduled { entity, op, signal, .. },
                    Want::Entity {
                        entity: e,
                        op: o,
                        signal: s,
                    },
                ) => (entity == *e && op.as_str() == *o && *signal == *s).then_some(None),
                _ => None,
            }
        };

        match matches(&self.history[idx]) {
            Some(child_instance) => {
                self.claimed_scheduling.insert(event_id);
                Ok(Some(Claimed {
                    event_id,
                    child_instance,
                }))
            }
            None => {
                self.nondeterminism = Some(format!(
                    "nondeterministic: schedule order mismatch: recorded next is {} but live code requested {}",
                    self.history[idx].kind(),
                    want.describe()
                ));
                Err(())
            }
        }
    }

    /// FIFO gate for correlated completions: `completion_event_id` may be
    /// consumed only when every earlier correlated completion has been
    /// consumed or belongs to a cancelled source.
    fn can_consume_completion(&self, completion_event_id: u64) -> bool {
        self.history.iter().all(|e| {
            let (event_id, source) = match e {
                HistoryEvent::ActivityCompleted {
                    event_id,
                    source_event_id,
                    ..
                }
                | HistoryEvent::ActivityFailed {
                    event_id,
                    source_event_id,
                    ..
                }
                | HistoryEvent::TimerFired {
                    event_id,
                    source_event_id,
                    ..
                }
                | HistoryEvent::SubOrchestrationCompleted {
                    event_id,
                    source_event_id,
                    ..
                }
                | HistoryEvent::SubOrchestrationFailed {
                    event_id,
                    source_event_id,
                    ..
                }
                | HistoryEvent::EntityOperationCompleted {
                    event_id,
                    source_event_id,
                    ..
                }
                | HistoryEvent::EntityOperationFailed {
                    event_id,
                    source_event_id,
                    ..
                } => (*event_id, *source_event_id),
                _ => return true,
            };
            if self.cancelled_sources.contains(&source) {
                return true;
            }
            event_id >= completion_event_id || self.consumed_completions.contains(&event_id)
        })
    }

    /// Completion event answering `source_event_id`, if recorded.
    fn find_correlated_completion(&self, source_event_id: u64) -> Option<(u64, DurableOutput)> {
        self.history.iter().find_map(|e| match e {
            HistoryEvent::ActivityCompleted {
                event_id,
                source_event_id: s,
                result,
            } if *s == source_event_id => Some((*event_id, DurableOutput::Activity(Ok(result.clone())))),
            HistoryEvent::ActivityFailed {
                event_id,
                source_event_id: s,
                error,
            } if *s == source_event_id => Some((*event_id, DurableOutput::Activity(Err(error.clone())))),
            HistoryEvent::TimerFired {
                event_id,
                source_event_id: s,
                ..
            } if *s == source_event_id => Some((*event_id, DurableOutput::Timer)),
            HistoryEvent::SubOrchestrationCompleted {
                event_id,
                source_event_id: s,
                result,
            } if *s == source_event_id => Some((*event_id, DurableOutput::SubOrchestration(Ok(result.clone())))),
            HistoryEvent::SubOrchestrationFailed {
                event_id,
                source_event_id: s,
                error,
            } if *s == source_event_id => Some((*event_id, DurableOutput::SubOrchestration(Err(error.clone())))),
            HistoryEvent::EntityOperationCompleted {
                event_id,
                source_event_id: s,
                result,
            } if *s == source_event_id => Some((*event_id, DurableOutput::Entity(Ok(result.clone())))),
            HistoryEvent::EntityOperationFailed {
                event_id,
                source_event_id: s,
                error,
            } if *s == source_event_id => Some((*event_id, DurableOutput::Entity(Err(error.clone())))),
            _ => None,
        })
    }
}

pub(crate) enum Kind {
    Activity {
        name: String,
        input: String,
        claimed: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    Timer {
        delay_ms: u64,
        claimed: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    External {
        name: String,
        claimed: Cell<Option<u64>>,
        cached: RefCell<Option<String>>,
        ctx: OrchestrationContext,
    },
    SubOrch {
        name: String,
        input: String,
        instance: RefCell<String>,
        claimed: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    Entity {
        entity: EntityId,
        op: String,
        input: String,
        signal: bool,
        claimed: Cell<Option<u64>>,
        ctx: OrchestrationContext,
    },
    /// Continue-as-new marker: never resolves.
    Never { _ctx: OrchestrationContext },
}

/// A single durable suspension point. Unpin by construction.
pub struct DurableFuture(pub(crate) Kind);

pub(crate) fn never(ctx: OrchestrationContext) -> DurableFuture {
    DurableFuture(Kind::Never { _ctx: ctx })
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &this.0 {
            Kind::Activity {
                name,
                input,
                claimed,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    match inner.claim_next_scheduling(&Want::Activity {
                        name: name.as_str(),
                        input: input.as_str(),
                    }) {
                        Err(()) => return Poll::Pending,
                        Ok(Some(c)) => claimed.set(Some(c.event_id)),
                        Ok(None) => {
                            let event_id = inner.allocate_event_id();
                            inner.claimed_scheduling.insert(event_id);
                            inner.history.push(HistoryEvent::ActivityScheduled {
                                event_id,
                                name: name.clone(),
                                input: input.clone(),
                            });
                            inner.record_decision(Decision::CallActivity {
                                scheduling_event_id: event_id,
                                name: name.clone(),
                                input: input.clone(),
                            });
                            claimed.set(Some(event_id));
                        }
                    }
                }
                let source = claimed.get().unwrap();
                if let Some((completion_id, output)) = inner.find_correlated_completion(source) {
                    if inner.can_consume_completion(completion_id) {
                        inner.consumed_completions.insert(completion_id);
                        return Poll::Ready(output);
                    }
                }
                Poll::Pending
            }
            Kind::Timer { delay_ms, claimed, ctx } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    match inner.claim_next_scheduling(&Want::Timer) {
                        Err(()) => return Poll::Pending,
                        Ok(Some(c)) => claimed.set(Some(c.event_id)),
                        Ok(None) => {
                            let base = inner.logical_now_ms.max(inner.turn_wall_ms);
                            let fire_at_ms = base.saturating_add(*delay_ms);
                            let event_id = inner.allocate_event_id();
                            inner.claimed_scheduling.insert(event_id);
                            inner.history.push(HistoryEvent::TimerCreated { event_id, fire_at_ms });
                            inner.record_decision(Decision::CreateTimer {
                                scheduling_event_id: event_id,
                                fire_at_ms,
                            });
                            claimed.set(Some(event_id));
                        }
                    }
                }
                let source = claimed.get().unwrap();
                if let Some((completion_id, output)) = inner.find_correlated_completion(source) {
                    if inner.can_consume_completion(completion_id) {
                        inner.consumed_completions.insert(completion_id);
                        let fired_at = inner.history.iter().find_map(|e| match e {
                            HistoryEvent::TimerFired {
                                source_event_id,
                                fire_at_ms,
                                ..
                            } if *source_event_id == source => Some(*fire_at_ms),
                            _ => None,
                        });
                        if let Some(t) = fired_at {
                            inner.observe_time(t);
                        }
                        return Poll::Ready(output);
                    }
                }
                Poll::Pending
            }
            Kind::External {
                name,
                claimed,
                cached,
                ctx,
            } => {
                if let Some(data) = cached.borrow().clone() {
                    return Poll::Ready(DurableOutput::External(data));
                }
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    match inner.claim_next_scheduling(&Want::External { name: name.as_str() }) {
                        Err(()) => return Poll::Pending,
                        Ok(Some(c)) => claimed.set(Some(c.event_id)),
                        Ok(None) => {
                            let event_id = inner.allocate_event_id();
                            inner.claimed_scheduling.insert(event_id);
                            inner.history.push(HistoryEvent::ExternalSubscribed {
                                event_id,
                                name: name.clone(),
                            });
                            inner.record_decision(Decision::WaitExternal {
                                scheduling_event_id: event_id,
                                name: name.clone(),
                            });
                            claimed.set(Some(event_id));
                        }
                    }
                }
                // Buffered delivery: the raise may predate the subscription.
                // Externals are uncorrelated, so they bypass the FIFO gate and
                // are consumed per name in arrival order.
                let hit = inner.history.iter().find_map(|e| match e {
                    HistoryEvent::ExternalRaised { event_id, name: n, data }
                        if n == name && !inner.consumed_completions.contains(event_id) =>
                    {
                        Some((*event_id, data.clone()))
                    }
                    _ => None,
                });
                if let Some((event_id, data)) = hit {
                    inner.consumed_completions.insert(event_id);
                    *cached.borrow_mut() = Some(data.clone());
                    return Poll::Ready(DurableOutput::External(data));
                }
                Poll::Pending
            }
            Kind::SubOrch {
                name,
                input,
                instance,
                claimed,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    match inner.claim_next_scheduling(&Want::SubOrch {
                        name: name.as_str(),
                        input: input.as_str(),
                    }) {
                        Err(()) => return Poll::Pending,
                        Ok(Some(c)) => {
                            if let Some(child) = c.child_instance {
                                *instance.borrow_mut() = child;
                            }
                            claimed.set(Some(c.event_id));
                        }
                        Ok(None) => {
                            let event_id = inner.allocate_event_id();
                            let child = format!("{}::sub-{}", inner.instance, event_id);
                            *instance.borrow_mut() = child.clone();
                            inner.claimed_scheduling.insert(event_id);
                            inner.history.push(HistoryEvent::SubOrchestrationScheduled {
                                event_id,
                                name: name.clone(),
                                instance: child.clone(),
                                input: input.clone(),
                            });
                            inner.record_decision(Decision::StartSubOrchestration {
                                scheduling_event_id: event_id,
                                name: name.clone(),
                                instance: child,
                                input: input.clone(),
                            });
                            claimed.set(Some(event_id));
                        }
                    }
                }
                let source = claimed.get().unwrap();
                if let Some((completion_id, output)) = inner.find_correlated_completion(source) {
                    if inner.can_consume_completion(completion_id) {
                        inner.consumed_completions.insert(completion_id);
                        return Poll::Ready(output);
                    }
                }
                Poll::Pending
            }
            Kind::Entity {
                entity,
                op,
                input,
                signal,
                claimed,
                ctx,
            } => {
                let mut inner = ctx.inner.lock().unwrap();
                if claimed.get().is_none() {
                    match inner.claim_next_scheduling(&Want::Entity {
                        entity,
                        op: op.as_str(),
                        signal: *signal,
                    }) {
                        Err(()) => return Poll::Pending,
                        Ok(Some(c)) => claimed.set(Some(c.event_id)),
                        Ok(None) => {
                            let event_id = inner.allocate_event_id();
                            inner.claimed_scheduling.insert(event_id);
                            inner.history.push(HistoryEvent::EntityOperationScheduled {
                                event_id,
                                entity: entity.clone(),
                                op: op.clone(),
                                input: input.clone(),
                                signal: *signal,
                            });
                            inner.record_decision(Decision::CallEntity {
                                scheduling_event_id: event_id,
                                entity: entity.clone(),
                                op: op.clone(),
                                input: input.clone(),
                                signal: *signal,
                            });
                            claimed.set(Some(event_id));
                        }
                    }
                }
                if *signal {
                    // Fire-and-forget: resolved as soon as the schedule is recorded.
                    return Poll::Ready(DurableOutput::Entity(Ok(String::new())));
                }
                let source = claimed.get().unwrap();
                if let Some((completion_id, output)) = inner.find_correlated_completion(source) {
                    if inner.can_consume_completion(completion_id) {
                        inner.consumed_completions.insert(completion_id);
                        return Poll::Ready(output);
                    }
                }
                Poll::Pending
            }
            Kind::Never { .. } => Poll::Pending,
        }
    }
}

impl DurableFuture {
    fn claimed_id(&self) -> Option<u64> {
        match &self.0 {
            Kind::Activity { claimed, .. }
            | Kind::Timer { claimed, .. }
            | Kind::External { claimed, .. }
            | Kind::SubOrch { claimed, .. }
            | Kind::Entity { claimed, .. } => claimed.get(),
            Kind::Never { .. } => None,
        }
    }

    /// Completion event id for ordering join outputs; `u64::MAX` when the
    /// completion is not (or cannot be) recorded.
    fn completion_order_key(&self, inner: &CtxInner) -> u64 {
        match &self.0 {
            Kind::External { name, .. } => inner
                .history
                .iter()
                .find_map(|e| match e {
                    HistoryEvent::ExternalRaised { event_id, name: n, .. } if n == name => Some(*event_id),
                    _ => None,
                })
                .unwrap_or(u64::MAX),
            Kind::Entity { signal: true, claimed, .. } => claimed.get().unwrap_or(u64::MAX),
            _ => match self.claimed_id() {
                Some(source) => inner
                    .find_correlated_completion(source)
                    .map(|(id, _)| id)
                    .unwrap_or(u64::MAX),
                None => u64::MAX,
            },
        }
    }

    /// Await an activity result.
    pub async fn into_activity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Activity(r) => r,
            other => panic!("expected activity output, got {other:?}"),
        }
    }

    /// Await a timer firing.
    pub async fn into_timer(self) {
        match self.await {
            DurableOutput::Timer => {}
            other => panic!("expected timer output, got {other:?}"),
        }
    }

    /// Await an external event payload.
    pub async fn into_event(self) -> String {
        match self.await {
            DurableOutput::External(d) => d,
            other => panic!("expected external event output, got {other:?}"),
        }
    }

    /// Await a sub-orchestration result.
    pub async fn into_sub_orchestration(self) -> Result<String, String> {
        match self.await {
            DurableOutput::SubOrchestration(r) => r,
            other => panic!("expected sub-orchestration output, got {other:?}"),
        }
    }

    /// Await an entity call result.
    pub async fn into_entity(self) -> Result<String, String> {
        match self.await {
            DurableOutput::Entity(r) => r,
            other => panic!("expected entity output, got {other:?}"),
        }
    }
}

/// Fan-in over durable futures: resolves when every child has resolved, with
/// outputs ordered by recorded completion order (not schedule order).
pub struct JoinFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl Future for JoinFuture {
    type Output = Vec<DurableOutput>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut results: Vec<Option<DurableOutput>> = (0..this.children.len()).map(|_| None).collect();
        // Fixed-point: consuming one completion can unblock the gate for the
        // next, so keep sweeping until a full pass makes no progress.
        loop {
            let mut progressed = false;
            for (i, child) in this.children.iter_mut().enumerate() {
                if results[i].is_some() {
                    continue;
                }
                if let Poll::Ready(out) = Pin::new(child).poll(cx) {
                    results[i] = Some(out);
                    progressed = true;
                }
            }
            if results.iter().all(|r| r.is_some()) {
                let inner = this.ctx.inner.lock().unwrap();
                let mut keyed: Vec<(u64, usize, DurableOutput)> = results
                    .into_iter()
                    .enumerate()
                    .map(|(i, out)| (this.children[i].completion_order_key(&inner), i, out.unwrap()))
                    .collect();
                keyed.sort_by_key(|(key, idx, _)| (*key, *idx));
                return Poll::Ready(keyed.into_iter().map(|(_, _, out)| out).collect());
            }
            if !progressed {
                return Poll::Pending;
            }
        }
    }
}

/// First-wins race over durable futures. Losers' completions are marked
/// cancelled so they never block later FIFO consumption.
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        // Poll every child first so all of them claim their scheduling events
        // even when the winner is already recorded; otherwise later schedules
        // would misalign on replay.
        let mut ready: Vec<Option<DurableOutput>> = (0..this.children.len()).map(|_| None).collect();
        for (i, child) in this.children.iter_mut().enumerate() {
            if let Poll::Ready(out) = Pin::new(child).poll(cx) {
                ready[i] = Some(out);
            }
        }
        let Some(winner) = ready.iter().position(|r| r.is_some()) else {
            return Poll::Pending;
        };
        {
            let mut inner = this.ctx.inner.lock().unwrap();
            for (i, child) in this.children.iter().enumerate() {
                if i != winner {
                    if let Some(source) = child.claimed_id() {
                        inner.cancelled_sources.insert(source);
                    }
                }
            }
        }
        Poll::Ready((winner, ready[winner].take().unwrap()))
    }
}

impl OrchestrationContext {
    /// Schedule an activity invocation.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture(Kind::Activity {
            name: name.into(),
            input: input.into(),
            claimed: Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Schedule a durable timer relative to the logical clock.
    pub fn schedule_timer(&self, delay_ms: u64) -> DurableFuture {
        DurableFuture(Kind::Timer {
            delay_ms,
            claimed: Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Wait for a named external event. Raises are buffered: an event raised
    /// before this wait executes is still observed.
    pub fn wait_event(&self, name: impl Into<String>) -> DurableFuture {
        DurableFuture(Kind::External {
            name: name.into(),
            claimed: Cell::new(None),
            cached: RefCell::new(None),
            ctx: self.clone(),
        })
    }

    /// Schedule a child orchestration and wait for its terminal result.
    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture(Kind::SubOrch {
            name: name.into(),
            input: input.into(),
            instance: RefCell::new(String::new()),
            claimed: Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Invoke an entity operation and wait for its result.
    pub fn call_entity(
        &self,
        entity: EntityId,
        op: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture(Kind::Entity {
            entity,
            op: op.into(),
            input: input.into(),
            signal: false,
            claimed: Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Fire-and-forget an entity operation.
    pub fn signal_entity(
        &self,
        entity: EntityId,
        op: impl Into<String>,
        input: impl Into<String>,
    ) -> DurableFuture {
        DurableFuture(Kind::Entity {
            entity,
            op: op.into(),
            input: input.into(),
            signal: true,
            claimed: Cell::new(None),
            ctx: self.clone(),
        })
    }

    /// Fan-in: wait for all of the given futures.
    pub fn join(&self, children: Vec<DurableFuture>) -> JoinFuture {
        JoinFuture {
            ctx: self.clone(),
            children,
        }
    }

    /// Race: resolve with the first completed future's index and output.
    pub fn select(&self, children: Vec<DurableFuture>) -> SelectFuture {
        SelectFuture {
            ctx: self.clone(),
            children,
        }
    }

    /// Schedule an activity with a JSON-typed input and output.
    pub async fn call_activity_typed<In, Out>(&self, name: impl Into<String>, input: &In) -> Result<Out, String>
    where
        In: serde::Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let payload = crate::codec::encode(input)?;
        let out = self.schedule_activity(name, payload).into_activity().await?;
        crate::codec::decode(&out)
    }
}
