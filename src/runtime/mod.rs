//! In-process runtime: dispatcher loops that drive orchestrations,
//! activities, timers and entities against a [`Backend`].
//!
//! Each dispatcher is a polling loop over a durable queue. Orchestration
//! turns commit atomically through `ack_orchestration_item`; a history
//! conflict (another worker won the race for the same instance) aborts the
//! attempt and the batch is re-fetched against fresh history, which re-runs
//! the whole replay. That optimistic check is what keeps execution per
//! instance single-writer even with competing dispatchers.

use semver::Version;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backend::{Backend, ExecutionMetadata, OrchestrationItem, WorkItem};
use crate::{wall_clock_ms, HistoryEvent, OrchestrationContext, INITIAL_EXECUTION_ID};

pub mod entities;
pub mod registry;
pub mod status;
mod timers;
mod turn;

pub use entities::{EntityContext, EntityHandler, FnEntity};
pub use registry::{
    ActivityRegistry, ActivityRegistryBuilder, EntityRegistry, EntityRegistryBuilder, OrchestrationRegistry,
    OrchestrationRegistryBuilder, Registry,
};
pub use status::{status_from_history, OrchestrationStatus, WaitError};

use status::custom_status_from_history;
use turn::{OrchestrationTurn, TurnResult};

/// Configuration for the runtime's dispatcher loops.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Sleep between polls when a queue is empty.
    pub dispatcher_idle_sleep_ms: u64,
    /// Redelivery delay for batches deferred by a suspended instance.
    pub suspend_redelivery_ms: u64,
    /// Attempts for transient commit failures before abandoning the batch.
    pub max_commit_attempts: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            suspend_redelivery_ms: 100,
            max_commit_attempts: 5,
        }
    }
}

/// Context handed to activity handlers.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub instance: String,
    pub execution_id: u64,
    /// Scheduling event id of this invocation.
    pub activity_id: u64,
}

/// Trait implemented by orchestration handlers.
#[async_trait::async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`OrchestrationHandler`].
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait::async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Trait implemented by activity handlers. Activities may be arbitrarily
/// non-deterministic; the executor reports exactly one attempt's outcome.
#[async_trait::async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`ActivityHandler`].
pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait::async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// Start parameters extracted from a batch.
struct StartInfo {
    orchestration: String,
    version: Option<String>,
    input: String,
    parent_instance: Option<String>,
    parent_id: Option<u64>,
}

/// Structured view over one locked message batch.
struct TurnBatch {
    start: Option<StartInfo>,
    continue_as_new: Option<StartInfo>,
    /// Completion and control messages in arrival order.
    completions: Vec<WorkItem>,
    has_resume: bool,
    has_terminate: bool,
    has_completion_messages: bool,
}

impl TurnBatch {
    fn from_messages(messages: Vec<WorkItem>) -> Self {
        let mut batch = TurnBatch {
            start: None,
            continue_as_new: None,
            completions: Vec::new(),
            has_resume: false,
            has_terminate: false,
            has_completion_messages: false,
        };
        for msg in messages {
            match msg {
                WorkItem::StartOrchestration {
                    orchestration,
                    version,
                    input,
                    parent_instance,
                    parent_id,
                    ..
                } => {
                    batch.start.get_or_insert(StartInfo {
                        orchestration,
                        version,
                        input,
                        parent_instance,
                        parent_id,
                    });
                }
                WorkItem::ContinueAsNew {
                    orchestration,
                    version,
                    input,
                    ..
                } => {
                    batch.continue_as_new.get_or_insert(StartInfo {
                        orchestration,
                        version,
                        input,
                        parent_instance: None,
                        parent_id: None,
                    });
                }
                WorkItem::ResumeInstance { .. } => {
                    batch.has_resume = true;
                    batch.completions.push(msg);
                }
                WorkItem::TerminateInstance { .. } => {
                    batch.has_terminate = true;
                    batch.completions.push(msg);
                }
                WorkItem::SuspendInstance { .. } => batch.completions.push(msg),
                other => {
                    batch.has_completion_messages = true;
                    batch.completions.push(other);
                }
            }
        }
        batch
    }
}

/// In-process runtime hosting the dispatcher loops over one backend.
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    backend: Arc<dyn Backend>,
    orchestrations: OrchestrationRegistry,
    options: RuntimeOptions,
}

impl Runtime {
    /// Start a runtime with default options.
    pub async fn start_with_backend(
        backend: Arc<dyn Backend>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        entities: EntityRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(backend, activities, orchestrations, entities, RuntimeOptions::default()).await
    }

    pub async fn start_with_options(
        backend: Arc<dyn Backend>,
        activities: ActivityRegistry,
        orchestrations: OrchestrationRegistry,
        entities: EntityRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        // Install a default subscriber if none is set; fine to call repeatedly.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
            .try_init();

        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            backend,
            orchestrations,
            options,
        });

        let orch = runtime.clone().start_orchestration_dispatcher();
        let work = runtime.clone().start_worker_dispatcher(activities);
        let timer = runtime.clone().start_timer_dispatcher();
        let entity = runtime.clone().start_entity_dispatcher(entities);
        runtime.joins.lock().await.extend([orch, work, timer, entity]);

        runtime
    }

    pub fn backend(&self) -> Arc<dyn Backend> {
        self.backend.clone()
    }

    /// Abort the dispatcher tasks.
    pub async fn shutdown(self: Arc<Self>) {
        let mut joins = self.joins.lock().await;
        for j in joins.drain(..) {
            j.abort();
        }
    }

    // ===== Orchestration dispatcher =====

    fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some(item) = self.backend.fetch_orchestration_item().await {
                    self.process_orchestration_item(item).await;
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
                }
            }
        })
    }

    async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem) {
        let instance = item.instance.clone();
        let lock_token = item.lock_token.clone();
        let current_status = status_from_history(&item.history);
        let batch = TurnBatch::from_messages(item.messages.clone());

        // Continued-as-new executions are reopened by their ContinueAsNew
        // message; any other terminal history discards late messages;
        // in-flight results for finished instances are dropped on write-back.
        if current_status == OrchestrationStatus::ContinuedAsNew {
            if let Some(start) = batch.continue_as_new {
                self.begin_continued_execution(&item, start, batch.completions).await;
            } else {
                warn!(instance = %instance, "continued-as-new history without start message; discarding batch");
                self.ack_discard(&item).await;
            }
            return;
        }
        if current_status.is_terminal() {
            debug!(instance = %instance, status = current_status.as_str(), "instance is terminal; discarding late messages");
            self.ack_discard(&item).await;
            return;
        }

        // Suspended instances buffer completions until resume or terminate.
        if current_status == OrchestrationStatus::Suspended
            && !batch.has_resume
            && !batch.has_terminate
            && batch.has_completion_messages
        {
            debug!(instance = %instance, "instance suspended; deferring completion batch");
            let _ = self
                .backend
                .abandon_orchestration_item(&lock_token, Some(self.options.suspend_redelivery_ms))
                .await;
            return;
        }

        let mut turn = OrchestrationTurn::new(instance.clone(), item.execution_id, item.history.clone());

        // Resolve the orchestration for this execution.
        let resolved = if item.history.is_empty() {
            let Some(start) = batch.start else {
                // A raise can race ahead of the start message; give the start
                // a chance to arrive instead of dropping the event.
                debug!(instance = %instance, "messages for an unstarted instance; deferring batch");
                let _ = self
                    .backend
                    .abandon_orchestration_item(&lock_token, Some(self.options.suspend_redelivery_ms))
                    .await;
                return;
            };
            self.seed_started_event(&mut turn, &start)
        } else {
            self.resolve_from_history(&item.history)
        };

        let (handler, input, parent_link, orchestration_name) = match resolved {
            Ok(parts) => parts,
            Err(unregistered_error) => {
                // Proper history is still written for unknown names.
                turn.push_terminal(HistoryEvent::OrchestrationFailed {
                    event_id: 0,
                    error: unregistered_error.clone(),
                });
                let parent_link = parent_link_from_history_or_batch(&item.history, &item.messages);
                let parent_items = self.parent_notification(&instance, parent_link, Err(unregistered_error));
                self.commit_turn(&item, &mut turn, Vec::new(), Vec::new(), parent_items, Vec::new())
                    .await;
                return;
            }
        };

        turn.prep_completions(batch.completions);

        // Terminate short-circuits replay entirely.
        if let Some(reason) = turn.terminated_reason().map(str::to_string) {
            let child_terminations = self.terminate_children(&turn.final_history(), &reason);
            let parent_items =
                self.parent_notification(&instance, parent_link, Err(format!("terminated: {reason}")));
            let orchestrator_items = [child_terminations, parent_items].concat();
            self.commit_turn(&item, &mut turn, Vec::new(), Vec::new(), orchestrator_items, Vec::new())
                .await;
            return;
        }

        // A suspend applied this turn checkpoints the completion events but
        // does not replay further until resume.
        if turn.is_suspended() {
            self.commit_turn(&item, &mut turn, Vec::new(), Vec::new(), Vec::new(), Vec::new())
                .await;
            return;
        }

        let result = turn.execute(handler, input, wall_clock_ms());

        let mut orchestrator_items = Vec::new();
        match result {
            TurnResult::Continue => {}
            TurnResult::Completed(output) => {
                turn.push_terminal(HistoryEvent::OrchestrationCompleted {
                    event_id: 0,
                    output: output.clone(),
                });
                orchestrator_items.extend(self.parent_notification(&instance, parent_link.clone(), Ok(output)));
            }
            TurnResult::Failed(error) => {
                turn.push_terminal(HistoryEvent::OrchestrationFailed {
                    event_id: 0,
                    error: error.clone(),
                });
                orchestrator_items.extend(self.parent_notification(&instance, parent_link.clone(), Err(error)));
            }
            TurnResult::ContinueAsNew(new_input) => {
                turn.push_terminal(HistoryEvent::OrchestrationContinuedAsNew {
                    event_id: 0,
                    input: new_input.clone(),
                });
                orchestrator_items.push(WorkItem::ContinueAsNew {
                    instance: instance.clone(),
                    orchestration: orchestration_name,
                    version: None,
                    input: new_input,
                });
            }
        }

        let (worker, timer, decision_orch, entity) = turn.work_items();
        orchestrator_items.extend(decision_orch);
        self.commit_turn(&item, &mut turn, worker, timer, orchestrator_items, entity).await;
    }

    /// Build the started event for a fresh execution and resolve its handler.
    #[allow(clippy::type_complexity)]
    fn seed_started_event(
        &self,
        turn: &mut OrchestrationTurn,
        start: &StartInfo,
    ) -> Result<
        (
            Arc<dyn OrchestrationHandler>,
            String,
            Option<(String, u64)>,
            String,
        ),
        String,
    > {
        let resolved = match &start.version {
            Some(v) => Version::parse(v)
                .ok()
                .and_then(|v| self.orchestrations.resolve_exact(&start.orchestration, &v).map(|h| (v, h))),
            None => self.orchestrations.resolve_latest(&start.orchestration),
        };
        let parent_link = start
            .parent_instance
            .clone()
            .zip(start.parent_id);

        match resolved {
            Some((version, handler)) => {
                turn.push_started(HistoryEvent::OrchestrationStarted {
                    event_id: 0,
                    name: start.orchestration.clone(),
                    version: version.to_string(),
                    input: start.input.clone(),
                    started_at_ms: wall_clock_ms(),
                    parent_instance: start.parent_instance.clone(),
                    parent_id: start.parent_id,
                });
                Ok((handler, start.input.clone(), parent_link, start.orchestration.clone()))
            }
            None => {
                turn.push_started(HistoryEvent::OrchestrationStarted {
                    event_id: 0,
                    name: start.orchestration.clone(),
                    version: "0.0.0".to_string(),
                    input: start.input.clone(),
                    started_at_ms: wall_clock_ms(),
                    parent_instance: start.parent_instance.clone(),
                    parent_id: start.parent_id,
                });
                Err(format!("unregistered:{}", start.orchestration))
            }
        }
    }

    /// Resolve handler, input and parent linkage for an in-flight execution.
    #[allow(clippy::type_complexity)]
    fn resolve_from_history(
        &self,
        history: &[HistoryEvent],
    ) -> Result<
        (
            Arc<dyn OrchestrationHandler>,
            String,
            Option<(String, u64)>,
            String,
        ),
        String,
    > {
        let Some((name, version, input, parent_link)) = history.iter().rev().find_map(|e| match e {
            HistoryEvent::OrchestrationStarted {
                name,
                version,
                input,
                parent_instance,
                parent_id,
                ..
            } => Some((
                name.clone(),
                version.clone(),
                input.clone(),
                parent_instance.clone().zip(*parent_id),
            )),
            _ => None,
        }) else {
            return Err("corrupt history: no started event".to_string());
        };

        // Replay stays pinned to the version that produced the history.
        let handler = Version::parse(&version)
            .ok()
            .and_then(|v| self.orchestrations.resolve_exact(&name, &v))
            .or_else(|| self.orchestrations.resolve_latest(&name).map(|(_, h)| h));
        match handler {
            Some(h) => Ok((h, input, parent_link, name)),
            None => Err(format!("unregistered:{name}")),
        }
    }

    /// Open execution N+1 after continue-as-new and run its first turn.
    async fn begin_continued_execution(
        self: &Arc<Self>,
        item: &OrchestrationItem,
        start: StartInfo,
        completions: Vec<WorkItem>,
    ) {
        let instance = item.instance.clone();
        let new_execution_id = item.execution_id + 1;

        let mut turn = OrchestrationTurn::new(instance.clone(), new_execution_id, Vec::new());
        let resolved = self.seed_started_event(&mut turn, &start);

        // The started event is persisted through create_new_execution, not
        // the turn commit, so pull it back out of the delta.
        let mut delta = turn.take_history_delta();
        let started = delta.remove(0);
        if let Err(e) = self
            .backend
            .create_new_execution(&instance, new_execution_id, started.clone())
            .await
        {
            warn!(instance = %instance, error = %e, "continue-as-new execution creation failed; abandoning batch");
            let _ = self.backend.abandon_orchestration_item(&item.lock_token, Some(50)).await;
            return;
        }

        let mut turn = OrchestrationTurn::new(instance.clone(), new_execution_id, vec![started]);
        for event in delta {
            // Unregistered-name failure recorded by seed_started_event.
            turn.push_terminal(event);
        }

        match resolved {
            Ok((handler, input, _parent, orchestration_name)) => {
                turn.prep_completions(completions);
                let result = turn.execute(handler, input, wall_clock_ms());
                let mut orchestrator_items = Vec::new();
                match result {
                    TurnResult::Continue => {}
                    TurnResult::Completed(output) => {
                        turn.push_terminal(HistoryEvent::OrchestrationCompleted {
                            event_id: 0,
                            output,
                        });
                    }
                    TurnResult::Failed(error) => {
                        turn.push_terminal(HistoryEvent::OrchestrationFailed { event_id: 0, error });
                    }
                    TurnResult::ContinueAsNew(new_input) => {
                        turn.push_terminal(HistoryEvent::OrchestrationContinuedAsNew {
                            event_id: 0,
                            input: new_input.clone(),
                        });
                        orchestrator_items.push(WorkItem::ContinueAsNew {
                            instance: instance.clone(),
                            orchestration: orchestration_name,
                            version: None,
                            input: new_input,
                        });
                    }
                }
                let (worker, timer, decision_orch, entity) = turn.work_items();
                orchestrator_items.extend(decision_orch);
                self.commit_continued_turn(item, new_execution_id, &mut turn, worker, timer, orchestrator_items, entity)
                    .await;
            }
            Err(_unregistered) => {
                self.commit_continued_turn(item, new_execution_id, &mut turn, Vec::new(), Vec::new(), Vec::new(), Vec::new())
                    .await;
            }
        }
    }

    /// Orchestrator items terminating scheduled-but-incomplete children.
    fn terminate_children(&self, history: &[HistoryEvent], reason: &str) -> Vec<WorkItem> {
        let completed: std::collections::HashSet<u64> = history
            .iter()
            .filter_map(|e| match e {
                HistoryEvent::SubOrchestrationCompleted { source_event_id, .. }
                | HistoryEvent::SubOrchestrationFailed { source_event_id, .. } => Some(*source_event_id),
                _ => None,
            })
            .collect();
        history
            .iter()
            .filter_map(|e| match e {
                HistoryEvent::SubOrchestrationScheduled {
                    event_id, instance, ..
                } if !completed.contains(event_id) => Some(WorkItem::TerminateInstance {
                    instance: instance.clone(),
                    reason: format!("parent terminated: {reason}"),
                }),
                _ => None,
            })
            .collect()
    }

    /// Completion message for the parent when a child reaches a terminal state.
    fn parent_notification(
        &self,
        _child: &str,
        parent_link: Option<(String, u64)>,
        result: Result<String, String>,
    ) -> Vec<WorkItem> {
        let Some((parent_instance, parent_id)) = parent_link else {
            return Vec::new();
        };
        // The parent's execution id is filled in at delivery via its current
        // execution; completions from an older child generation are filtered
        // by the turn's staleness check.
        let item = match result {
            Ok(result) => WorkItem::SubOrchCompleted {
                parent_instance,
                parent_execution_id: 0,
                parent_id,
                result,
            },
            Err(error) => WorkItem::SubOrchFailed {
                parent_instance,
                parent_execution_id: 0,
                parent_id,
                error,
            },
        };
        vec![item]
    }

    async fn ack_discard(&self, item: &OrchestrationItem) {
        let _ = self
            .backend
            .ack_orchestration_item(
                &item.lock_token,
                item.execution_id,
                item.history.len() as u64,
                Vec::new(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
                ExecutionMetadata::default(),
            )
            .await;
    }

    async fn commit_turn(
        self: &Arc<Self>,
        item: &OrchestrationItem,
        turn: &mut OrchestrationTurn,
        worker: Vec<WorkItem>,
        timer: Vec<WorkItem>,
        orchestrator: Vec<WorkItem>,
        entity: Vec<WorkItem>,
    ) {
        let expected_len = turn.baseline_len();
        let metadata = compute_metadata(&turn.final_history());
        let orchestrator = self.fill_parent_execution_ids(orchestrator).await;
        self.ack_with_retry(
            &item.lock_token,
            item.execution_id,
            expected_len,
            turn.take_history_delta(),
            worker,
            timer,
            orchestrator,
            entity,
            metadata,
        )
        .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_continued_turn(
        self: &Arc<Self>,
        item: &OrchestrationItem,
        execution_id: u64,
        turn: &mut OrchestrationTurn,
        worker: Vec<WorkItem>,
        timer: Vec<WorkItem>,
        orchestrator: Vec<WorkItem>,
        entity: Vec<WorkItem>,
    ) {
        let metadata = compute_metadata(&turn.final_history());
        let orchestrator = self.fill_parent_execution_ids(orchestrator).await;
        self.ack_with_retry(
            &item.lock_token,
            execution_id,
            turn.baseline_len(),
            turn.take_history_delta(),
            worker,
            timer,
            orchestrator,
            entity,
            metadata,
        )
        .await;
    }

    /// Sub-orchestration completions are addressed to the parent's current
    /// execution at send time.
    async fn fill_parent_execution_ids(&self, items: Vec<WorkItem>) -> Vec<WorkItem> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                WorkItem::SubOrchCompleted {
                    parent_instance,
                    parent_id,
                    result,
                    ..
                } => {
                    let parent_execution_id = self
                        .backend
                        .latest_execution_id(&parent_instance)
                        .await
                        .unwrap_or(INITIAL_EXECUTION_ID);
                    out.push(WorkItem::SubOrchCompleted {
                        parent_instance,
                        parent_execution_id,
                        parent_id,
                        result,
                    });
                }
                WorkItem::SubOrchFailed {
                    parent_instance,
                    parent_id,
                    error,
                    ..
                } => {
                    let parent_execution_id = self
                        .backend
                        .latest_execution_id(&parent_instance)
                        .await
                        .unwrap_or(INITIAL_EXECUTION_ID);
                    out.push(WorkItem::SubOrchFailed {
                        parent_instance,
                        parent_execution_id,
                        parent_id,
                        error,
                    });
                }
                other => out.push(other),
            }
        }
        out
    }

    #[allow(clippy::too_many_arguments)]
    async fn ack_with_retry(
        &self,
        lock_token: &str,
        execution_id: u64,
        expected_len: u64,
        history_delta: Vec<HistoryEvent>,
        worker: Vec<WorkItem>,
        timer: Vec<WorkItem>,
        orchestrator: Vec<WorkItem>,
        entity: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) {
        let mut attempts = 0u32;
        loop {
            let result = self
                .backend
                .ack_orchestration_item(
                    lock_token,
                    execution_id,
                    expected_len,
                    history_delta.clone(),
                    worker.clone(),
                    timer.clone(),
                    orchestrator.clone(),
                    entity.clone(),
                    metadata.clone(),
                )
                .await;
            match result {
                Ok(()) => return,
                Err(e) if e.is_conflict() => {
                    // Another execution won the append race; re-fetch against
                    // fresh history and replay from scratch.
                    warn!(error = %e, "history conflict on commit; abandoning for fresh replay");
                    let _ = self.backend.abandon_orchestration_item(lock_token, None).await;
                    return;
                }
                Err(e) if e.is_retryable() && attempts < self.options.max_commit_attempts => {
                    let backoff = 10u64.saturating_mul(1 << attempts);
                    warn!(attempts, backoff, error = %e, "turn commit failed; retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
                    attempts += 1;
                }
                Err(e) => {
                    error!(error = %e, "turn commit failed permanently; abandoning batch");
                    let _ = self.backend.abandon_orchestration_item(lock_token, Some(50)).await;
                    return;
                }
            }
        }
    }

    // ===== Worker dispatcher =====

    fn start_worker_dispatcher(self: Arc<Self>, activities: ActivityRegistry) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Some((item, token)) = self.backend.dequeue_worker_peek_lock().await {
                    match item {
                        WorkItem::ActivityExecute {
                            instance,
                            execution_id,
                            id,
                            name,
                            input,
                        } => {
                            let backend = self.backend.clone();
                            let activities = activities.clone();
                            tokio::spawn(async move {
                                let completion = match activities.resolve_latest(&name) {
                                    Some((_v, handler)) => {
                                        let ctx = ActivityContext {
                                            instance: instance.clone(),
                                            execution_id,
                                            activity_id: id,
                                        };
                                        match handler.invoke(ctx, input).await {
                                            Ok(result) => WorkItem::ActivityCompleted {
                                                instance: instance.clone(),
                                                execution_id,
                                                id,
                                                result,
                                            },
                                            Err(error) => WorkItem::ActivityFailed {
                                                instance: instance.clone(),
                                                execution_id,
                                                id,
                                                error,
                                            },
                                        }
                                    }
                                    None => WorkItem::ActivityFailed {
                                        instance: instance.clone(),
                                        execution_id,
                                        id,
                                        error: format!("unregistered:{name}"),
                                    },
                                };
                                // Ack only after the completion is durable;
                                // a crash in between re-runs the activity
                                // (at-least-once).
                                if backend.enqueue_orchestrator_work(completion, None).await.is_ok() {
                                    let _ = backend.ack_worker(&token).await;
                                } else {
                                    warn!(instance = %instance, id, "completion enqueue failed; activity will redeliver");
                                    let _ = backend.abandon_worker(&token).await;
                                }
                            });
                        }
                        other => {
                            error!(kind = other.kind(), "unexpected work item in worker dispatcher");
                            let _ = self.backend.ack_worker(&token).await;
                        }
                    }
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(self.options.dispatcher_idle_sleep_ms)).await;
                }
            }
        })
    }

    // ===== Timer dispatcher =====

    fn start_timer_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        if self.backend.supports_delayed_visibility() {
            // Backend-native delays: convert each schedule into a delayed
            // TimerFired enqueue.
            return tokio::spawn(async move {
                loop {
                    if let Some((item, token)) = self.backend.dequeue_timer_peek_lock().await {
                        match item {
                            WorkItem::TimerSchedule {
                                instance,
                                execution_id,
                                id,
                                fire_at_ms,
                            } => {
                                let delay_ms = fire_at_ms.saturating_sub(wall_clock_ms());
                                let fired = WorkItem::TimerFired {
                                    instance,
                                    execution_id,
                                    id,
                                    fire_at_ms,
                                };
                                if self
                                    .backend
                                    .enqueue_orchestrator_work(fired, Some(delay_ms))
                                    .await
                                    .is_ok()
                                {
                                    let _ = self.backend.ack_timer(&token).await;
                                }
                            }
                            other => {
                                error!(kind = other.kind(), "unexpected work item in timer dispatcher");
                                let _ = self.backend.ack_timer(&token).await;
                            }
                        }
                    } else {
                        tokio::time::sleep(std::time::Duration::from_millis(self.options.dispatcher_idle_sleep_ms))
                            .await;
                    }
                }
            });
        }

        // In-process fallback timer service.
        let idle_sleep_ms = self.options.dispatcher_idle_sleep_ms;
        tokio::spawn(async move {
            let (service, tx) = timers::TimerService::start(self.backend.clone(), idle_sleep_ms);
            let intake = self.clone();
            tokio::spawn(async move {
                loop {
                    if let Some((item, token)) = intake.backend.dequeue_timer_peek_lock().await {
                        if matches!(item, WorkItem::TimerSchedule { .. }) {
                            // The service acks after firing.
                            let _ = tx.send(timers::TimerWithToken {
                                item,
                                ack_token: token,
                            });
                        } else {
                            error!(kind = item.kind(), "unexpected work item in timer dispatcher");
                            let _ = intake.backend.ack_timer(&token).await;
                        }
                    } else {
                        tokio::time::sleep(std::time::Duration::from_millis(idle_sleep_ms)).await;
                    }
                }
            });
            let _ = service.await;
        })
    }

    // ===== Entity dispatcher =====

    fn start_entity_dispatcher(self: Arc<Self>, entities: EntityRegistry) -> JoinHandle<()> {
        let backend = self.backend.clone();
        let idle = self.options.dispatcher_idle_sleep_ms;
        tokio::spawn(async move {
            entities::entity_dispatch_loop(backend, entities, idle).await;
        })
    }
}

/// Instance metadata derived from the turn's final history; the backend
/// stores it without interpreting event contents.
fn compute_metadata(final_history: &[HistoryEvent]) -> ExecutionMetadata {
    let status = status_from_history(final_history);
    let output = match &status {
        OrchestrationStatus::Completed { output } => Some(output.clone()),
        OrchestrationStatus::Failed { error } => Some(error.clone()),
        OrchestrationStatus::Terminated { reason } => Some(reason.clone()),
        _ => None,
    };
    ExecutionMetadata {
        status: Some(status.as_str().to_string()),
        output,
        custom_status: custom_status_from_history(final_history),
    }
}

/// Parent linkage for failure notifications when the start message itself was
/// unresolvable.
fn parent_link_from_history_or_batch(history: &[HistoryEvent], messages: &[WorkItem]) -> Option<(String, u64)> {
    history
        .iter()
        .rev()
        .find_map(|e| match e {
            HistoryEvent::OrchestrationStarted {
                parent_instance,
                parent_id,
                ..
            } => parent_instance.clone().zip(*parent_id),
            _ => None,
        })
        .or_else(|| {
            messages.iter().find_map(|m| match m {
                WorkItem::StartOrchestration {
                    parent_instance,
                    parent_id,
                    ..
                } => parent_instance.clone().zip(*parent_id),
                _ => None,
            })
        })
}
