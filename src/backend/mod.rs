//! Durable storage abstraction: histories, work item queues, entity state.
//!
//! A backend instance is bound to exactly one task hub. Runtimes and clients
//! are constructed over a backend and therefore inherit that scope; no
//! operation can cross task hubs.
//!
//! History is the sole source of truth. Appends are conditional on the
//! expected history length (optimistic concurrency) and a terminal event
//! freezes the execution: nothing may be appended after it. Queues use
//! peek-lock delivery: items stay invisible while locked and return to the
//! queue on abandon, which is what makes processing at-least-once.

use serde::{Deserialize, Serialize};

use crate::{EntityId, HistoryEvent};

mod error;
pub mod memory;
pub mod sqlite;

pub use error::{BackendError, ErrorKind};

/// Caller linkage for an entity call; absent for fire-and-forget signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCaller {
    pub instance: String,
    pub execution_id: u64,
    pub id: u64,
}

/// Message carried on the durable queues. Consumed exactly once per lock by
/// the matching dispatcher; `id` fields correlate completions back to the
/// scheduling event they answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        version: Option<String>,
        input: String,
        parent_instance: Option<String>,
        parent_id: Option<u64>,
    },
    ContinueAsNew {
        instance: String,
        orchestration: String,
        version: Option<String>,
        input: String,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    TimerSchedule {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        error: String,
    },
    EntityOperation {
        entity: EntityId,
        op: String,
        input: String,
        caller: Option<EntityCaller>,
    },
    EntityOpCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    EntityOpFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        error: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
    SuspendInstance {
        instance: String,
        reason: String,
    },
    ResumeInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    /// Instance an orchestrator-queue item is addressed to.
    pub fn target_instance(&self) -> Option<&str> {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerSchedule { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::EntityOpCompleted { instance, .. }
            | WorkItem::EntityOpFailed { instance, .. }
            | WorkItem::TerminateInstance { instance, .. }
            | WorkItem::SuspendInstance { instance, .. }
            | WorkItem::ResumeInstance { instance, .. } => Some(instance),
            WorkItem::SubOrchCompleted { parent_instance, .. } | WorkItem::SubOrchFailed { parent_instance, .. } => {
                Some(parent_instance)
            }
            WorkItem::EntityOperation { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerSchedule { .. } => "TimerSchedule",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::ExternalRaised { .. } => "ExternalRaised",
            WorkItem::SubOrchCompleted { .. } => "SubOrchCompleted",
            WorkItem::SubOrchFailed { .. } => "SubOrchFailed",
            WorkItem::EntityOperation { .. } => "EntityOperation",
            WorkItem::EntityOpCompleted { .. } => "EntityOpCompleted",
            WorkItem::EntityOpFailed { .. } => "EntityOpFailed",
            WorkItem::TerminateInstance { .. } => "TerminateInstance",
            WorkItem::SuspendInstance { .. } => "SuspendInstance",
            WorkItem::ResumeInstance { .. } => "ResumeInstance",
        }
    }
}

/// One locked batch of orchestrator work: the instance's current history plus
/// every message that was visible at fetch time, held under a single token.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub execution_id: u64,
    pub history: Vec<HistoryEvent>,
    pub messages: Vec<WorkItem>,
    pub lock_token: String,
}

/// Instance-level summary computed by the runtime at commit time so the
/// backend never needs to interpret event contents.
#[derive(Debug, Clone, Default)]
pub struct ExecutionMetadata {
    pub status: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
}

/// Management view of an instance.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub instance: String,
    pub orchestration_name: String,
    pub orchestration_version: String,
    pub current_execution_id: u64,
    pub status: String,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    /// Wall-clock time the instance reached a terminal status; drives
    /// retention sweeps.
    pub completed_at_ms: Option<u64>,
}

/// Storage backend bound to a single task hub.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Task hub this backend is scoped to.
    fn task_hub(&self) -> &str;

    /// Whether the orchestrator queue honors `delay_ms` on enqueue. Backends
    /// without it rely on the runtime's in-process timer service.
    fn supports_delayed_visibility(&self) -> bool {
        false
    }

    // ===== Instances and history =====

    /// Register a new, empty instance. Fails if the id is already taken.
    async fn create_instance(&self, instance: &str) -> Result<(), BackendError>;

    /// History of the latest execution, ordered by event id. Empty when the
    /// instance is unknown or not yet started.
    async fn read(&self, instance: &str) -> Vec<HistoryEvent>;

    /// History of a specific execution.
    async fn read_execution(&self, instance: &str, execution_id: u64) -> Vec<HistoryEvent>;

    async fn latest_execution_id(&self, instance: &str) -> Option<u64>;

    /// Conditionally append events. `expected_len` must equal the stored
    /// history length or the call fails with a conflict; appending past a
    /// terminal event fails permanently. Returns the new history length.
    async fn append(
        &self,
        instance: &str,
        execution_id: u64,
        expected_len: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<u64, BackendError>;

    /// Open execution `execution_id` for an instance (continue-as-new),
    /// seeding it with the given started event.
    async fn create_new_execution(
        &self,
        instance: &str,
        execution_id: u64,
        started: HistoryEvent,
    ) -> Result<(), BackendError>;

    // ===== Orchestrator queue =====

    async fn enqueue_orchestrator_work(&self, item: WorkItem, delay_ms: Option<u64>) -> Result<(), BackendError>;

    /// Lock the next instance with visible messages and return its batch.
    /// The instance stays unavailable to other fetchers until ack/abandon.
    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem>;

    /// Atomically commit a turn: conditional history append, follow-on
    /// enqueues, metadata update and message consumption, all or nothing.
    #[allow(clippy::too_many_arguments)]
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        execution_id: u64,
        expected_len: u64,
        history_delta: Vec<HistoryEvent>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        entity_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), BackendError>;

    /// Return a locked batch to the queue, optionally delayed.
    async fn abandon_orchestration_item(&self, lock_token: &str, delay_ms: Option<u64>) -> Result<(), BackendError>;

    // ===== Worker (activity) queue =====

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), BackendError>;
    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)>;
    async fn ack_worker(&self, token: &str) -> Result<(), BackendError>;
    async fn abandon_worker(&self, token: &str) -> Result<(), BackendError>;

    // ===== Timer queue =====

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), BackendError>;
    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)>;
    async fn ack_timer(&self, token: &str) -> Result<(), BackendError>;

    // ===== Entity queue and state =====

    async fn enqueue_entity_work(&self, item: WorkItem) -> Result<(), BackendError>;

    /// Next entity operation whose entity key has no other operation in
    /// flight. Per-key serialization is enforced here; distinct keys are
    /// handed out freely.
    async fn dequeue_entity_peek_lock(&self) -> Option<(WorkItem, String)>;

    /// Commit an entity operation: apply the state update (`None` leaves the
    /// state untouched, `Some(None)` deletes it), enqueue completions and
    /// release the key, atomically.
    async fn ack_entity(
        &self,
        token: &str,
        state_update: Option<Option<String>>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), BackendError>;

    async fn abandon_entity(&self, token: &str) -> Result<(), BackendError>;

    async fn read_entity_state(&self, entity: &EntityId) -> Option<String>;

    // ===== Management =====

    async fn list_instances(&self) -> Vec<String>;

    async fn get_instance_info(&self, instance: &str) -> Option<InstanceInfo>;

    /// Delete an instance with all executions and history. Returns `false`
    /// when the instance was not found (purge is idempotent).
    async fn remove_instance(&self, instance: &str) -> Result<bool, BackendError>;
}
