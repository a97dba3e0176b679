//! In-memory backend for tests and single-process use.
//!
//! All state lives behind one mutex, which makes the multi-part commits
//! (`ack_orchestration_item`, `ack_entity`) trivially atomic.

use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

use super::{Backend, BackendError, ExecutionMetadata, InstanceInfo, OrchestrationItem, WorkItem};
use crate::{wall_clock_ms, EntityId, HistoryEvent, INITIAL_EXECUTION_ID};

struct QueuedItem {
    item: WorkItem,
    visible_at_ms: u64,
}

struct InstanceRecord {
    executions: Vec<Vec<HistoryEvent>>,
    info: InstanceInfo,
}

struct LockedBatch {
    instance: String,
    items: Vec<WorkItem>,
}

#[derive(Default)]
struct MemState {
    instances: HashMap<String, InstanceRecord>,
    orch_queue: Vec<QueuedItem>,
    locked_batches: HashMap<String, LockedBatch>,
    locked_instances: HashSet<String>,
    worker_queue: Vec<WorkItem>,
    locked_worker: HashMap<String, WorkItem>,
    timer_queue: Vec<WorkItem>,
    locked_timer: HashMap<String, WorkItem>,
    entity_queue: Vec<QueuedItem>,
    locked_entity: HashMap<String, (EntityId, WorkItem)>,
    busy_entities: HashSet<EntityId>,
    entity_state: HashMap<EntityId, String>,
    token_seq: u64,
}

impl MemState {
    fn next_token(&mut self, prefix: &str) -> String {
        self.token_seq += 1;
        format!("{prefix}-{}", self.token_seq)
    }

    fn ensure_instance(&mut self, instance: &str, now: u64) -> &mut InstanceRecord {
        self.instances
            .entry(instance.to_string())
            .or_insert_with(|| InstanceRecord {
                executions: Vec::new(),
                info: InstanceInfo {
                    instance: instance.to_string(),
                    orchestration_name: String::new(),
                    orchestration_version: String::new(),
                    current_execution_id: INITIAL_EXECUTION_ID,
                    status: "Pending".to_string(),
                    output: None,
                    custom_status: None,
                    created_at_ms: now,
                    updated_at_ms: now,
                    completed_at_ms: None,
                },
            })
    }

    fn append_events(
        &mut self,
        instance: &str,
        execution_id: u64,
        expected_len: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<u64, BackendError> {
        if events.is_empty() {
            let record = self
                .instances
                .get(instance)
                .ok_or_else(|| BackendError::permanent("append", format!("instance not found: {instance}")))?;
            let idx = execution_id.saturating_sub(1) as usize;
            return Ok(record.executions.get(idx).map(|h| h.len() as u64).unwrap_or(0));
        }

        let now = wall_clock_ms();
        let record = self.ensure_instance(instance, now);
        while record.executions.len() < execution_id as usize {
            record.executions.push(Vec::new());
        }
        let history = &mut record.executions[execution_id.saturating_sub(1) as usize];

        if history.len() as u64 != expected_len {
            return Err(BackendError::conflict(
                "append",
                format!(
                    "expected history length {expected_len}, found {} for {instance}#{execution_id}",
                    history.len()
                ),
            ));
        }
        if history.iter().any(|e| e.is_terminal()) {
            return Err(BackendError::permanent(
                "append",
                format!("execution {instance}#{execution_id} is terminal; history is immutable"),
            ));
        }
        history.extend(events);
        Ok(history.len() as u64)
    }

    fn apply_metadata(&mut self, instance: &str, execution_id: u64, metadata: &ExecutionMetadata) {
        let now = wall_clock_ms();
        if let Some(record) = self.instances.get_mut(instance) {
            let info = &mut record.info;
            info.updated_at_ms = now;
            info.current_execution_id = info.current_execution_id.max(execution_id);
            if let Some(status) = &metadata.status {
                info.status = status.clone();
                if matches!(status.as_str(), "Completed" | "Failed" | "Terminated") {
                    info.completed_at_ms.get_or_insert(now);
                } else {
                    info.completed_at_ms = None;
                }
            }
            if let Some(output) = &metadata.output {
                info.output = Some(output.clone());
            }
            if let Some(custom) = &metadata.custom_status {
                info.custom_status = Some(custom.clone());
            }
            // Pick up name/version on the first committed turn.
            if info.orchestration_name.is_empty() {
                if let Some(HistoryEvent::OrchestrationStarted { name, version, .. }) = record
                    .executions
                    .last()
                    .and_then(|h| h.first())
                {
                    info.orchestration_name = name.clone();
                    info.orchestration_version = version.clone();
                }
            }
        }
    }

    fn enqueue_all(&mut self, worker: Vec<WorkItem>, timer: Vec<WorkItem>, orch: Vec<WorkItem>, entity: Vec<WorkItem>) {
        let now = wall_clock_ms();
        self.worker_queue.extend(worker);
        self.timer_queue.extend(timer);
        for item in orch {
            self.orch_queue.push(QueuedItem {
                item,
                visible_at_ms: now,
            });
        }
        for item in entity {
            self.entity_queue.push(QueuedItem {
                item,
                visible_at_ms: now,
            });
        }
    }
}

/// Backend keeping everything in process memory.
pub struct InMemoryBackend {
    task_hub: String,
    state: Mutex<MemState>,
}

impl InMemoryBackend {
    pub fn new(task_hub: impl Into<String>) -> Self {
        Self {
            task_hub: task_hub.into(),
            state: Mutex::new(MemState::default()),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new("default")
    }
}

#[async_trait::async_trait]
impl Backend for InMemoryBackend {
    fn task_hub(&self) -> &str {
        &self.task_hub
    }

    async fn create_instance(&self, instance: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if state.instances.contains_key(instance) {
            return Err(BackendError::permanent(
                "create_instance",
                format!("instance already exists: {instance}"),
            ));
        }
        let now = wall_clock_ms();
        state.ensure_instance(instance, now);
        Ok(())
    }

    async fn read(&self, instance: &str) -> Vec<HistoryEvent> {
        let state = self.state.lock().await;
        state
            .instances
            .get(instance)
            .and_then(|r| r.executions.last().cloned())
            .unwrap_or_default()
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Vec<HistoryEvent> {
        let state = self.state.lock().await;
        state
            .instances
            .get(instance)
            .and_then(|r| r.executions.get(execution_id.saturating_sub(1) as usize).cloned())
            .unwrap_or_default()
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let state = self.state.lock().await;
        state.instances.get(instance).map(|r| {
            if r.executions.is_empty() {
                INITIAL_EXECUTION_ID
            } else {
                r.executions.len() as u64
            }
        })
    }

    async fn append(
        &self,
        instance: &str,
        execution_id: u64,
        expected_len: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<u64, BackendError> {
        let mut state = self.state.lock().await;
        state.append_events(instance, execution_id, expected_len, events)
    }

    async fn create_new_execution(
        &self,
        instance: &str,
        execution_id: u64,
        started: HistoryEvent,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let now = wall_clock_ms();
        let record = state.ensure_instance(instance, now);
        if record.executions.len() as u64 + 1 != execution_id {
            return Err(BackendError::permanent(
                "create_new_execution",
                format!(
                    "expected execution {} for {instance}, have {}",
                    record.executions.len() + 1,
                    execution_id
                ),
            ));
        }
        record.executions.push(vec![started]);
        record.info.current_execution_id = execution_id;
        record.info.status = "Running".to_string();
        record.info.completed_at_ms = None;
        Ok(())
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem, delay_ms: Option<u64>) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let visible_at_ms = wall_clock_ms() + delay_ms.unwrap_or(0);
        state.orch_queue.push(QueuedItem { item, visible_at_ms });
        Ok(())
    }

    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem> {
        let mut state = self.state.lock().await;
        let now = wall_clock_ms();

        let target = state.orch_queue.iter().find_map(|qi| {
            if qi.visible_at_ms > now {
                return None;
            }
            let inst = qi.item.target_instance()?;
            if state.locked_instances.contains(inst) {
                return None;
            }
            Some(inst.to_string())
        })?;

        let mut messages = Vec::new();
        let mut remaining = Vec::new();
        for qi in state.orch_queue.drain(..) {
            if qi.visible_at_ms <= now && qi.item.target_instance() == Some(target.as_str()) {
                messages.push(qi.item);
            } else {
                remaining.push(qi);
            }
        }
        state.orch_queue = remaining;

        let token = state.next_token("orch");
        state.locked_instances.insert(target.clone());
        state.locked_batches.insert(
            token.clone(),
            LockedBatch {
                instance: target.clone(),
                items: messages.clone(),
            },
        );

        let (history, execution_id) = match state.instances.get(&target) {
            Some(r) => (
                r.executions.last().cloned().unwrap_or_default(),
                if r.executions.is_empty() {
                    INITIAL_EXECUTION_ID
                } else {
                    r.executions.len() as u64
                },
            ),
            None => (Vec::new(), INITIAL_EXECUTION_ID),
        };

        Some(OrchestrationItem {
            instance: target,
            execution_id,
            history,
            messages,
            lock_token: token,
        })
    }

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
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let instance = match state.locked_batches.get(lock_token) {
            Some(b) => b.instance.clone(),
            None => {
                return Err(BackendError::permanent(
                    "ack_orchestration_item",
                    format!("unknown lock token: {lock_token}"),
                ))
            }
        };

        if !history_delta.is_empty() {
            state.append_events(&instance, execution_id, expected_len, history_delta)?;
        }
        state.enqueue_all(worker_items, timer_items, orchestrator_items, entity_items);
        state.apply_metadata(&instance, execution_id, &metadata);
        state.locked_batches.remove(lock_token);
        state.locked_instances.remove(&instance);
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay_ms: Option<u64>) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let Some(batch) = state.locked_batches.remove(lock_token) else {
            return Ok(());
        };
        state.locked_instances.remove(&batch.instance);
        let visible_at_ms = wall_clock_ms() + delay_ms.unwrap_or(0);
        // Reinsert at the front so redelivery keeps arrival order.
        for item in batch.items.into_iter().rev() {
            state.orch_queue.insert(0, QueuedItem { item, visible_at_ms });
        }
        Ok(())
    }

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), BackendError> {
        self.state.lock().await.worker_queue.push(item);
        Ok(())
    }

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut state = self.state.lock().await;
        if state.worker_queue.is_empty() {
            return None;
        }
        let item = state.worker_queue.remove(0);
        let token = state.next_token("work");
        state.locked_worker.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack_worker(&self, token: &str) -> Result<(), BackendError> {
        self.state.lock().await.locked_worker.remove(token);
        Ok(())
    }

    async fn abandon_worker(&self, token: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if let Some(item) = state.locked_worker.remove(token) {
            state.worker_queue.insert(0, item);
        }
        Ok(())
    }

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), BackendError> {
        self.state.lock().await.timer_queue.push(item);
        Ok(())
    }

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut state = self.state.lock().await;
        if state.timer_queue.is_empty() {
            return None;
        }
        let item = state.timer_queue.remove(0);
        let token = state.next_token("timer");
        state.locked_timer.insert(token.clone(), item.clone());
        Some((item, token))
    }

    async fn ack_timer(&self, token: &str) -> Result<(), BackendError> {
        self.state.lock().await.locked_timer.remove(token);
        Ok(())
    }

    async fn enqueue_entity_work(&self, item: WorkItem) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let visible_at_ms = wall_clock_ms();
        state.entity_queue.push(QueuedItem { item, visible_at_ms });
        Ok(())
    }

    async fn dequeue_entity_peek_lock(&self) -> Option<(WorkItem, String)> {
        let mut state = self.state.lock().await;
        let now = wall_clock_ms();
        let pos = state.entity_queue.iter().position(|qi| {
            if qi.visible_at_ms > now {
                return false;
            }
            match &qi.item {
                WorkItem::EntityOperation { entity, .. } => !state.busy_entities.contains(entity),
                _ => false,
            }
        })?;
        let qi = state.entity_queue.remove(pos);
        let entity = match &qi.item {
            WorkItem::EntityOperation { entity, .. } => entity.clone(),
            _ => unreachable!("entity queue only carries EntityOperation"),
        };
        let token = state.next_token("entity");
        state.busy_entities.insert(entity.clone());
        state.locked_entity.insert(token.clone(), (entity, qi.item.clone()));
        Some((qi.item, token))
    }

    async fn ack_entity(
        &self,
        token: &str,
        state_update: Option<Option<String>>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        let Some((entity, _item)) = state.locked_entity.remove(token) else {
            return Err(BackendError::permanent(
                "ack_entity",
                format!("unknown lock token: {token}"),
            ));
        };
        match state_update {
            Some(Some(new_state)) => {
                state.entity_state.insert(entity.clone(), new_state);
            }
            Some(None) => {
                state.entity_state.remove(&entity);
            }
            None => {}
        }
        state.busy_entities.remove(&entity);
        state.enqueue_all(Vec::new(), Vec::new(), orchestrator_items, Vec::new());
        Ok(())
    }

    async fn abandon_entity(&self, token: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        if let Some((entity, item)) = state.locked_entity.remove(token) {
            state.busy_entities.remove(&entity);
            let visible_at_ms = wall_clock_ms();
            state.entity_queue.insert(0, QueuedItem { item, visible_at_ms });
        }
        Ok(())
    }

    async fn read_entity_state(&self, entity: &EntityId) -> Option<String> {
        self.state.lock().await.entity_state.get(entity).cloned()
    }

    async fn list_instances(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut out: Vec<String> = state.instances.keys().cloned().collect();
        out.sort();
        out
    }

    async fn get_instance_info(&self, instance: &str) -> Option<InstanceInfo> {
        let state = self.state.lock().await;
        state.instances.get(instance).map(|r| r.info.clone())
    }

    async fn remove_instance(&self, instance: &str) -> Result<bool, BackendError> {
        let mut state = self.state.lock().await;
        if state.instances.remove(instance).is_none() {
            return Ok(false);
        }
        state
            .orch_queue
            .retain(|qi| qi.item.target_instance() != Some(instance));
        state.worker_queue.retain(|i| i.target_instance() != Some(instance));
        state.timer_queue.retain(|i| i.target_instance() != Some(instance));
        Ok(true)
    }
}
