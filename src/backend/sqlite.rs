//! SQLite-backed storage with transactional turn commits.
//!
//! Every table is scoped by `task_hub`. Queue rows carry a `visible_at`
//! timestamp, which gives this backend native delayed visibility: timer
//! firings are enqueued with a delay instead of being tracked by an
//! in-process heap.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use super::{Backend, BackendError, ExecutionMetadata, InstanceInfo, OrchestrationItem, WorkItem};
use crate::{generate_guid, wall_clock_ms, EntityId, HistoryEvent, INITIAL_EXECUTION_ID};

const QUEUE_ORCHESTRATOR: &str = "orchestrator";
const QUEUE_WORKER: &str = "worker";
const QUEUE_TIMER: &str = "timer";
const QUEUE_ENTITY: &str = "entity";

pub struct SqliteBackend {
    pool: SqlitePool,
    task_hub: String,
}

fn map_sqlx(operation: &str, e: sqlx::Error) -> BackendError {
    let message = e.to_string();
    if message.contains("database is locked") || message.contains("SQLITE_BUSY") {
        BackendError::transient(operation, format!("database locked: {message}"))
    } else if message.contains("UNIQUE constraint") || message.contains("PRIMARY KEY") {
        BackendError::permanent(operation, format!("constraint violation: {message}"))
    } else if message.contains("connection") || message.contains("timeout") {
        BackendError::transient(operation, format!("connection error: {message}"))
    } else {
        BackendError::transient(operation, message)
    }
}

fn encode_item(operation: &str, item: &WorkItem) -> Result<String, BackendError> {
    serde_json::to_string(item).map_err(|e| BackendError::permanent(operation, format!("serialize work item: {e}")))
}

fn decode_item(operation: &str, data: &str) -> Result<WorkItem, BackendError> {
    serde_json::from_str(data).map_err(|e| BackendError::permanent(operation, format!("deserialize work item: {e}")))
}

fn encode_event(operation: &str, event: &HistoryEvent) -> Result<String, BackendError> {
    serde_json::to_string(event).map_err(|e| BackendError::permanent(operation, format!("serialize event: {e}")))
}

fn decode_event(operation: &str, data: &str) -> Result<HistoryEvent, BackendError> {
    serde_json::from_str(data).map_err(|e| BackendError::permanent(operation, format!("deserialize event: {e}")))
}

/// Queue a work item belongs to, plus the target used for batching/locking.
fn queue_and_target(item: &WorkItem) -> (&'static str, String) {
    match item {
        WorkItem::ActivityExecute { instance, .. } => (QUEUE_WORKER, instance.clone()),
        WorkItem::TimerSchedule { instance, .. } => (QUEUE_TIMER, instance.clone()),
        WorkItem::EntityOperation { entity, .. } => (QUEUE_ENTITY, entity.to_string()),
        other => (
            QUEUE_ORCHESTRATOR,
            other.target_instance().unwrap_or_default().to_string(),
        ),
    }
}

impl SqliteBackend {
    /// Open (and initialize) a database at the given sqlx url, e.g.
    /// `sqlite:./data.db?mode=rwc`.
    pub async fn new(url: &str, task_hub: impl Into<String>) -> Result<Self, BackendError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| map_sqlx("connect", e))?;
        let backend = Self {
            pool,
            task_hub: task_hub.into(),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Private in-memory database, one per call. Test convenience.
    pub async fn new_in_memory(task_hub: impl Into<String>) -> Result<Self, BackendError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| map_sqlx("connect", e))?;
        let backend = Self {
            pool,
            task_hub: task_hub.into(),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    async fn init_schema(&self) -> Result<(), BackendError> {
        let ddl = [
            "CREATE TABLE IF NOT EXISTS instances (
                task_hub TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                orchestration_name TEXT NOT NULL DEFAULT '',
                orchestration_version TEXT NOT NULL DEFAULT '',
                current_execution_id INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'Pending',
                output TEXT,
                custom_status TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                completed_at INTEGER,
                PRIMARY KEY (task_hub, instance_id)
            )",
            "CREATE TABLE IF NOT EXISTS history (
                task_hub TEXT NOT NULL,
                instance_id TEXT NOT NULL,
                execution_id INTEGER NOT NULL,
                event_id INTEGER NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (task_hub, instance_id, execution_id, event_id)
            )",
            "CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_hub TEXT NOT NULL,
                queue TEXT NOT NULL,
                target TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT,
                work_item TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS ix_queue_fetch
                ON queue_messages (task_hub, queue, lock_token, visible_at)",
            "CREATE TABLE IF NOT EXISTS entity_state (
                task_hub TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                state TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (task_hub, entity_id)
            )",
        ];
        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx("init_schema", e))?;
        }
        Ok(())
    }

    async fn insert_queue_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task_hub: &str,
        item: &WorkItem,
        visible_at: i64,
    ) -> Result<(), BackendError> {
        let (queue, target) = queue_and_target(item);
        let payload = encode_item("enqueue", item)?;
        sqlx::query(
            "INSERT INTO queue_messages (task_hub, queue, target, visible_at, work_item)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_hub)
        .bind(queue)
        .bind(target)
        .bind(visible_at)
        .bind(payload)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx("enqueue", e))?;
        Ok(())
    }

    /// Conditional append inside an open transaction.
    async fn append_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task_hub: &str,
        instance: &str,
        execution_id: u64,
        expected_len: u64,
        events: &[HistoryEvent],
    ) -> Result<u64, BackendError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM history
             WHERE task_hub = ? AND instance_id = ? AND execution_id = ?",
        )
        .bind(task_hub)
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx("append", e))?;
        let current_len: i64 = row.get("n");

        if current_len as u64 != expected_len {
            return Err(BackendError::conflict(
                "append",
                format!("expected history length {expected_len}, found {current_len} for {instance}#{execution_id}"),
            ));
        }

        if current_len > 0 {
            let last = sqlx::query(
                "SELECT event_data FROM history
                 WHERE task_hub = ? AND instance_id = ? AND execution_id = ?
                 ORDER BY event_id DESC LIMIT 1",
            )
            .bind(task_hub)
            .bind(instance)
            .bind(execution_id as i64)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| map_sqlx("append", e))?;
            let data: String = last.get("event_data");
            if decode_event("append", &data)?.is_terminal() {
                return Err(BackendError::permanent(
                    "append",
                    format!("execution {instance}#{execution_id} is terminal; history is immutable"),
                ));
            }
        }

        for event in events {
            let payload = encode_event("append", event)?;
            sqlx::query(
                "INSERT INTO history (task_hub, instance_id, execution_id, event_id, event_data)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(task_hub)
            .bind(instance)
            .bind(execution_id as i64)
            .bind(event.event_id() as i64)
            .bind(payload)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx("append", e))?;
        }

        Ok(current_len as u64 + events.len() as u64)
    }

    async fn ensure_instance_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        task_hub: &str,
        instance: &str,
        now: i64,
    ) -> Result<(), BackendError> {
        sqlx::query(
            "INSERT OR IGNORE INTO instances (task_hub, instance_id, created_at, updated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(task_hub)
        .bind(instance)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx("ensure_instance", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for SqliteBackend {
    fn task_hub(&self) -> &str {
        &self.task_hub
    }

    fn supports_delayed_visibility(&self) -> bool {
        true
    }

    async fn create_instance(&self, instance: &str) -> Result<(), BackendError> {
        let now = wall_clock_ms() as i64;
        let result = sqlx::query(
            "INSERT INTO instances (task_hub, instance_id, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&self.task_hub)
        .bind(instance)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("UNIQUE constraint") => Err(BackendError::permanent(
                "create_instance",
                format!("instance already exists: {instance}"),
            )),
            Err(e) => Err(map_sqlx("create_instance", e)),
        }
    }

    async fn read(&self, instance: &str) -> Vec<HistoryEvent> {
        let execution_id = match self.latest_execution_id(instance).await {
            Some(id) => id,
            None => return Vec::new(),
        };
        self.read_execution(instance, execution_id).await
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Vec<HistoryEvent> {
        let rows = sqlx::query(
            "SELECT event_data FROM history
             WHERE task_hub = ? AND instance_id = ? AND execution_id = ?
             ORDER BY event_id",
        )
        .bind(&self.task_hub)
        .bind(instance)
        .bind(execution_id as i64)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();
        rows.iter()
            .filter_map(|r| {
                let data: String = r.get("event_data");
                decode_event("read_execution", &data).ok()
            })
            .collect()
    }

    async fn latest_execution_id(&self, instance: &str) -> Option<u64> {
        let row = sqlx::query(
            "SELECT current_execution_id FROM instances WHERE task_hub = ? AND instance_id = ?",
        )
        .bind(&self.task_hub)
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .ok()??;
        let id: i64 = row.get("current_execution_id");
        Some((id as u64).max(INITIAL_EXECUTION_ID))
    }

    async fn append(
        &self,
        instance: &str,
        execution_id: u64,
        expected_len: u64,
        events: Vec<HistoryEvent>,
    ) -> Result<u64, BackendError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("append", e))?;
        let now = wall_clock_ms() as i64;
        Self::ensure_instance_row(&mut tx, &self.task_hub, instance, now).await?;
        let len = Self::append_in_tx(&mut tx, &self.task_hub, instance, execution_id, expected_len, &events).await?;
        tx.commit().await.map_err(|e| map_sqlx("append", e))?;
        Ok(len)
    }

    async fn create_new_execution(
        &self,
        instance: &str,
        execution_id: u64,
        started: HistoryEvent,
    ) -> Result<(), BackendError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx("create_new_execution", e))?;
        let now = wall_clock_ms() as i64;
        Self::ensure_instance_row(&mut tx, &self.task_hub, instance, now).await?;
        Self::append_in_tx(&mut tx, &self.task_hub, instance, execution_id, 0, &[started]).await?;
        sqlx::query(
            "UPDATE instances
             SET current_execution_id = ?, status = 'Running', completed_at = NULL, updated_at = ?
             WHERE task_hub = ? AND instance_id = ?",
        )
        .bind(execution_id as i64)
        .bind(now)
        .bind(&self.task_hub)
        .bind(instance)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx("create_new_execution", e))?;
        tx.commit().await.map_err(|e| map_sqlx("create_new_execution", e))?;
        Ok(())
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem, delay_ms: Option<u64>) -> Result<(), BackendError> {
        let visible_at = (wall_clock_ms() + delay_ms.unwrap_or(0)) as i64;
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("enqueue", e))?;
        Self::insert_queue_row(&mut tx, &self.task_hub, &item, visible_at).await?;
        tx.commit().await.map_err(|e| map_sqlx("enqueue", e))?;
        Ok(())
    }

    async fn fetch_orchestration_item(&self) -> Option<OrchestrationItem> {
        let now = wall_clock_ms() as i64;
        let mut tx = self.pool.begin().await.ok()?;

        let candidate = sqlx::query(
            "SELECT target FROM queue_messages
             WHERE task_hub = ? AND queue = ? AND lock_token IS NULL AND visible_at <= ?
               AND target NOT IN (
                   SELECT DISTINCT target FROM queue_messages
                   WHERE task_hub = ? AND queue = ? AND lock_token IS NOT NULL
               )
             ORDER BY id LIMIT 1",
        )
        .bind(&self.task_hub)
        .bind(QUEUE_ORCHESTRATOR)
        .bind(now)
        .bind(&self.task_hub)
        .bind(QUEUE_ORCHESTRATOR)
        .fetch_optional(&mut *tx)
        .await
        .ok()??;
        let instance: String = candidate.get("target");

        let token = format!("orch-{}", generate_guid(now as u64));
        sqlx::query(
            "UPDATE queue_messages SET lock_token = ?
             WHERE task_hub = ? AND queue = ? AND target = ? AND lock_token IS NULL AND visible_at <= ?",
        )
        .bind(&token)
        .bind(&self.task_hub)
        .bind(QUEUE_ORCHESTRATOR)
        .bind(&instance)
        .bind(now)
        .execute(&mut *tx)
        .await
        .ok()?;

        let rows = sqlx::query("SELECT work_item FROM queue_messages WHERE lock_token = ? ORDER BY id")
            .bind(&token)
            .fetch_all(&mut *tx)
            .await
            .ok()?;
        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let data: String = row.get("work_item");
            messages.push(decode_item("fetch_orchestration_item", &data).ok()?);
        }

        let execution_row = sqlx::query(
            "SELECT current_execution_id FROM instances WHERE task_hub = ? AND instance_id = ?",
        )
        .bind(&self.task_hub)
        .bind(&instance)
        .fetch_optional(&mut *tx)
        .await
        .ok()?;
        let execution_id = execution_row
            .map(|r| (r.get::<i64, _>("current_execution_id") as u64).max(INITIAL_EXECUTION_ID))
            .unwrap_or(INITIAL_EXECUTION_ID);

        let history_rows = sqlx::query(
            "SELECT event_data FROM history
             WHERE task_hub = ? AND instance_id = ? AND execution_id = ?
             ORDER BY event_id",
        )
        .bind(&self.task_hub)
        .bind(&instance)
        .bind(execution_id as i64)
        .fetch_all(&mut *tx)
        .await
        .ok()?;
        let mut history = Vec::with_capacity(history_rows.len());
        for row in &history_rows {
            let data: String = row.get("event_data");
            history.push(decode_event("fetch_orchestration_item", &data).ok()?);
        }

        tx.commit().await.ok()?;
        Some(OrchestrationItem {
            instance,
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
        let op = "ack_orchestration_item";
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx(op, e))?;
        let now = wall_clock_ms() as i64;

        let locked = sqlx::query("SELECT target FROM queue_messages WHERE lock_token = ? LIMIT 1")
            .bind(lock_token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx(op, e))?;
        let Some(row) = locked else {
            return Err(BackendError::permanent(op, format!("unknown lock token: {lock_token}")));
        };
        let instance: String = row.get("target");

        if !history_delta.is_empty() {
            Self::ensure_instance_row(&mut tx, &self.task_hub, &instance, now).await?;
            Self::append_in_tx(
                &mut tx,
                &self.task_hub,
                &instance,
                execution_id,
                expected_len,
                &history_delta,
            )
            .await?;
        }

        for item in worker_items.iter().chain(&timer_items).chain(&orchestrator_items).chain(&entity_items) {
            Self::insert_queue_row(&mut tx, &self.task_hub, item, now).await?;
        }

        // Name/version come from the started event the runtime just appended.
        let started = history_delta.iter().find_map(|e| match e {
            HistoryEvent::OrchestrationStarted { name, version, .. } => Some((name.clone(), version.clone())),
            _ => None,
        });
        if let Some((name, version)) = started {
            sqlx::query(
                "UPDATE instances SET orchestration_name = ?, orchestration_version = ?
                 WHERE task_hub = ? AND instance_id = ? AND orchestration_name = ''",
            )
            .bind(name)
            .bind(version)
            .bind(&self.task_hub)
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(op, e))?;
        }

        if let Some(status) = &metadata.status {
            let terminal = matches!(status.as_str(), "Completed" | "Failed" | "Terminated");
            sqlx::query(
                "UPDATE instances SET
                    status = ?,
                    output = COALESCE(?, output),
                    custom_status = COALESCE(?, custom_status),
                    current_execution_id = MAX(current_execution_id, ?),
                    updated_at = ?,
                    completed_at = CASE WHEN ? THEN COALESCE(completed_at, ?) ELSE NULL END
                 WHERE task_hub = ? AND instance_id = ?",
            )
            .bind(status)
            .bind(metadata.output.clone())
            .bind(metadata.custom_status.clone())
            .bind(execution_id as i64)
            .bind(now)
            .bind(terminal)
            .bind(now)
            .bind(&self.task_hub)
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(op, e))?;
        } else {
            sqlx::query(
                "UPDATE instances SET updated_at = ?, current_execution_id = MAX(current_execution_id, ?)
                 WHERE task_hub = ? AND instance_id = ?",
            )
            .bind(now)
            .bind(execution_id as i64)
            .bind(&self.task_hub)
            .bind(&instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(op, e))?;
        }

        sqlx::query("DELETE FROM queue_messages WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(op, e))?;

        tx.commit().await.map_err(|e| map_sqlx(op, e))?;
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay_ms: Option<u64>) -> Result<(), BackendError> {
        let visible_at = (wall_clock_ms() + delay_ms.unwrap_or(0)) as i64;
        sqlx::query("UPDATE queue_messages SET lock_token = NULL, visible_at = ? WHERE lock_token = ?")
            .bind(visible_at)
            .bind(lock_token)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("abandon_orchestration_item", e))?;
        Ok(())
    }

    async fn enqueue_worker_work(&self, item: WorkItem) -> Result<(), BackendError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("enqueue", e))?;
        Self::insert_queue_row(&mut tx, &self.task_hub, &item, wall_clock_ms() as i64).await?;
        tx.commit().await.map_err(|e| map_sqlx("enqueue", e))?;
        Ok(())
    }

    async fn dequeue_worker_peek_lock(&self) -> Option<(WorkItem, String)> {
        self.dequeue_single(QUEUE_WORKER).await
    }

    async fn ack_worker(&self, token: &str) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM queue_messages WHERE lock_token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("ack_worker", e))?;
        Ok(())
    }

    async fn abandon_worker(&self, token: &str) -> Result<(), BackendError> {
        sqlx::query("UPDATE queue_messages SET lock_token = NULL WHERE lock_token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("abandon_worker", e))?;
        Ok(())
    }

    async fn enqueue_timer_work(&self, item: WorkItem) -> Result<(), BackendError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("enqueue", e))?;
        Self::insert_queue_row(&mut tx, &self.task_hub, &item, wall_clock_ms() as i64).await?;
        tx.commit().await.map_err(|e| map_sqlx("enqueue", e))?;
        Ok(())
    }

    async fn dequeue_timer_peek_lock(&self) -> Option<(WorkItem, String)> {
        self.dequeue_single(QUEUE_TIMER).await
    }

    async fn ack_timer(&self, token: &str) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM queue_messages WHERE lock_token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("ack_timer", e))?;
        Ok(())
    }

    async fn enqueue_entity_work(&self, item: WorkItem) -> Result<(), BackendError> {
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx("enqueue", e))?;
        Self::insert_queue_row(&mut tx, &self.task_hub, &item, wall_clock_ms() as i64).await?;
        tx.commit().await.map_err(|e| map_sqlx("enqueue", e))?;
        Ok(())
    }

    async fn dequeue_entity_peek_lock(&self) -> Option<(WorkItem, String)> {
        let now = wall_clock_ms() as i64;
        let mut tx = self.pool.begin().await.ok()?;
        // One in-flight operation per entity key: skip targets that already
        // hold a lock.
        let row = sqlx::query(
            "SELECT id, work_item FROM queue_messages
             WHERE task_hub = ? AND queue = ? AND lock_token IS NULL AND visible_at <= ?
               AND target NOT IN (
                   SELECT DISTINCT target FROM queue_messages
                   WHERE task_hub = ? AND queue = ? AND lock_token IS NOT NULL
               )
             ORDER BY id LIMIT 1",
        )
        .bind(&self.task_hub)
        .bind(QUEUE_ENTITY)
        .bind(now)
        .bind(&self.task_hub)
        .bind(QUEUE_ENTITY)
        .fetch_optional(&mut *tx)
        .await
        .ok()??;
        let id: i64 = row.get("id");
        let data: String = row.get("work_item");
        let item = decode_item("dequeue_entity", &data).ok()?;

        let token = format!("entity-{}", generate_guid(id as u64));
        sqlx::query("UPDATE queue_messages SET lock_token = ? WHERE id = ?")
            .bind(&token)
            .bind(id)
            .execute(&mut *tx)
            .await
            .ok()?;
        tx.commit().await.ok()?;
        Some((item, token))
    }

    async fn ack_entity(
        &self,
        token: &str,
        state_update: Option<Option<String>>,
        orchestrator_items: Vec<WorkItem>,
    ) -> Result<(), BackendError> {
        let op = "ack_entity";
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx(op, e))?;
        let now = wall_clock_ms() as i64;

        let locked = sqlx::query("SELECT target FROM queue_messages WHERE lock_token = ? LIMIT 1")
            .bind(token)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx(op, e))?;
        let Some(row) = locked else {
            return Err(BackendError::permanent(op, format!("unknown lock token: {token}")));
        };
        let entity_key: String = row.get("target");

        match state_update {
            Some(Some(new_state)) => {
                sqlx::query(
                    "INSERT INTO entity_state (task_hub, entity_id, state, updated_at) VALUES (?, ?, ?, ?)
                     ON CONFLICT (task_hub, entity_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
                )
                .bind(&self.task_hub)
                .bind(&entity_key)
                .bind(new_state)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx(op, e))?;
            }
            Some(None) => {
                sqlx::query("DELETE FROM entity_state WHERE task_hub = ? AND entity_id = ?")
                    .bind(&self.task_hub)
                    .bind(&entity_key)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx(op, e))?;
            }
            None => {}
        }

        for item in &orchestrator_items {
            Self::insert_queue_row(&mut tx, &self.task_hub, item, now).await?;
        }

        sqlx::query("DELETE FROM queue_messages WHERE lock_token = ?")
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(op, e))?;
        tx.commit().await.map_err(|e| map_sqlx(op, e))?;
        Ok(())
    }

    async fn abandon_entity(&self, token: &str) -> Result<(), BackendError> {
        sqlx::query("UPDATE queue_messages SET lock_token = NULL WHERE lock_token = ?")
            .bind(token)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx("abandon_entity", e))?;
        Ok(())
    }

    async fn read_entity_state(&self, entity: &EntityId) -> Option<String> {
        let row = sqlx::query("SELECT state FROM entity_state WHERE task_hub = ? AND entity_id = ?")
            .bind(&self.task_hub)
            .bind(entity.to_string())
            .fetch_optional(&self.pool)
            .await
            .ok()??;
        row.get::<Option<String>, _>("state")
    }

    async fn list_instances(&self) -> Vec<String> {
        let rows = sqlx::query("SELECT instance_id FROM instances WHERE task_hub = ? ORDER BY instance_id")
            .bind(&self.task_hub)
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();
        rows.iter().map(|r| r.get("instance_id")).collect()
    }

    async fn get_instance_info(&self, instance: &str) -> Option<InstanceInfo> {
        let row = sqlx::query(
            "SELECT orchestration_name, orchestration_version, current_execution_id, status,
                    output, custom_status, created_at, updated_at, completed_at
             FROM instances WHERE task_hub = ? AND instance_id = ?",
        )
        .bind(&self.task_hub)
        .bind(instance)
        .fetch_optional(&self.pool)
        .await
        .ok()??;
        Some(InstanceInfo {
            instance: instance.to_string(),
            orchestration_name: row.get("orchestration_name"),
            orchestration_version: row.get("orchestration_version"),
            current_execution_id: row.get::<i64, _>("current_execution_id") as u64,
            status: row.get("status"),
            output: row.get("output"),
            custom_status: row.get("custom_status"),
            created_at_ms: row.get::<i64, _>("created_at") as u64,
            updated_at_ms: row.get::<i64, _>("updated_at") as u64,
            completed_at_ms: row.get::<Option<i64>, _>("completed_at").map(|v| v as u64),
        })
    }

    async fn remove_instance(&self, instance: &str) -> Result<bool, BackendError> {
        let op = "remove_instance";
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx(op, e))?;
        let removed = sqlx::query("DELETE FROM instances WHERE task_hub = ? AND instance_id = ?")
            .bind(&self.task_hub)
            .bind(instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(op, e))?;
        sqlx::query("DELETE FROM history WHERE task_hub = ? AND instance_id = ?")
            .bind(&self.task_hub)
            .bind(instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(op, e))?;
        sqlx::query("DELETE FROM queue_messages WHERE task_hub = ? AND queue != ? AND target = ?")
            .bind(&self.task_hub)
            .bind(QUEUE_ENTITY)
            .bind(instance)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx(op, e))?;
        tx.commit().await.map_err(|e| map_sqlx(op, e))?;
        Ok(removed.rows_affected() > 0)
    }
}

impl SqliteBackend {
    async fn dequeue_single(&self, queue: &str) -> Option<(WorkItem, String)> {
        let now = wall_clock_ms() as i64;
        let mut tx = self.pool.begin().await.ok()?;
        let row = sqlx::query(
            "SELECT id, work_item FROM queue_messages
             WHERE task_hub = ? AND queue = ? AND lock_token IS NULL AND visible_at <= ?
             ORDER BY id LIMIT 1",
        )
        .bind(&self.task_hub)
        .bind(queue)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .ok()??;
        let id: i64 = row.get("id");
        let data: String = row.get("work_item");
        let item = decode_item("dequeue", &data).ok()?;
        let token = format!("{queue}-{}", generate_guid(id as u64));
        sqlx::query("UPDATE queue_messages SET lock_token = ? WHERE id = ?")
            .bind(&token)
            .bind(id)
            .execute(&mut *tx)
            .await
            .ok()?;
        tx.commit().await.ok()?;
        Some((item, token))
    }
}
