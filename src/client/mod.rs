//! Management client: start, signal, terminate, suspend, purge and query
//! orchestration instances, scoped to the backend's task hub.
//!
//! The client only talks to the shared backend: every mutation is an
//! enqueue or a direct store operation, never an in-process call into the
//! runtime. Management errors are returned synchronously to the caller and
//! never retried here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{Backend, BackendError, InstanceInfo, WorkItem};
use crate::runtime::status::{status_from_history, OrchestrationStatus, WaitError};
use crate::{generate_guid, wall_clock_ms, EntityId, HistoryEvent};

/// Caller-facing error for management operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    NotFound(String),
    /// Operation requires a terminal instance (purge on a running one).
    NotTerminal { instance: String, status: String },
    InvalidInput(String),
    Backend(BackendError),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::NotFound(instance) => write!(f, "instance not found: {instance}"),
            ClientError::NotTerminal { instance, status } => {
                write!(f, "instance {instance} is not terminal (status: {status})")
            }
            ClientError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ClientError::Backend(e) => write!(f, "backend error: {e}"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<BackendError> for ClientError {
    fn from(e: BackendError) -> Self {
        ClientError::Backend(e)
    }
}

/// Result of a purge request. Purging an unknown (or already purged)
/// instance is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Purged,
    NotFound,
}

/// Terminal statuses a retention rule can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalStatus {
    Completed,
    Failed,
    Terminated,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Completed => "Completed",
            TerminalStatus::Failed => "Failed",
            TerminalStatus::Terminated => "Terminated",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "Completed" => Some(TerminalStatus::Completed),
            "Failed" => Some(TerminalStatus::Failed),
            "Terminated" => Some(TerminalStatus::Terminated),
            _ => None,
        }
    }
}

/// Retention rules for terminal instances: a default plus status-specific
/// overrides. A status-specific rule always wins over the default.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    default_retention: Duration,
    overrides: HashMap<TerminalStatus, Duration>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new(Self::days(30))
    }
}

impl RetentionPolicy {
    pub fn new(default_retention: Duration) -> Self {
        Self {
            default_retention,
            overrides: HashMap::new(),
        }
    }

    pub fn days(n: u64) -> Duration {
        Duration::from_secs(n * 24 * 60 * 60)
    }

    pub fn with_rule(mut self, status: TerminalStatus, retention: Duration) -> Self {
        self.overrides.insert(status, retention);
        self
    }

    pub fn retention_for(&self, status: TerminalStatus) -> Duration {
        self.overrides.get(&status).copied().unwrap_or(self.default_retention)
    }
}

/// Management client bound to one backend (and therefore one task hub).
pub struct Client {
    backend: Arc<dyn Backend>,
}

impl Client {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    pub fn task_hub(&self) -> &str {
        self.backend.task_hub()
    }

    // ===== Start =====

    /// Start an orchestration under an explicit instance id, unique within
    /// the task hub.
    pub async fn start_orchestration(
        &self,
        instance: &str,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start_inner(instance, orchestration, None, input.into()).await
    }

    /// Start an orchestration under a generated instance id.
    pub async fn start_orchestration_new(
        &self,
        orchestration: &str,
        input: impl Into<String>,
    ) -> Result<String, ClientError> {
        let instance = format!("{}-{}", orchestration.to_lowercase(), generate_guid(0));
        self.start_inner(&instance, orchestration, None, input.into()).await?;
        Ok(instance)
    }

    /// Start pinned to a specific registered version.
    pub async fn start_orchestration_versioned(
        &self,
        instance: &str,
        orchestration: &str,
        version: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.start_inner(instance, orchestration, Some(version.into()), input.into())
            .await
    }

    /// Start with a JSON-typed input.
    pub async fn start_orchestration_typed<In: serde::Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = crate::codec::encode(input).map_err(ClientError::InvalidInput)?;
        self.start_inner(instance, orchestration, None, payload).await
    }

    async fn start_inner(
        &self,
        instance: &str,
        orchestration: &str,
        version: Option<String>,
        input: String,
    ) -> Result<(), ClientError> {
        if instance.is_empty() {
            return Err(ClientError::InvalidInput("instance id must not be empty".into()));
        }
        if orchestration.is_empty() {
            return Err(ClientError::InvalidInput("orchestration name must not be empty".into()));
        }
        self.backend.create_instance(instance).await.map_err(|e| {
            if e.message.contains("already exists") {
                ClientError::InvalidInput(format!("instance already exists: {instance}"))
            } else {
                ClientError::Backend(e)
            }
        })?;
        self.backend
            .enqueue_orchestrator_work(
                WorkItem::StartOrchestration {
                    instance: instance.to_string(),
                    orchestration: orchestration.to_string(),
                    version,
                    input,
                    parent_instance: None,
                    parent_id: None,
                },
                None,
            )
            .await?;
        Ok(())
    }

    // ===== Signals and control =====

    /// Deliver an external event. Buffered: raising before the orchestration
    /// reaches its wait still satisfies that wait.
    pub async fn raise_event(
        &self,
        instance: &str,
        event_name: impl Into<String>,
        data: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.require_instance(instance).await?;
        self.backend
            .enqueue_orchestrator_work(
                WorkItem::ExternalRaised {
                    instance: instance.to_string(),
                    name: event_name.into(),
                    data: data.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Request termination. Asynchronous: the instance stops replaying once
    /// the control is processed; in-flight activities finish and their
    /// results are discarded.
    pub async fn terminate_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.require_instance(instance).await?;
        self.backend
            .enqueue_orchestrator_work(
                WorkItem::TerminateInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn suspend_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.require_instance(instance).await?;
        self.backend
            .enqueue_orchestrator_work(
                WorkItem::SuspendInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn resume_instance(&self, instance: &str, reason: impl Into<String>) -> Result<(), ClientError> {
        self.require_instance(instance).await?;
        self.backend
            .enqueue_orchestrator_work(
                WorkItem::ResumeInstance {
                    instance: instance.to_string(),
                    reason: reason.into(),
                },
                None,
            )
            .await?;
        Ok(())
    }

    /// Fire-and-forget an entity operation.
    pub async fn signal_entity(
        &self,
        entity: EntityId,
        op: impl Into<String>,
        input: impl Into<String>,
    ) -> Result<(), ClientError> {
        self.backend
            .enqueue_entity_work(WorkItem::EntityOperation {
                entity,
                op: op.into(),
                input: input.into(),
                caller: None,
            })
            .await?;
        Ok(())
    }

    pub async fn read_entity_state(&self, entity: &EntityId) -> Option<String> {
        self.backend.read_entity_state(entity).await
    }

    // ===== Queries =====

    pub async fn get_orchestration_status(&self, instance: &str) -> OrchestrationStatus {
        let history = self.backend.read(instance).await;
        if history.is_empty() {
            if self.backend.get_instance_info(instance).await.is_some() {
                OrchestrationStatus::Pending
            } else {
                OrchestrationStatus::NotFound
            }
        } else {
            status_from_history(&history)
        }
    }

    pub async fn get_status_with_history(&self, instance: &str) -> (OrchestrationStatus, Vec<HistoryEvent>) {
        let history = self.backend.read(instance).await;
        let status = if history.is_empty() {
            if self.backend.get_instance_info(instance).await.is_some() {
                OrchestrationStatus::Pending
            } else {
                OrchestrationStatus::NotFound
            }
        } else {
            status_from_history(&history)
        };
        (status, history)
    }

    pub async fn get_execution_history(&self, instance: &str, execution_id: u64) -> Vec<HistoryEvent> {
        self.backend.read_execution(instance, execution_id).await
    }

    pub async fn get_instance_info(&self, instance: &str) -> Option<InstanceInfo> {
        self.backend.get_instance_info(instance).await
    }

    pub async fn list_instances(&self) -> Vec<String> {
        self.backend.list_instances().await
    }

    /// Poll until the instance reaches a terminal status. Continue-as-new is
    /// not terminal; the wait follows the next execution.
    pub async fn wait_for_orchestration(
        &self,
        instance: &str,
        timeout: Duration,
    ) -> Result<OrchestrationStatus, WaitError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let status = self.get_orchestration_status(instance).await;
            if status == OrchestrationStatus::NotFound {
                return Err(WaitError::Other(format!("instance not found: {instance}")));
            }
            if status.is_terminal() {
                return Ok(status);
            }
            if std::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // ===== Purge and retention =====

    /// Delete a terminal instance's history. Unknown instances report
    /// `NotFound` without failing; non-terminal instances are rejected.
    pub async fn purge_instance(&self, instance: &str) -> Result<PurgeOutcome, ClientError> {
        let Some(info) = self.backend.get_instance_info(instance).await else {
            return Ok(PurgeOutcome::NotFound);
        };
        if TerminalStatus::from_str(&info.status).is_none() {
            return Err(ClientError::NotTerminal {
                instance: instance.to_string(),
                status: info.status,
            });
        }
        let removed = self.backend.remove_instance(instance).await?;
        Ok(if removed { PurgeOutcome::Purged } else { PurgeOutcome::NotFound })
    }

    /// Sweep every terminal instance whose retention window has elapsed.
    /// Returns the purged instance ids.
    pub async fn purge_expired(&self, policy: &RetentionPolicy) -> Result<Vec<String>, ClientError> {
        let now = wall_clock_ms();
        let mut purged = Vec::new();
        for instance in self.backend.list_instances().await {
            let Some(info) = self.backend.get_instance_info(&instance).await else {
                continue;
            };
            let Some(status) = TerminalStatus::from_str(&info.status) else {
                continue;
            };
            let Some(completed_at) = info.completed_at_ms else {
                continue;
            };
            let retention_ms = policy.retention_for(status).as_millis() as u64;
            if completed_at.saturating_add(retention_ms) <= now {
                if self.backend.remove_instance(&instance).await? {
                    purged.push(instance);
                }
            }
        }
        Ok(purged)
    }

    async fn require_instance(&self, instance: &str) -> Result<(), ClientError> {
        if self.backend.get_instance_info(instance).await.is_none() {
            return Err(ClientError::NotFound(instance.to_string()));
        }
        Ok(())
    }
}
