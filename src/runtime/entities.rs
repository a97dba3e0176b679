//! Durable entities: small stateful actors with per-key serialized operations.
//!
//! The backend hands out at most one operation per entity key at a time, so a
//! handler never races itself; distinct keys process fully in parallel. State
//! mutations commit atomically with the operation's completion; a crash
//! before the ack re-runs the operation against the old state.

use std::sync::{Arc, Mutex};

use crate::backend::{Backend, EntityCaller, WorkItem};
use crate::EntityId;

struct EntityCtxInner {
    entity: EntityId,
    stored: Option<String>,
    /// Pending mutation: `Some(Some(_))` set, `Some(None)` delete.
    update: Option<Option<String>>,
}

/// Handle passed to entity handlers. Cheap to clone; state reads observe the
/// pending mutation of the current operation.
#[derive(Clone)]
pub struct EntityContext {
    inner: Arc<Mutex<EntityCtxInner>>,
}

impl EntityContext {
    pub(crate) fn new(entity: EntityId, stored: Option<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(EntityCtxInner {
                entity,
                stored,
                update: None,
            })),
        }
    }

    pub fn entity(&self) -> EntityId {
        self.inner.lock().unwrap().entity.clone()
    }

    /// Current state as stored, overlaid with any mutation made during this
    /// operation.
    pub fn state(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        match &inner.update {
            Some(update) => update.clone(),
            None => inner.stored.clone(),
        }
    }

    pub fn state_typed<T: serde::de::DeserializeOwned>(&self) -> Result<Option<T>, String> {
        match self.state() {
            Some(s) => crate::codec::decode(&s).map(Some),
            None => Ok(None),
        }
    }

    pub fn set_state(&self, state: impl Into<String>) {
        self.inner.lock().unwrap().update = Some(Some(state.into()));
    }

    pub fn set_state_typed<T: serde::Serialize>(&self, value: &T) -> Result<(), String> {
        let encoded = crate::codec::encode(value)?;
        self.set_state(encoded);
        Ok(())
    }

    pub fn delete_state(&self) {
        self.inner.lock().unwrap().update = Some(None);
    }

    pub(crate) fn take_update(&self) -> Option<Option<String>> {
        self.inner.lock().unwrap().update.take()
    }
}

/// Trait implemented by entity handlers.
#[async_trait::async_trait]
pub trait EntityHandler: Send + Sync {
    async fn invoke(&self, ctx: EntityContext, op: String, input: String) -> Result<String, String>;
}

/// Function wrapper implementing [`EntityHandler`].
pub struct FnEntity<F, Fut>(pub F)
where
    F: Fn(EntityContext, String, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait::async_trait]
impl<F, Fut> EntityHandler for FnEntity<F, Fut>
where
    F: Fn(EntityContext, String, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: EntityContext, op: String, input: String) -> Result<String, String> {
        (self.0)(ctx, op, input).await
    }
}

/// Dispatcher loop: executes entity operations and routes call results back
/// to the scheduling orchestration.
pub(crate) async fn entity_dispatch_loop(
    backend: Arc<dyn Backend>,
    registry: super::registry::EntityRegistry,
    idle_sleep_ms: u64,
) {
    loop {
        let Some((item, token)) = backend.dequeue_entity_peek_lock().await else {
            tokio::time::sleep(std::time::Duration::from_millis(idle_sleep_ms)).await;
            continue;
        };
        let WorkItem::EntityOperation {
            entity,
            op,
            input,
            caller,
        } = item
        else {
            tracing::error!("unexpected work item in entity dispatcher; state corruption");
            let _ = backend.ack_entity(&token, None, Vec::new()).await;
            continue;
        };

        let outcome = match registry.resolve_latest(&entity.name) {
            Some((_version, handler)) => {
                let ctx = EntityContext::new(entity.clone(), backend.read_entity_state(&entity).await);
                let result = handler.invoke(ctx.clone(), op.clone(), input).await;
                let update = match &result {
                    Ok(_) => ctx.take_update(),
                    // Failed operations leave state untouched.
                    Err(_) => None,
                };
                (result, update)
            }
            None => (Err(format!("unregistered:{}", entity.name)), None),
        };
        let (result, state_update) = outcome;

        let completions = match caller {
            Some(EntityCaller {
                instance,
                execution_id,
                id,
            }) => vec![match &result {
                Ok(value) => WorkItem::EntityOpCompleted {
                    instance,
                    execution_id,
                    id,
                    result: value.clone(),
                },
                Err(error) => WorkItem::EntityOpFailed {
                    instance,
                    execution_id,
                    id,
                    error: error.clone(),
                },
            }],
            None => {
                if let Err(error) = &result {
                    tracing::warn!(entity = %entity, op = %op, error = %error, "entity signal failed");
                }
                Vec::new()
            }
        };

        if let Err(e) = backend.ack_entity(&token, state_update, completions).await {
            tracing::warn!(entity = %entity, error = %e, "entity ack failed; operation will redeliver");
            let _ = backend.abandon_entity(&token).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_overlay_reflects_pending_update() {
        let ctx = EntityContext::new(EntityId::new("counter", "a"), Some("1".into()));
        assert_eq!(ctx.state(), Some("1".to_string()));
        ctx.set_state("2");
        assert_eq!(ctx.state(), Some("2".to_string()));
        ctx.delete_state();
        assert_eq!(ctx.state(), None);
        assert_eq!(ctx.take_update(), Some(None));
        // After the update is consumed, reads fall back to the stored value.
        assert_eq!(ctx.state(), Some("1".to_string()));
    }
}
