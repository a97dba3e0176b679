//! In-process timer service for backends without delayed queue visibility.
//!
//! Holds pending `TimerSchedule` items in a min-heap and enqueues the
//! matching `TimerFired` at or after the requested fire time, never before.
//! The schedule's queue lock is only acknowledged after the firing has been
//! enqueued, so a crash re-delivers the schedule instead of losing it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use crate::backend::{Backend, WorkItem};
use crate::wall_clock_ms;

pub(crate) struct TimerWithToken {
    pub item: WorkItem,
    pub ack_token: String,
}

pub(crate) struct TimerService {
    backend: Arc<dyn Backend>,
    rx: tokio::sync::mpsc::UnboundedReceiver<TimerWithToken>,
    // key "instance|execution|id|fire_at" -> pending entry
    items: HashMap<String, (String, u64, u64, String)>,
    keys: HashSet<String>,
    min_heap: BinaryHeap<Reverse<(u64, String)>>,
    idle_sleep_ms: u64,
}

impl TimerService {
    pub fn start(
        backend: Arc<dyn Backend>,
        idle_sleep_ms: u64,
    ) -> (
        tokio::task::JoinHandle<()>,
        tokio::sync::mpsc::UnboundedSender<TimerWithToken>,
    ) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut service = TimerService {
            backend,
            rx,
            items: HashMap::new(),
            keys: HashSet::new(),
            min_heap: BinaryHeap::new(),
            idle_sleep_ms,
        };
        let handle = tokio::spawn(async move { service.run().await });
        (handle, tx)
    }

    async fn run(&mut self) {
        loop {
            while let Ok(entry) = self.rx.try_recv() {
                self.insert(entry);
            }

            let now = wall_clock_ms();
            let mut due = Vec::new();
            while let Some(Reverse((fire_at, key))) = self.min_heap.peek().cloned() {
                if fire_at > now {
                    break;
                }
                let _ = self.min_heap.pop();
                if let Some((instance, execution_id, id, token)) = self.items.remove(&key) {
                    self.keys.remove(&key);
                    due.push((instance, execution_id, id, fire_at, token));
                }
            }

            for (instance, execution_id, id, fire_at_ms, token) in due.drain(..) {
                let fired = WorkItem::TimerFired {
                    instance,
                    execution_id,
                    id,
                    fire_at_ms,
                };
                if self.backend.enqueue_orchestrator_work(fired, None).await.is_ok() {
                    let _ = self.backend.ack_timer(&token).await;
                } else {
                    tracing::warn!(fire_at_ms, "timer firing enqueue failed; schedule stays locked");
                }
            }

            if let Some(Reverse((next_fire, _))) = self.min_heap.peek().cloned() {
                let wait = next_fire.saturating_sub(wall_clock_ms()).max(1);
                tokio::select! {
                    _ = tokio::time::sleep(std::time::Duration::from_millis(wait)) => {}
                    maybe = self.rx.recv() => {
                        match maybe {
                            Some(entry) => self.insert(entry),
                            None => tokio::time::sleep(std::time::Duration::from_millis(self.idle_sleep_ms)).await,
                        }
                    }
                }
            } else {
                match self.rx.recv().await {
                    Some(entry) => self.insert(entry),
                    None => tokio::time::sleep(std::time::Duration::from_millis(self.idle_sleep_ms)).await,
                }
            }
        }
    }

    fn insert(&mut self, entry: TimerWithToken) {
        if let WorkItem::TimerSchedule {
            instance,
            execution_id,
            id,
            fire_at_ms,
        } = entry.item
        {
            let key = format!("{instance}|{execution_id}|{id}|{fire_at_ms}");
            if self.keys.insert(key.clone()) {
                self.min_heap.push(Reverse((fire_at_ms, key.clone())));
                self.items.insert(key, (instance, execution_id, id, entry.ack_token));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;

    #[tokio::test]
    async fn fires_due_timers_in_fire_time_order() {
        let backend: Arc<dyn Backend> = Arc::new(InMemoryBackend::new("timers-test"));
        let (_jh, tx) = TimerService::start(backend.clone(), 5);
        let now = wall_clock_ms();
        for (id, offset) in [(1u64, 0u64), (2, 30), (3, 10)] {
            let _ = tx.send(TimerWithToken {
                item: WorkItem::TimerSchedule {
                    instance: "inst".into(),
                    execution_id: 1,
                    id,
                    fire_at_ms: now + offset,
                },
                ack_token: format!("tok-{id}"),
            });
        }

        let mut fired = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(500);
        while fired.len() < 3 && std::time::Instant::now() < deadline {
            if let Some(item) = backend.fetch_orchestration_item().await {
                for wi in &item.messages {
                    if let WorkItem::TimerFired { id, .. } = wi {
                        fired.push(*id);
                    }
                }
                backend
                    .ack_orchestration_item(
                        &item.lock_token,
                        item.execution_id,
                        0,
                        vec![],
                        vec![],
                        vec![],
                        vec![],
                        vec![],
                        Default::default(),
                    )
                    .await
                    .unwrap();
            } else {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        }
        assert_eq!(fired, vec![1, 3, 2]);
    }
}
