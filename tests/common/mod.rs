use std::sync::Arc;
use std::time::{Duration, Instant};

use duratask::backend::memory::InMemoryBackend;
use duratask::backend::Backend;
use duratask::HistoryEvent;

#[allow(dead_code)]
pub fn memory_backend() -> Arc<dyn Backend> {
    Arc::new(InMemoryBackend::new("test-hub"))
}

#[allow(dead_code)]
pub async fn wait_for_history<F>(backend: Arc<dyn Backend>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[HistoryEvent]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let history = backend.read(instance).await;
        if predicate(&history) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[allow(dead_code)]
pub async fn wait_until<F, Fut>(check: F, timeout_ms: u64) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if check().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
