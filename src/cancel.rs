//! Cooperative cancellation: the host-wide interrupt flag, caller tokens and
//! the request-id registry used for out-of-band "cancel this request".

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;

/// Interval between cancellation checks while a request is in flight.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Anything the executor can poll to learn that it should stop.
pub trait CancellationSource: Send + Sync {
    fn is_cancelled(&self) -> bool;
}

impl CancellationSource for CancellationToken {
    fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }
}

/// Host-wide "execution interrupted" flag. Cheap to clone; all clones share
/// one flag. The executor only reads it.
#[derive(Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl CancellationSource for InterruptFlag {
    fn is_cancelled(&self) -> bool {
        self.is_raised()
    }
}

/// The set of sources one request watches. Cancelled when any source is.
#[derive(Clone, Default)]
pub struct CancelWatch {
    sources: Vec<Arc<dyn CancellationSource>>,
}

impl CancelWatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: Arc<dyn CancellationSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_token(self, token: CancellationToken) -> Self {
        self.with(Arc::new(token))
    }

    pub fn is_cancelled(&self) -> bool {
        self.sources.iter().any(|s| s.is_cancelled())
    }

    /// Resolves once any source reports cancellation. Polls every
    /// `POLL_INTERVAL`; never resolves for an empty watch.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Result of racing a task against a `CancelWatch`.
#[derive(Debug)]
pub enum Raced<T> {
    Completed(T),
    Cancelled,
}

/// Run `fut` as its own task and race it against `watch`. On cancellation
/// the task is aborted and drained before returning, so nothing it owns
/// (callbacks included) runs afterwards.
pub async fn race<T, F>(fut: F, watch: &CancelWatch) -> Result<Raced<T>, RelayError>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let mut set = JoinSet::new();
    set.spawn(fut);

    let joined = tokio::select! {
        biased;
        () = watch.cancelled() => None,
        joined = set.join_next() => Some(joined),
    };

    match joined {
        None => {
            set.abort_all();
            while set.join_next().await.is_some() {}
            Ok(Raced::Cancelled)
        }
        Some(Some(Ok(value))) => Ok(Raced::Completed(value)),
        Some(Some(Err(e))) => Err(RelayError::Other(format!("request task failed: {e}"))),
        Some(None) => Err(RelayError::Other("request task vanished".to_string())),
    }
}

/// Maps `request_id → token` for requests that accept out-of-band
/// cancellation.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
    next_generation: Arc<AtomicU64>,
}

struct Entry {
    generation: u64,
    token: CancellationToken,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `request_id`. The entry lives exactly as long as the returned
    /// guard. Re-registering an id replaces (and cancels) the stale entry.
    pub fn register(&self, request_id: &str) -> Registration {
        let token = CancellationToken::new();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let stale = self.lock().insert(
            request_id.to_string(),
            Entry {
                generation,
                token: token.clone(),
            },
        );
        if let Some(stale) = stale {
            tracing::debug!(request_id, "replacing stale cancel registration");
            stale.token.cancel();
        }
        Registration {
            registry: self.clone(),
            request_id: request_id.to_string(),
            generation,
            token,
        }
    }

    /// Cancel a registered request. Returns false for unknown ids.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.lock().get(request_id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every registered request.
    pub fn cancel_all(&self) -> usize {
        let map = self.lock();
        for entry in map.values() {
            entry.token.cancel();
        }
        map.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        // A poisoned map is still structurally valid.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// RAII handle for a registered request. Dropping it removes the entry, so
/// completion, cancellation and error paths all clean up.
pub struct Registration {
    registry: CancelRegistry,
    request_id: String,
    generation: u64,
    token: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut map = self.registry.lock();
        // Only remove our own entry; a re-registration may have replaced it.
        if map
            .get(&self.request_id)
            .is_some_and(|e| e.generation == self.generation)
        {
            map.remove(&self.request_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_removed_on_drop() {
        let registry = CancelRegistry::new();
        {
            let reg = registry.register("req-1");
            assert!(registry.contains("req-1"));
            assert!(registry.cancel("req-1"));
            assert!(reg.token().is_cancelled());
        }
        assert!(registry.is_empty());
        assert!(!registry.cancel("req-1"));
    }

    #[test]
    fn stale_guard_does_not_remove_replacement() {
        let registry = CancelRegistry::new();
        let first = registry.register("dup");
        let second = registry.register("dup");
        assert!(first.token().is_cancelled(), "replaced entry is cancelled");
        drop(first);
        assert!(registry.contains("dup"));
        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn watch_combines_sources() {
        let flag = InterruptFlag::new();
        let token = CancellationToken::new();
        let watch = CancelWatch::new()
            .with(Arc::new(flag.clone()))
            .with_token(token.clone());
        assert!(!watch.is_cancelled());
        flag.raise();
        assert!(watch.is_cancelled());
        flag.clear();
        token.cancel();
        assert!(watch.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_within_poll_interval() {
        let token = CancellationToken::new();
        let watch = CancelWatch::new().with_token(token.clone());
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let waited = tokio::time::timeout(Duration::from_secs(2), watch.cancelled()).await;
        assert!(waited.is_ok());
    }

    #[test]
    fn cancel_all_reaches_every_entry() {
        let registry = CancelRegistry::new();
        let a = registry.register("a");
        let b = registry.register("b");
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.token().is_cancelled() && b.token().is_cancelled());
    }

    #[tokio::test]
    async fn race_returns_completed_value() {
        let watch = CancelWatch::new();
        let out = race(async { 7 }, &watch).await.unwrap();
        assert!(matches!(out, Raced::Completed(7)));
    }

    #[tokio::test]
    async fn race_aborts_task_on_cancel() {
        let token = CancellationToken::new();
        let watch = CancelWatch::new().with_token(token.clone());
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let out = race(
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                flag.store(true, Ordering::SeqCst);
            },
            &watch,
        )
        .await
        .unwrap();
        assert!(matches!(out, Raced::Cancelled));
        assert!(!finished.load(Ordering::SeqCst));
    }
}
