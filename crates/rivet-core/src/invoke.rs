//! Pending-invoke bookkeeping: futures, callbacks, timeouts.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::command::ResponseCommand;
use crate::error::{RemotingError, StatusCode};

/// User callback attached to an invocation.
///
/// Invoked exactly once with the completion response, which may be a
/// locally synthesized timeout or connection-closed result. Runs on the
/// async runtime driving the connection.
#[async_trait]
pub trait InvokeCallback: Send + Sync + 'static {
    async fn on_response(&self, response: ResponseCommand);
}

/// Per-call key/value context, visible to callbacks and shared across
/// clones of the same future.
#[derive(Clone, Default)]
pub struct InvokeContext {
    inner: Arc<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>>,
}

impl InvokeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Any + Send + Sync>(&self, key: impl Into<String>, value: T) {
        self.inner.lock().insert(key.into(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.inner
            .lock()
            .get(key)
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for InvokeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeContext")
            .field("len", &self.inner.lock().len())
            .finish()
    }
}

/// One outstanding request.
///
/// Completion takes the oneshot sender out of the mutex; whoever gets it
/// delivers, everyone else observes `false`. That single `take()` is what
/// makes response arrival, the timeout task, the reaper, and connection
/// close race-safe.
pub(crate) struct PendingEntry {
    pub(crate) id: u32,
    tx: Mutex<Option<oneshot::Sender<ResponseCommand>>>,
    callback: Option<Arc<dyn InvokeCallback>>,
    deadline: Instant,
    timeout_task: Mutex<Option<AbortHandle>>,
}

impl PendingEntry {
    pub(crate) fn new(
        id: u32,
        timeout: Duration,
        callback: Option<Arc<dyn InvokeCallback>>,
    ) -> (Arc<Self>, oneshot::Receiver<ResponseCommand>) {
        let (tx, rx) = oneshot::channel();
        let entry = Arc::new(Self {
            id,
            tx: Mutex::new(Some(tx)),
            callback,
            deadline: Instant::now() + timeout,
            timeout_task: Mutex::new(None),
        });
        (entry, rx)
    }

    pub(crate) fn arm_timeout(&self, handle: AbortHandle) {
        let mut slot = self.timeout_task.lock();
        if self.is_completed() {
            handle.abort();
        } else {
            *slot = Some(handle);
        }
    }

    /// Deliver the completion. Returns false if already completed.
    pub(crate) fn complete(&self, response: ResponseCommand) -> bool {
        let Some(tx) = self.tx.lock().take() else {
            return false;
        };
        if let Some(task) = self.timeout_task.lock().take() {
            task.abort();
        }
        if let Some(callback) = &self.callback {
            let callback = callback.clone();
            let response = response.clone();
            tokio::spawn(async move {
                callback.on_response(response).await;
            });
        }
        // The receiver may be gone (caller dropped the future); that is
        // still a completed invoke.
        let _ = tx.send(response);
        true
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.tx.lock().is_none()
    }

    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Completion handle returned to callers that asked for a response.
pub struct InvokeFuture {
    id: u32,
    rx: oneshot::Receiver<ResponseCommand>,
    context: InvokeContext,
}

impl InvokeFuture {
    pub(crate) fn new(
        id: u32,
        rx: oneshot::Receiver<ResponseCommand>,
        context: InvokeContext,
    ) -> Self {
        Self { id, rx, context }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn context(&self) -> &InvokeContext {
        &self.context
    }

    /// Wait for the completion response.
    ///
    /// Always resolves: the per-request timer or connection teardown
    /// completes the entry if the peer never answers. The response status
    /// tells the caller which of the four completion causes fired.
    pub async fn wait(self) -> Result<ResponseCommand, RemotingError> {
        self.rx.await.map_err(|_| RemotingError::ConnectionClosed)
    }

    /// Wait and map any non-success status into [`RemotingError`].
    pub async fn wait_ok(self) -> Result<ResponseCommand, RemotingError> {
        let response = self.wait().await?;
        match response.status {
            StatusCode::Success => Ok(response),
            StatusCode::Timeout => Err(RemotingError::Timeout),
            StatusCode::ConnectionClosed => Err(RemotingError::ConnectionClosed),
            status => Err(RemotingError::Remote {
                status,
                message: response.error_message(),
            }),
        }
    }
}

/// The per-connection pending table.
#[derive(Default)]
pub(crate) struct InvokeRegistry {
    entries: Mutex<HashMap<u32, Arc<PendingEntry>>>,
}

impl InvokeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert a pending entry. Ids are allocated from a per-connection
    /// counter, so a duplicate means the allocator wrapped onto a live
    /// request.
    pub(crate) fn add(&self, entry: Arc<PendingEntry>) {
        let prev = self.entries.lock().insert(entry.id, entry);
        if let Some(prev) = prev {
            debug_assert!(false, "duplicate pending invoke id {}", prev.id);
            tracing::error!(id = prev.id, "duplicate pending invoke id, dropping older entry");
            prev.complete(ResponseCommand::local(prev.id, StatusCode::ConnectionClosed));
        }
    }

    pub(crate) fn remove(&self, id: u32) -> Option<Arc<PendingEntry>> {
        self.entries.lock().remove(&id)
    }

    pub(crate) fn drain(&self) -> Vec<Arc<PendingEntry>> {
        self.entries.lock().drain().map(|(_, e)| e).collect()
    }

    /// Remove and return entries past their deadline. Safety net behind the
    /// per-request timers.
    pub(crate) fn scan_expired(&self, now: Instant) -> Vec<Arc<PendingEntry>> {
        let mut entries = self.entries.lock();
        let expired: Vec<u32> = entries
            .values()
            .filter(|e| now >= e.deadline())
            .map(|e| e.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completion_is_exactly_once() {
        let (entry, rx) = PendingEntry::new(1, Duration::from_secs(5), None);
        assert!(entry.complete(ResponseCommand::local(1, StatusCode::Success)));
        assert!(!entry.complete(ResponseCommand::local(1, StatusCode::Timeout)));
        let got = rx.await.unwrap();
        assert_eq!(got.status, StatusCode::Success);
    }

    #[tokio::test]
    async fn future_wait_ok_maps_statuses() {
        let (entry, rx) = PendingEntry::new(2, Duration::from_secs(5), None);
        entry.complete(ResponseCommand::local(2, StatusCode::Timeout));
        let fut = InvokeFuture::new(2, rx, InvokeContext::new());
        assert!(matches!(fut.wait_ok().await, Err(RemotingError::Timeout)));
    }

    #[tokio::test]
    async fn callback_fires_on_completion() {
        struct Flag(Arc<std::sync::atomic::AtomicBool>);
        #[async_trait]
        impl InvokeCallback for Flag {
            async fn on_response(&self, response: ResponseCommand) {
                assert_eq!(response.status, StatusCode::Success);
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (entry, _rx) =
            PendingEntry::new(3, Duration::from_secs(5), Some(Arc::new(Flag(fired.clone()))));
        entry.complete(ResponseCommand::local(3, StatusCode::Success));
        // The callback runs on a spawned task.
        for _ in 0..50 {
            if fired.load(std::sync::atomic::Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("callback never fired");
    }

    #[tokio::test]
    async fn scan_reaps_only_expired() {
        let registry = InvokeRegistry::new();
        let (fresh, _rx1) =
            PendingEntry::new(1, Duration::from_secs(60), None);
        let (stale, _rx2) = PendingEntry::new(2, Duration::ZERO, None);
        registry.add(fresh);
        registry.add(stale);

        let expired = registry.scan_expired(Instant::now() + Duration::from_millis(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, 2);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn context_round_trips_values() {
        let ctx = InvokeContext::new();
        ctx.put("attempt", 3u32);
        assert_eq!(*ctx.get::<u32>("attempt").unwrap(), 3);
        assert!(ctx.get::<String>("attempt").is_none());
        assert!(ctx.get::<u32>("missing").is_none());
    }
}
