//! Background restoration of dropped addresses.
//!
//! When enabled, close events enqueue the connection's URL here. A single
//! worker drains the queue with a fixed gap between attempts; addresses in
//! the disabled set (closed on purpose) are skipped, and each URL has at
//! most one attempt in flight.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::manager::ConnectionManager;
use crate::url::Url;

/// Gap between reconnect attempts.
pub const RECONNECT_GAP: Duration = Duration::from_secs(1);

struct ReconnectInner {
    tx: mpsc::UnboundedSender<Url>,
    disabled: Mutex<HashSet<String>>,
    in_flight: Mutex<HashSet<String>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct ReconnectManager {
    inner: Arc<ReconnectInner>,
}

impl ReconnectManager {
    pub(crate) fn new(manager: ConnectionManager) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Url>();
        let inner = Arc::new(ReconnectInner {
            tx,
            disabled: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            worker: Mutex::new(None),
        });

        let worker_inner = inner.clone();
        let handle = tokio::spawn(async move {
            while let Some(url) = rx.recv().await {
                let key = url.unique_key();
                if worker_inner.disabled.lock().contains(&key) {
                    tracing::debug!(%key, "address disabled, skipping reconnect");
                    continue;
                }
                if !worker_inner.in_flight.lock().insert(key.clone()) {
                    continue;
                }
                tokio::time::sleep(RECONNECT_GAP).await;
                match manager.get_and_create_if_absent(&url).await {
                    Ok(conn) => {
                        tracing::info!(%key, "reconnected");
                        manager.context().events.emit(
                            crate::events::ConnectionEventType::Reconnect,
                            key.clone(),
                            Some(conn),
                        );
                    }
                    Err(e) => {
                        tracing::warn!(%key, error = %e, "reconnect attempt failed");
                        // Try again on the next cycle unless disabled since.
                        if !worker_inner.disabled.lock().contains(&key) {
                            let _ = worker_inner.tx.send(url);
                        }
                    }
                }
                worker_inner.in_flight.lock().remove(&key);
            }
        });
        *inner.worker.lock() = Some(handle);

        Self { inner }
    }

    /// Queue an async reconnect for `url`.
    pub fn schedule(&self, url: Url) {
        let _ = self.inner.tx.send(url);
    }

    /// Stop restoring `key`; used when an address is closed on purpose.
    pub fn disable(&self, key: &str) {
        self.inner.disabled.lock().insert(key.to_string());
    }

    /// Allow restoration of `key` again.
    pub fn enable(&self, key: &str) {
        self.inner.disabled.lock().remove(key);
    }

    pub(crate) fn shutdown(&self) {
        if let Some(handle) = self.inner.worker.lock().take() {
            handle.abort();
        }
    }
}
