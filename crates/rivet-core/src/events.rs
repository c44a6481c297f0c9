//! Connection lifecycle events.
//!
//! Events are emitted by connections and the connection factory, queued on
//! an unbounded channel, and fanned out on a dedicated event task so user
//! processors never run on the I/O path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::connection::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventType {
    Connect,
    ConnectFailed,
    Close,
    Exception,
    /// A dropped address was restored by the reconnector.
    Reconnect,
}

/// User hook for lifecycle events.
#[async_trait]
pub trait ConnectionEventProcessor: Send + Sync + 'static {
    async fn on_event(
        &self,
        event: ConnectionEventType,
        remote_addr: &str,
        connection: Option<&Connection>,
    );
}

/// One queued event.
#[derive(Clone)]
pub(crate) struct EventItem {
    pub(crate) event: ConnectionEventType,
    pub(crate) remote: String,
    pub(crate) connection: Option<Connection>,
}

/// Emitter handle stored in the shared remoting context.
#[derive(Clone)]
pub(crate) struct EventBus {
    tx: mpsc::UnboundedSender<EventItem>,
}

impl EventBus {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<EventItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(
        &self,
        event: ConnectionEventType,
        remote: String,
        connection: Option<Connection>,
    ) {
        // A dropped receiver just means the facade already shut down.
        let _ = self.tx.send(EventItem {
            event,
            remote,
            connection,
        });
    }
}

/// Registry of user event processors, keyed by event type.
#[derive(Default)]
pub struct ConnectionEventListener {
    processors: RwLock<HashMap<ConnectionEventType, Vec<Arc<dyn ConnectionEventProcessor>>>>,
}

impl ConnectionEventListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        event: ConnectionEventType,
        processor: Arc<dyn ConnectionEventProcessor>,
    ) {
        self.processors
            .write()
            .entry(event)
            .or_default()
            .push(processor);
    }

    pub(crate) fn processors_for(
        &self,
        event: ConnectionEventType,
    ) -> Vec<Arc<dyn ConnectionEventProcessor>> {
        self.processors
            .read()
            .get(&event)
            .cloned()
            .unwrap_or_default()
    }
}

/// Drain the event queue, running internal hooks before user processors.
///
/// The internal hook (pool removal, reconnect scheduling, server bookkeeping)
/// is a plain closure so client and server can wire their own plumbing.
pub(crate) fn spawn_event_loop<F>(
    mut rx: mpsc::UnboundedReceiver<EventItem>,
    listener: Arc<ConnectionEventListener>,
    mut internal: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut(&EventItem) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            internal(&item);
            for processor in listener.processors_for(item.event) {
                let remote = item.remote.clone();
                let connection = item.connection.clone();
                let event = item.event;
                tokio::spawn(async move {
                    processor
                        .on_event(event, &remote, connection.as_ref())
                        .await;
                });
            }
        }
    })
}
