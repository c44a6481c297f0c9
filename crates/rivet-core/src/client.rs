//! Client facade.
//!
//! Owns the connection manager, the background scanner, the optional
//! reconnector, and the event loop. All four invoke styles reduce to
//! [`Connection::invoke`] on a managed connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::command::CommandKind;
use crate::config::Config;
use crate::connection::{Connection, RemotingContext, Role};
use crate::error::RemotingError;
use crate::events::{
    spawn_event_loop, ConnectionEventListener, ConnectionEventProcessor, ConnectionEventType,
    EventBus,
};
use crate::invoke::{InvokeCallback, InvokeContext, InvokeFuture};
use crate::lifecycle::LifeCycle;
use crate::manager::ConnectionManager;
use crate::message::{RpcRequest, RpcResponse, Target};
use crate::processor::{UserProcessor, UserProcessorRegistry};
use crate::reconnect::ReconnectManager;
use crate::url::Url;

struct ClientInner {
    lifecycle: LifeCycle,
    config: Config,
    processors: Arc<UserProcessorRegistry>,
    listener: Arc<ConnectionEventListener>,
    reconnect_enabled: AtomicBool,
    manager: Mutex<Option<ConnectionManager>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// The RPC client. Create, register processors, `startup()`, invoke.
///
/// Must be started and used from within a Tokio runtime: connections,
/// timers, and event dispatch all spawn onto the ambient runtime.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new() -> Self {
        Self::with_config(Config::from_env())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                lifecycle: LifeCycle::new(),
                config,
                processors: Arc::new(UserProcessorRegistry::new()),
                listener: Arc::new(ConnectionEventListener::new()),
                reconnect_enabled: AtomicBool::new(false),
                manager: Mutex::new(None),
                event_loop: Mutex::new(None),
            }),
        }
    }

    /// Switch on background reconnection of dropped addresses. Takes
    /// effect at startup.
    pub fn enable_reconnect(&self) {
        self.inner.reconnect_enabled.store(true, Ordering::Relaxed);
    }

    /// Register a processor for requests the *server side of this client's
    /// connections* sends back (bidirectional RPC).
    pub fn register_processor(
        &self,
        processor: Arc<dyn UserProcessor>,
    ) -> Result<(), RemotingError> {
        self.inner.processors.register(processor)
    }

    pub fn register_default_processor(&self, processor: Arc<dyn UserProcessor>) {
        self.inner.processors.register_default(processor)
    }

    pub fn register_event_processor(
        &self,
        event: ConnectionEventType,
        processor: Arc<dyn ConnectionEventProcessor>,
    ) {
        self.inner.listener.register(event, processor)
    }

    /// Start background machinery. Fails if called twice without an
    /// intervening shutdown, or after shutdown.
    pub fn startup(&self) -> Result<(), RemotingError> {
        self.inner.lifecycle.startup()?;

        let (events, events_rx) = EventBus::channel();
        let ctx = Arc::new(RemotingContext {
            config: self.inner.config.clone(),
            role: Role::Client,
            processors: self.inner.processors.clone(),
            events,
        });
        let manager = ConnectionManager::new(ctx);
        if self.inner.reconnect_enabled.load(Ordering::Relaxed) {
            manager.attach_reconnector(ReconnectManager::new(manager.clone()));
        }
        manager.start_scanner();

        let hook_manager = manager.clone();
        let handle = spawn_event_loop(events_rx, self.inner.listener.clone(), move |item| {
            if item.event == ConnectionEventType::Close {
                if let Some(conn) = &item.connection {
                    hook_manager.on_connection_closed(conn);
                }
            }
        });

        *self.inner.manager.lock() = Some(manager);
        *self.inner.event_loop.lock() = Some(handle);
        tracing::info!("rpc client started");
        Ok(())
    }

    /// Close every connection and stop background work. Safe to call
    /// repeatedly; the client is unusable afterwards.
    pub fn shutdown(&self) {
        if !self.inner.lifecycle.shutdown() {
            return;
        }
        if let Some(manager) = self.inner.manager.lock().take() {
            manager.shutdown();
        }
        if let Some(handle) = self.inner.event_loop.lock().take() {
            handle.abort();
        }
        tracing::info!("rpc client shut down");
    }

    fn manager(&self) -> Result<ConnectionManager, RemotingError> {
        self.inner.lifecycle.ensure_started()?;
        self.inner
            .manager
            .lock()
            .clone()
            .ok_or(RemotingError::Lifecycle("instance is not started"))
    }

    /// The connection manager, for pool-level operations.
    pub fn connection_manager(&self) -> Result<ConnectionManager, RemotingError> {
        self.manager()
    }

    /// Close the pool for `addr` and disable its reconnection.
    pub fn close_connection(&self, addr: &str) -> Result<(), RemotingError> {
        let url = Url::parse(addr, &self.inner.config)?;
        self.manager()?.remove(&url.unique_key());
        Ok(())
    }

    async fn resolve<'a>(&self, target: Target<'a>) -> Result<Connection, RemotingError> {
        let manager = self.manager()?;
        match target {
            Target::Addr(addr) => {
                let url = Url::parse(addr, &self.inner.config)?;
                manager.get_and_create_if_absent(&url).await
            }
            Target::Url(url) => manager.get_and_create_if_absent(&url).await,
            Target::Conn(conn) => {
                manager.check(conn)?;
                Ok(conn.clone())
            }
        }
    }

    /// Send without expecting a response.
    pub async fn oneway<'a>(
        &self,
        target: impl Into<Target<'a>>,
        request: RpcRequest,
    ) -> Result<(), RemotingError> {
        let conn = self.resolve(target.into()).await?;
        conn.oneway(request.into_command(CommandKind::Oneway))
    }

    /// Send and block the caller (asynchronously) until the response,
    /// timeout, or connection teardown.
    pub async fn invoke_sync<'a>(
        &self,
        target: impl Into<Target<'a>>,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<RpcResponse, RemotingError> {
        let future = self.invoke_with_future(target, request, timeout).await?;
        let response = future.wait_ok().await?;
        Ok(RpcResponse::from_command(response))
    }

    /// Send and hand the completion future to the caller.
    pub async fn invoke_with_future<'a>(
        &self,
        target: impl Into<Target<'a>>,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<InvokeFuture, RemotingError> {
        let conn = self.resolve(target.into()).await?;
        let future = conn.invoke(
            request.into_command(CommandKind::Request),
            timeout,
            None,
            InvokeContext::new(),
        )?;
        Ok(future.expect("request kind always yields a future"))
    }

    /// Send and have `callback` invoked at completion.
    pub async fn invoke_with_callback<'a>(
        &self,
        target: impl Into<Target<'a>>,
        request: RpcRequest,
        callback: Arc<dyn InvokeCallback>,
        timeout: Duration,
    ) -> Result<(), RemotingError> {
        let conn = self.resolve(target.into()).await?;
        conn.invoke(
            request.into_command(CommandKind::Request),
            timeout,
            Some(callback),
            InvokeContext::new(),
        )?;
        Ok(())
    }
}

impl Default for RpcClient {
    fn default() -> Self {
        Self::new()
    }
}
