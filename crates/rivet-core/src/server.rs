//! Server facade.
//!
//! Binds a listener, wraps every accepted socket in a [`Connection`], and
//! dispatches inbound requests to registered processors. With connection
//! management enabled the server can also address its accepted peers by
//! `ip:port` and invoke back over them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpListener;
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
use crate::message::{RpcRequest, RpcResponse, Target};
use crate::processor::{UserProcessor, UserProcessorRegistry};
use crate::url::Url;

struct ServerInner {
    bind_addr: String,
    lifecycle: LifeCycle,
    config: Config,
    processors: Arc<UserProcessorRegistry>,
    listener: Arc<ConnectionEventListener>,
    manage_connections: AtomicBool,
    /// Accepted connections by peer `ip:port`, latest wins.
    connections: Arc<Mutex<HashMap<String, Connection>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

/// The RPC server.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

impl RpcServer {
    /// Listen on all interfaces at `port`. Port 0 asks the OS for a free
    /// port; read it back with [`RpcServer::local_addr`] after startup.
    pub fn new(port: u16) -> Self {
        Self::bind(format!("0.0.0.0:{port}"))
    }

    pub fn bind(addr: impl Into<String>) -> Self {
        Self::with_config(addr, Config::from_env())
    }

    pub fn with_config(addr: impl Into<String>, config: Config) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                bind_addr: addr.into(),
                lifecycle: LifeCycle::new(),
                config,
                processors: Arc::new(UserProcessorRegistry::new()),
                listener: Arc::new(ConnectionEventListener::new()),
                manage_connections: AtomicBool::new(false),
                connections: Arc::new(Mutex::new(HashMap::new())),
                local_addr: Mutex::new(None),
                accept_task: Mutex::new(None),
                event_loop: Mutex::new(None),
            }),
        }
    }

    /// Allow addressing accepted peers by `ip:port` in the invoke APIs.
    pub fn enable_connection_management(&self) {
        self.inner.manage_connections.store(true, Ordering::Relaxed);
    }

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

    /// Bind and start accepting. Resolves once the listener is bound.
    pub async fn startup(&self) -> Result<(), RemotingError> {
        self.inner.lifecycle.startup()?;

        let listener = TcpListener::bind(&self.inner.bind_addr).await?;
        let local = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local);

        let (events, events_rx) = EventBus::channel();
        let ctx = Arc::new(RemotingContext {
            config: self.inner.config.clone(),
            role: Role::Server,
            processors: self.inner.processors.clone(),
            events,
        });

        let book = self.inner.connections.clone();
        let event_handle = spawn_event_loop(events_rx, self.inner.listener.clone(), move |item| {
            match item.event {
                ConnectionEventType::Connect => {
                    if let Some(conn) = &item.connection {
                        book.lock().insert(item.remote.clone(), conn.clone());
                    }
                }
                ConnectionEventType::Close => {
                    let mut book = book.lock();
                    if let Some(existing) = book.get(&item.remote) {
                        let same = item
                            .connection
                            .as_ref()
                            .is_some_and(|c| c.ptr_eq(existing));
                        if same {
                            book.remove(&item.remote);
                        }
                    }
                }
                _ => {}
            }
        });

        let accept_config = self.inner.config.clone();
        let accept_handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let url = Url::from_peer(peer, &accept_config);
                        if let Err(e) = Connection::spawn(stream, url, ctx.clone()) {
                            tracing::warn!(%peer, error = %e, "failed to start accepted connection");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        *self.inner.accept_task.lock() = Some(accept_handle);
        *self.inner.event_loop.lock() = Some(event_handle);
        tracing::info!(addr = %local, "rpc server started");
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Stop accepting and close every live connection. Safe to repeat.
    pub fn shutdown(&self) {
        if !self.inner.lifecycle.shutdown() {
            return;
        }
        if let Some(handle) = self.inner.accept_task.lock().take() {
            handle.abort();
        }
        let conns: Vec<Connection> = self.inner.connections.lock().values().cloned().collect();
        for conn in conns {
            conn.close();
        }
        self.inner.connections.lock().clear();
        if let Some(handle) = self.inner.event_loop.lock().take() {
            handle.abort();
        }
        tracing::info!("rpc server shut down");
    }

    /// Look up an accepted connection by peer `ip:port`. Requires
    /// connection management.
    pub fn connection(&self, addr: &str) -> Option<Connection> {
        if !self.inner.manage_connections.load(Ordering::Relaxed) {
            return None;
        }
        self.inner.connections.lock().get(addr).cloned()
    }

    fn resolve<'a>(&self, target: Target<'a>) -> Result<Connection, RemotingError> {
        self.inner.lifecycle.ensure_started()?;
        match target {
            Target::Conn(conn) => {
                if conn.is_active() {
                    Ok(conn.clone())
                } else {
                    Err(RemotingError::ConnectionClosed)
                }
            }
            Target::Addr(addr) => {
                if !self.inner.manage_connections.load(Ordering::Relaxed) {
                    return Err(RemotingError::Lifecycle(
                        "server connection management is not enabled",
                    ));
                }
                self.inner
                    .connections
                    .lock()
                    .get(addr)
                    .cloned()
                    .filter(Connection::is_active)
                    .ok_or_else(|| RemotingError::NoConnection(addr.to_string()))
            }
            Target::Url(url) => {
                if !self.inner.manage_connections.load(Ordering::Relaxed) {
                    return Err(RemotingError::Lifecycle(
                        "server connection management is not enabled",
                    ));
                }
                let key = url.unique_key();
                self.inner
                    .connections
                    .lock()
                    .get(&key)
                    .cloned()
                    .filter(Connection::is_active)
                    .ok_or(RemotingError::NoConnection(key))
            }
        }
    }

    pub async fn oneway<'a>(
        &self,
        target: impl Into<Target<'a>>,
        request: RpcRequest,
    ) -> Result<(), RemotingError> {
        let conn = self.resolve(target.into())?;
        conn.oneway(request.into_command(CommandKind::Oneway))
    }

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

    pub async fn invoke_with_future<'a>(
        &self,
        target: impl Into<Target<'a>>,
        request: RpcRequest,
        timeout: Duration,
    ) -> Result<InvokeFuture, RemotingError> {
        let conn = self.resolve(target.into())?;
        let future = conn.invoke(
            request.into_command(CommandKind::Request),
            timeout,
            None,
            InvokeContext::new(),
        )?;
        Ok(future.expect("request kind always yields a future"))
    }

    pub async fn invoke_with_callback<'a>(
        &self,
        target: impl Into<Target<'a>>,
        request: RpcRequest,
        callback: Arc<dyn InvokeCallback>,
        timeout: Duration,
    ) -> Result<(), RemotingError> {
        let conn = self.resolve(target.into())?;
        conn.invoke(
            request.into_command(CommandKind::Request),
            timeout,
            Some(callback),
            InvokeContext::new(),
        )?;
        Ok(())
    }
}
