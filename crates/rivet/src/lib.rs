//! rivet: a bidirectional RPC framework over TCP.
//!
//! Persistent multiplexed connections, request/response correlation with
//! timeouts, keep-alive heartbeats, connection pooling, and user-level
//! processors routed by class name.
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use rivet::{RpcClient, RpcServer, RpcRequest};
//!
//! // Server: bind, register a processor, start.
//! let server = RpcServer::new(12200);
//! server.register_processor(Arc::new(MyProcessor))?;
//! server.startup().await?;
//!
//! // Client: start, invoke.
//! let client = RpcClient::new();
//! client.startup()?;
//! let resp = client
//!     .invoke_sync(
//!         "127.0.0.1:12200",
//!         RpcRequest::json("Ping", "hi")?,
//!         Duration::from_secs(1),
//!     )
//!     .await?;
//! let body: String = resp.decode()?;
//! ```
//!
//! # Invoke styles
//!
//! All four styles ride one primitive (a registered pending invoke plus a
//! queued frame):
//!
//! - [`RpcClient::oneway`]: fire and forget, no response expected
//! - [`RpcClient::invoke_sync`]: await the response inline
//! - [`RpcClient::invoke_with_future`]: hold an [`InvokeFuture`]
//! - [`RpcClient::invoke_with_callback`]: completion dispatched to an
//!   [`InvokeCallback`]
//!
//! Targets can be an address string, a parsed [`Url`], or a live
//! [`Connection`]; the connection form is the only one a server can use
//! unless connection management is enabled.

#![deny(unsafe_code)]

pub use rivet_core::{
    codec, Command, CommandCode, CommandKind, CodecError, Config, Connection,
    ConnectionEventListener, ConnectionEventProcessor, ConnectionEventType, ConnectionManager,
    ConnectionSelectStrategy, AsyncContext, InvokeCallback, InvokeContext, InvokeFuture, LifeCycle,
    PayloadCodec, ProcessorError, Protocol, ProtocolId, ProtocolManager, ProtocolSwitch,
    ReconnectManager, RemotingError, RequestBody, RequestCommand, ResponseCommand, Role,
    RpcClient, RpcRequest, RpcResponse, RpcServer, SerialError, StatusCode, Target, Url,
    UserProcessor, UserProcessorRegistry, CODEC_JSON, CODEC_RAW, HEARTBEAT_TIMEOUT, PROTOCOL_V1,
    PROTOCOL_V2, RECONNECT_GAP,
};

/// Convenient imports for application code.
pub mod prelude {
    pub use rivet_core::{
        AsyncContext, InvokeCallback, ProcessorError, RemotingError, RequestBody, RpcClient,
        RpcRequest, RpcResponse, RpcServer, StatusCode, UserProcessor,
    };
}
