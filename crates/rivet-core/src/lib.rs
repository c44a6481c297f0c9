//! rivet-core: Core runtime for the rivet RPC framework.
//!
//! This crate implements:
//! - The binary wire codec ([`codec`], [`Command`], [`RequestCommand`],
//!   [`ResponseCommand`])
//! - Payload serialization keyed by the wire codec byte ([`PayloadCodec`])
//! - Connections with pending-invoke correlation ([`Connection`],
//!   [`InvokeFuture`], [`InvokeCallback`])
//! - Server-side dispatch to user processors ([`UserProcessor`],
//!   [`AsyncContext`])
//! - Keep-alive heartbeats and idle eviction
//! - Connection pooling and management ([`ConnectionManager`])
//! - Optional background reconnection ([`ReconnectManager`])
//! - The client and server facades ([`RpcClient`], [`RpcServer`])

#![deny(unsafe_code)]

mod client;
pub mod codec;
mod command;
mod config;
mod connection;
mod dispatch;
mod error;
mod events;
mod heartbeat;
mod invoke;
mod lifecycle;
mod manager;
mod message;
mod processor;
mod protocol;
mod reconnect;
mod serialize;
mod server;
mod url;

pub use client::RpcClient;
pub use command::{Command, CommandCode, CommandKind, RequestCommand, ResponseCommand};
pub use config::Config;
pub use connection::{Connection, Role};
pub use error::{CodecError, RemotingError, SerialError, StatusCode};
pub use events::{ConnectionEventListener, ConnectionEventProcessor, ConnectionEventType};
pub use heartbeat::HEARTBEAT_TIMEOUT;
pub use invoke::{InvokeCallback, InvokeContext, InvokeFuture};
pub use lifecycle::LifeCycle;
pub use manager::{ConnectionManager, ConnectionSelectStrategy};
pub use message::{RpcRequest, RpcResponse, Target};
pub use processor::{AsyncContext, ProcessorError, RequestBody, UserProcessor, UserProcessorRegistry};
pub use protocol::{
    Protocol, ProtocolId, ProtocolManager, ProtocolSwitch, PROTOCOL_V1, PROTOCOL_V2,
};
pub use reconnect::{ReconnectManager, RECONNECT_GAP};
pub use serialize::{PayloadCodec, CODEC_JSON, CODEC_RAW};
pub use server::RpcServer;
pub use url::Url;
