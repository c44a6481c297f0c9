//! RPC-layer commands: requests, responses, heartbeats.

use std::time::Instant;

use bytes::Bytes;

use crate::error::StatusCode;
use crate::serialize::CODEC_RAW;

/// The frame `type` byte: whether a command expects, carries, or skips a
/// response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    Response = 0,
    Request = 1,
    Oneway = 2,
}

impl CommandKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Response),
            1 => Some(Self::Request),
            2 => Some(Self::Oneway),
            _ => None,
        }
    }

    /// True for request kinds that register a pending invoke.
    pub fn expects_response(self) -> bool {
        matches!(self, Self::Request)
    }
}

/// The 16-bit command code identifying the command family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandCode {
    Heartbeat = 0,
    RpcRequest = 1,
    RpcResponse = 2,
}

impl CommandCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Heartbeat),
            1 => Some(Self::RpcRequest),
            2 => Some(Self::RpcResponse),
            _ => None,
        }
    }
}

/// An outbound or inbound request frame. Immutable once queued for send.
#[derive(Debug, Clone)]
pub struct RequestCommand {
    pub id: u32,
    pub code: CommandCode,
    pub kind: CommandKind,
    pub ver2: u8,
    pub codec: u8,
    /// Milliseconds the caller is willing to wait; oneway writes 0.
    pub timeout_ms: i32,
    pub class_name: String,
    pub header: Bytes,
    pub content: Bytes,
    /// Set by the decoder when the frame arrives; not on the wire.
    pub arrive_at: Option<Instant>,
}

impl RequestCommand {
    pub fn new(
        kind: CommandKind,
        codec: u8,
        timeout_ms: i32,
        class_name: String,
        header: Bytes,
        content: Bytes,
    ) -> Self {
        Self {
            id: 0,
            code: CommandCode::RpcRequest,
            kind,
            ver2: 1,
            codec,
            timeout_ms,
            class_name,
            header,
            content,
            arrive_at: None,
        }
    }

    /// A heartbeat probe. Heartbeats ride the normal request plumbing with
    /// an empty envelope.
    pub fn heartbeat() -> Self {
        Self {
            id: 0,
            code: CommandCode::Heartbeat,
            kind: CommandKind::Request,
            ver2: 1,
            codec: CODEC_RAW,
            timeout_ms: 0,
            class_name: String::new(),
            header: Bytes::new(),
            content: Bytes::new(),
            arrive_at: None,
        }
    }
}

/// An outbound or inbound response frame.
#[derive(Debug, Clone)]
pub struct ResponseCommand {
    pub id: u32,
    pub code: CommandCode,
    pub ver2: u8,
    pub codec: u8,
    pub status: StatusCode,
    pub class_name: String,
    pub header: Bytes,
    pub content: Bytes,
}

impl ResponseCommand {
    /// A success response answering request `id`.
    pub fn success(id: u32, ver2: u8, codec: u8, class_name: String, content: Bytes) -> Self {
        Self {
            id,
            code: CommandCode::RpcResponse,
            ver2,
            codec,
            status: StatusCode::Success,
            class_name,
            header: Bytes::new(),
            content,
        }
    }

    /// A failure response; the message rides in the content as raw bytes.
    pub fn failure(id: u32, ver2: u8, status: StatusCode, message: &str) -> Self {
        Self {
            id,
            code: CommandCode::RpcResponse,
            ver2,
            codec: CODEC_RAW,
            status,
            class_name: String::new(),
            header: Bytes::new(),
            content: Bytes::copy_from_slice(message.as_bytes()),
        }
    }

    /// The inline answer to a heartbeat probe.
    pub fn heartbeat_ack(id: u32, ver2: u8) -> Self {
        Self {
            id,
            code: CommandCode::Heartbeat,
            ver2,
            codec: CODEC_RAW,
            status: StatusCode::Success,
            class_name: String::new(),
            header: Bytes::new(),
            content: Bytes::new(),
        }
    }

    /// A locally synthesized completion (timeout, connection closed). Never
    /// put on the wire.
    pub(crate) fn local(id: u32, status: StatusCode) -> Self {
        Self {
            id,
            code: CommandCode::RpcResponse,
            ver2: 1,
            codec: CODEC_RAW,
            status,
            class_name: String::new(),
            header: Bytes::new(),
            content: Bytes::new(),
        }
    }

    /// Best-effort reading of a failure message from the content.
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

/// A decoded frame of either direction.
#[derive(Debug, Clone)]
pub enum Command {
    Request(RequestCommand),
    Response(ResponseCommand),
}

impl Command {
    pub fn id(&self) -> u32 {
        match self {
            Command::Request(r) => r.id,
            Command::Response(r) => r.id,
        }
    }
}
