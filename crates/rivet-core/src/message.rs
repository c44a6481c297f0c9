//! Caller-facing request and response envelopes.
//!
//! These sit one step above the wire commands: a class name that routes to
//! a processor on the receiver, a payload codec, and opaque content bytes.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::{CommandKind, RequestCommand, ResponseCommand};
use crate::connection::Connection;
use crate::error::{RemotingError, StatusCode};
use crate::serialize::PayloadCodec;
use crate::url::Url;

/// A request ready to send: routed by class name, content already
/// serialized.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    class_name: String,
    codec: PayloadCodec,
    header: Bytes,
    content: Bytes,
}

impl RpcRequest {
    /// Build a JSON-encoded request.
    pub fn json<T: Serialize + ?Sized>(
        class_name: impl Into<String>,
        value: &T,
    ) -> Result<Self, RemotingError> {
        let content = PayloadCodec::Json.encode(value)?;
        Ok(Self {
            class_name: class_name.into(),
            codec: PayloadCodec::Json,
            header: Bytes::new(),
            content,
        })
    }

    /// Build a request from caller-framed bytes.
    pub fn raw(class_name: impl Into<String>, content: Bytes) -> Self {
        Self {
            class_name: class_name.into(),
            codec: PayloadCodec::Raw,
            header: Bytes::new(),
            content,
        }
    }

    /// Attach an opaque header section.
    pub fn with_header(mut self, header: Bytes) -> Self {
        self.header = header;
        self
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub(crate) fn into_command(self, kind: CommandKind) -> RequestCommand {
        RequestCommand::new(
            kind,
            self.codec.code(),
            0,
            self.class_name,
            self.header,
            self.content,
        )
    }
}

/// A successful response as seen by callers.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    status: StatusCode,
    codec: u8,
    class_name: String,
    content: Bytes,
}

impl RpcResponse {
    pub(crate) fn from_command(cmd: ResponseCommand) -> Self {
        Self {
            status: cmd.status,
            codec: cmd.codec,
            class_name: cmd.class_name,
            content: cmd.content,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// Decode the content with the codec the response was sent with.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, RemotingError> {
        let codec = PayloadCodec::from_code(self.codec).map_err(RemotingError::from)?;
        Ok(codec.decode(&self.content)?)
    }
}

/// Address overloads accepted by the invoke entry points.
pub enum Target<'a> {
    Addr(&'a str),
    Url(Url),
    Conn(&'a Connection),
}

impl<'a> From<&'a str> for Target<'a> {
    fn from(addr: &'a str) -> Self {
        Target::Addr(addr)
    }
}

impl From<Url> for Target<'_> {
    fn from(url: Url) -> Self {
        Target::Url(url)
    }
}

impl<'a> From<&'a Connection> for Target<'a> {
    fn from(conn: &'a Connection) -> Self {
        Target::Conn(conn)
    }
}
