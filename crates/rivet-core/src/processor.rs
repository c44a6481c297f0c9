//! User-level request processors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::{CommandKind, RequestCommand, ResponseCommand};
use crate::connection::Connection;
use crate::error::{RemotingError, SerialError, StatusCode};
use crate::serialize::PayloadCodec;

/// Error surfaced by a user processor, carrying the wire status the
/// dispatcher should answer with.
#[derive(Debug)]
pub struct ProcessorError {
    pub status: StatusCode,
    pub message: String,
}

impl ProcessorError {
    pub fn server_error(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::ServerException,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.message)
    }
}

impl std::error::Error for ProcessorError {}

impl From<SerialError> for ProcessorError {
    fn from(e: SerialError) -> Self {
        let status = match e {
            SerialError::UnknownCodec(_) => StatusCode::ServerDeserialException,
            _ => StatusCode::ServerSerialException,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

/// The request as a processor sees it: routed by class name, content still
/// opaque until the processor decodes it.
#[derive(Debug, Clone)]
pub struct RequestBody {
    class_name: String,
    header: Bytes,
    content: Bytes,
    codec: u8,
}

impl RequestBody {
    pub(crate) fn from_command(cmd: &RequestCommand) -> Self {
        Self {
            class_name: cmd.class_name.clone(),
            header: cmd.header.clone(),
            content: cmd.content.clone(),
            codec: cmd.codec,
        }
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn header(&self) -> &Bytes {
        &self.header
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn codec(&self) -> u8 {
        self.codec
    }

    /// Decode the content with the codec the request was sent with.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProcessorError> {
        let codec = PayloadCodec::from_code(self.codec)?;
        Ok(codec.decode(&self.content)?)
    }
}

/// Response channel handed to a processor.
///
/// Cloneable; a processor may move it into another task and answer later.
/// Exactly one response is written per request: extra sends are dropped
/// with a warning, and sends on oneway requests are silent no-ops.
#[derive(Clone)]
pub struct AsyncContext {
    inner: Arc<AsyncContextInner>,
}

struct AsyncContextInner {
    conn: Connection,
    request_id: u32,
    kind: CommandKind,
    ver2: u8,
    codec: u8,
    class_name: String,
    arrive_at: Instant,
    timeout_ms: i32,
    responded: AtomicBool,
}

impl AsyncContext {
    pub(crate) fn new(conn: Connection, cmd: &RequestCommand) -> Self {
        Self {
            inner: Arc::new(AsyncContextInner {
                conn,
                request_id: cmd.id,
                kind: cmd.kind,
                ver2: cmd.ver2,
                codec: cmd.codec,
                class_name: cmd.class_name.clone(),
                arrive_at: cmd.arrive_at.unwrap_or_else(Instant::now),
                timeout_ms: cmd.timeout_ms,
                responded: AtomicBool::new(false),
            }),
        }
    }

    pub fn request_id(&self) -> u32 {
        self.inner.request_id
    }

    pub fn is_oneway(&self) -> bool {
        self.inner.kind == CommandKind::Oneway
    }

    /// When the request frame arrived on the reader.
    pub fn arrive_at(&self) -> Instant {
        self.inner.arrive_at
    }

    /// The caller's declared timeout budget in milliseconds.
    pub fn timeout_ms(&self) -> i32 {
        self.inner.timeout_ms
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    /// Serialize `value` with the request's codec and answer with status
    /// `SUCCESS`.
    pub fn send_response<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), RemotingError> {
        let codec = PayloadCodec::from_code(self.inner.codec).map_err(RemotingError::from)?;
        let content = codec.encode(value)?;
        self.send_raw_response(content)
    }

    /// Answer with pre-serialized content bytes.
    pub fn send_raw_response(&self, content: Bytes) -> Result<(), RemotingError> {
        self.send(ResponseCommand::success(
            self.inner.request_id,
            self.inner.ver2,
            self.inner.codec,
            self.inner.class_name.clone(),
            content,
        ))
    }

    /// Answer with a failure status.
    pub fn send_error(&self, status: StatusCode, message: &str) -> Result<(), RemotingError> {
        self.send(ResponseCommand::failure(
            self.inner.request_id,
            self.inner.ver2,
            status,
            message,
        ))
    }

    fn send(&self, response: ResponseCommand) -> Result<(), RemotingError> {
        if self.is_oneway() {
            tracing::debug!(
                id = self.inner.request_id,
                class = %self.inner.class_name,
                "dropping response to oneway request"
            );
            return Ok(());
        }
        if self.inner.responded.swap(true, Ordering::SeqCst) {
            tracing::warn!(
                id = self.inner.request_id,
                class = %self.inner.class_name,
                "request already answered, dropping extra response"
            );
            return Ok(());
        }
        self.inner.conn.post_response(response)
    }

    pub(crate) fn responded(&self) -> bool {
        self.inner.responded.load(Ordering::SeqCst)
    }
}

/// A user-provided handler bound to one or more class names.
#[async_trait]
pub trait UserProcessor: Send + Sync + 'static {
    /// Class names this processor answers for.
    fn interest(&self) -> Vec<String>;

    /// Optional dedicated executor. Defaults to the runtime driving the
    /// connection.
    fn executor(&self) -> Option<tokio::runtime::Handle> {
        None
    }

    /// Handle one request. Respond through `ctx` (possibly from another
    /// task after this returns); a returned error is mapped onto a failure
    /// response if nothing was sent yet.
    async fn handle_request(
        &self,
        ctx: AsyncContext,
        request: RequestBody,
    ) -> Result<(), ProcessorError>;
}

/// Class-name keyed processor table, populated before startup.
#[derive(Default)]
pub struct UserProcessorRegistry {
    by_class: RwLock<HashMap<String, Arc<dyn UserProcessor>>>,
    default: RwLock<Option<Arc<dyn UserProcessor>>>,
}

impl UserProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor for every class name it declares. Duplicate
    /// registration for a class is rejected.
    pub fn register(&self, processor: Arc<dyn UserProcessor>) -> Result<(), RemotingError> {
        let interests = processor.interest();
        let mut map = self.by_class.write();
        for class in &interests {
            if map.contains_key(class) {
                return Err(RemotingError::DuplicateProcessor(class.clone()));
            }
        }
        for class in interests {
            map.insert(class, processor.clone());
        }
        Ok(())
    }

    /// Register the fallback used when no class-specific processor matches.
    pub fn register_default(&self, processor: Arc<dyn UserProcessor>) {
        *self.default.write() = Some(processor);
    }

    pub fn resolve(&self, class_name: &str) -> Option<Arc<dyn UserProcessor>> {
        if let Some(p) = self.by_class.read().get(class_name) {
            return Some(p.clone());
        }
        self.default.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop(&'static str);

    #[async_trait]
    impl UserProcessor for Nop {
        fn interest(&self) -> Vec<String> {
            vec![self.0.to_string()]
        }

        async fn handle_request(
            &self,
            _ctx: AsyncContext,
            _request: RequestBody,
        ) -> Result<(), ProcessorError> {
            Ok(())
        }
    }

    #[test]
    fn duplicate_interest_is_rejected() {
        let registry = UserProcessorRegistry::new();
        registry.register(Arc::new(Nop("Ping"))).unwrap();
        let err = registry.register(Arc::new(Nop("Ping"))).unwrap_err();
        assert!(matches!(err, RemotingError::DuplicateProcessor(c) if c == "Ping"));
    }

    #[test]
    fn default_processor_catches_unmatched() {
        let registry = UserProcessorRegistry::new();
        registry.register(Arc::new(Nop("Ping"))).unwrap();
        assert!(registry.resolve("Other").is_none());
        registry.register_default(Arc::new(Nop("*")));
        assert!(registry.resolve("Other").is_some());
        assert!(registry.resolve("Ping").is_some());
    }
}
