//! Status codes and error types.

use core::fmt;

/// Wire response status.
///
/// Carried as a 16-bit big-endian value in every response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum StatusCode {
    Success = 0,
    Error = 1,
    ServerException = 2,
    Unknown = 3,
    ServerThreadpoolBusy = 4,
    ErrorComm = 5,
    NoProcessor = 6,
    Timeout = 7,
    ClientSendError = 8,
    CodecException = 9,
    ConnectionClosed = 10,
    ServerSerialException = 11,
    ServerDeserialException = 12,
}

impl StatusCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::Error),
            2 => Some(Self::ServerException),
            3 => Some(Self::Unknown),
            4 => Some(Self::ServerThreadpoolBusy),
            5 => Some(Self::ErrorComm),
            6 => Some(Self::NoProcessor),
            7 => Some(Self::Timeout),
            8 => Some(Self::ClientSendError),
            9 => Some(Self::CodecException),
            10 => Some(Self::ConnectionClosed),
            11 => Some(Self::ServerSerialException),
            12 => Some(Self::ServerDeserialException),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "server error"),
            Self::ServerException => write!(f, "server exception"),
            Self::Unknown => write!(f, "unknown"),
            Self::ServerThreadpoolBusy => write!(f, "server threadpool busy"),
            Self::ErrorComm => write!(f, "communication error"),
            Self::NoProcessor => write!(f, "no processor registered"),
            Self::Timeout => write!(f, "invocation timed out"),
            Self::ClientSendError => write!(f, "client send failed"),
            Self::CodecException => write!(f, "codec exception"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::ServerSerialException => write!(f, "server serialization failed"),
            Self::ServerDeserialException => write!(f, "server deserialization failed"),
        }
    }
}

/// Framing-layer errors.
///
/// Only a CRC mismatch is recoverable at the frame boundary: the frame's
/// length was already known, so the decoder consumes it and the stream
/// continues. Every other variant means framing is lost and the connection
/// must close.
#[derive(Debug)]
pub enum CodecError {
    UnknownProtocol(u8),
    UnknownCommandType(u8),
    UnknownCommandCode(u16),
    /// Trailer check failed on a single, fully-consumed frame.
    CrcMismatch { expected: u32, actual: u32 },
    FrameTooLarge {
        len: usize,
        max: usize,
    },
    BadClassName(std::string::FromUtf8Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownProtocol(code) => write!(f, "unknown protocol code: {code}"),
            Self::UnknownCommandType(byte) => write!(f, "unknown command type byte: {byte}"),
            Self::UnknownCommandCode(code) => write!(f, "unknown command code: {code}"),
            Self::CrcMismatch { expected, actual } => write!(
                f,
                "crc mismatch: expected {expected:#010x}, got {actual:#010x}"
            ),
            Self::FrameTooLarge { len, max } => {
                write!(f, "frame of {len} bytes exceeds max {max}")
            }
            Self::BadClassName(e) => write!(f, "class name is not valid UTF-8: {e}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::BadClassName(e) => Some(e),
            _ => None,
        }
    }
}

/// Payload serialization errors.
#[derive(Debug)]
pub enum SerialError {
    /// The codec byte does not name a registered payload codec.
    UnknownCodec(u8),
    /// The selected codec cannot serialize typed values.
    UnsupportedType(&'static str),
    Json(serde_json::Error),
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownCodec(code) => write!(f, "unknown payload codec byte: {code}"),
            Self::UnsupportedType(what) => write!(f, "payload codec cannot handle {what}"),
            Self::Json(e) => write!(f, "json payload error: {e}"),
        }
    }
}

impl std::error::Error for SerialError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SerialError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

/// Unified error for every invoke API.
///
/// Carries the wire status via [`RemotingError::status`]; callers that need
/// to distinguish further can match on the variant.
#[derive(Debug)]
pub enum RemotingError {
    /// The peer answered with a non-success status.
    Remote { status: StatusCode, message: String },
    /// The local per-request timer fired before a response arrived.
    Timeout,
    /// The connection closed (or was closed) with the request pending.
    ConnectionClosed,
    /// The writer queue is over its watermark; the send was refused.
    Overloaded,
    /// Establishing a TCP connection failed.
    Connect { addr: String, source: std::io::Error },
    /// The address string does not match the `ip:port[?k=v...]` grammar.
    BadAddress(String),
    /// No live connection is available for the given pool key.
    NoConnection(String),
    Codec(CodecError),
    Serialization(SerialError),
    /// A processor with the same interest is already registered.
    DuplicateProcessor(String),
    /// Startup/shutdown called in the wrong state.
    Lifecycle(&'static str),
    Io(std::io::Error),
}

impl RemotingError {
    /// The wire status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Remote { status, .. } => *status,
            Self::Timeout => StatusCode::Timeout,
            Self::ConnectionClosed => StatusCode::ConnectionClosed,
            Self::Overloaded | Self::Io(_) => StatusCode::ClientSendError,
            Self::Codec(_) => StatusCode::CodecException,
            Self::Serialization(_) => StatusCode::ClientSendError,
            _ => StatusCode::Unknown,
        }
    }
}

impl fmt::Display for RemotingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote { status, message } if message.is_empty() => {
                write!(f, "remote error: {status}")
            }
            Self::Remote { status, message } => write!(f, "remote error: {status}: {message}"),
            Self::Timeout => write!(f, "invocation timed out"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Overloaded => write!(f, "writer queue over watermark, send refused"),
            Self::Connect { addr, source } => write!(f, "connect to {addr} failed: {source}"),
            Self::BadAddress(addr) => write!(f, "malformed address: {addr}"),
            Self::NoConnection(key) => write!(f, "no live connection for {key}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::DuplicateProcessor(name) => {
                write!(f, "processor already registered for {name}")
            }
            Self::Lifecycle(msg) => write!(f, "lifecycle error: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for RemotingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect { source, .. } => Some(source),
            Self::Codec(e) => Some(e),
            Self::Serialization(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for RemotingError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<SerialError> for RemotingError {
    fn from(e: SerialError) -> Self {
        Self::Serialization(e)
    }
}

impl From<std::io::Error> for RemotingError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
