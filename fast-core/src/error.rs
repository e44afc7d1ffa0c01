use std::error::Error;
use std::fmt;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Convenience type alias used throughout the crate.
pub type FastResult<T> = std::result::Result<T, FastError>;

/// Wire-level fault categories. Each maps to the `fastReason` string
/// carried in a protocol error's structured info.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastReason {
    UnsupportedVersion,
    UnsupportedType,
    UnsupportedStatus,
    InvalidMsgid,
    BadCrc,
    InvalidJson,
    BadData,
    BadDataD,
    BadError,
    IncompleteMessage,
    UnknownMsgid,
    BadMethod,
}

impl FastReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FastReason::UnsupportedVersion => "unsupported_version",
            FastReason::UnsupportedType => "unsupported_type",
            FastReason::UnsupportedStatus => "unsupported_status",
            FastReason::InvalidMsgid => "invalid_msgid",
            FastReason::BadCrc => "bad_crc",
            FastReason::InvalidJson => "invalid_json",
            FastReason::BadData => "bad_data",
            FastReason::BadDataD => "bad_data_d",
            FastReason::BadError => "bad_error",
            FastReason::IncompleteMessage => "incomplete_message",
            FastReason::UnknownMsgid => "unknown_msgid",
            FastReason::BadMethod => "bad_method",
        }
    }
}

impl fmt::Display for FastReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A violation of the wire protocol. Protocol errors are terminal for the
/// connection they occur on: once the framing is untrustworthy, nothing
/// later on the stream can be interpreted.
#[derive(Debug, Clone)]
pub struct FastProtocolError {
    pub reason: FastReason,
    pub message: String,
}

impl FastProtocolError {
    pub fn new(reason: FastReason, message: impl Into<String>) -> Self {
        FastProtocolError {
            reason,
            message: message.into(),
        }
    }
}

impl fmt::Display for FastProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for FastProtocolError {}

/// The failure a handler reports through `fail()`, and the same shape as
/// reconstructed on the client from an inbound ERROR message.
///
/// Exactly these properties travel on the wire; anything else a handler's
/// error type knows is not transmitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerError {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ase_errors: Option<Value>,
}

impl HandlerError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError {
            name: name.into(),
            message: message.into(),
            info: None,
            context: None,
            ase_errors: None,
        }
    }

    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// The JSON object sent as the `d` field of an ERROR message.
    pub fn wire_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| {
            json!({ "name": self.name, "message": self.message })
        })
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl Error for HandlerError {}

/// A request failed because the server's handler reported an error. The
/// original server-supplied error is the `source()` of this one.
#[derive(Debug, Clone)]
pub struct FastServerError {
    pub cause: HandlerError,
}

impl fmt::Display for FastServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error: {}", self.cause.message)
    }
}

impl Error for FastServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&self.cause)
    }
}

/// The client-facing wrapper for any per-request failure. Carries enough
/// identity (msgid, method) to attribute the failure, and chains to the
/// underlying cause, which is shared when one connection-level fault fans
/// out to many requests.
#[derive(Debug, Clone)]
pub struct FastRequestError {
    pub msgid: u32,
    pub method: String,
    pub cause: Arc<FastError>,
}

impl fmt::Display for FastRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request failed: {}", self.cause)
    }
}

impl Error for FastRequestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// All error types produced by the Fast core.
#[derive(Debug)]
pub enum FastError {
    /// A wire protocol violation; terminal for the connection.
    Protocol(FastProtocolError),

    /// The underlying byte transport failed; terminal for the connection.
    Transport(io::Error),

    /// The server's handler reported a failure; terminal for one request.
    Server(FastServerError),

    /// Client-facing wrapper for a failed request.
    Request(FastRequestError),

    /// The server has no handler registered under the requested name.
    BadMethod { method: String },

    /// A buffering RPC call received more values than its caller allowed.
    BufferOverflow { max_objects: usize },

    /// An invalid argument was provided. These are programmer errors,
    /// raised synchronously, and not expected to be caught.
    InvalidArgument(String),

    /// The client was explicitly detached from its transport.
    Detached,

    /// The connection was closed before the operation completed.
    ConnectionClosed,
}

impl FastError {
    pub fn protocol(reason: FastReason, message: impl Into<String>) -> Self {
        FastError::Protocol(FastProtocolError::new(reason, message))
    }

    /// The category name callers match on, mirroring the wire-level error
    /// naming.
    pub fn name(&self) -> &'static str {
        match self {
            FastError::Protocol(_) => "FastProtocolError",
            FastError::Transport(_) => "FastTransportError",
            FastError::Server(_) => "FastServerError",
            FastError::Request(_) => "FastRequestError",
            FastError::BadMethod { .. } | FastError::BufferOverflow { .. } => "FastError",
            FastError::InvalidArgument(_) => "InvalidArgumentError",
            FastError::Detached | FastError::ConnectionClosed => "FastError",
        }
    }

    /// Structured information about the failure: the protocol `fastReason`
    /// where there is one, and for request errors the request attribution
    /// (`rpcMsgid`, `rpcMethod`) merged with whatever info the underlying
    /// cause supplies, so callers see the handler-supplied info without
    /// walking the `source()` chain.
    pub fn info(&self) -> Value {
        match self {
            FastError::Protocol(e) => json!({ "fastReason": e.reason.as_str() }),
            FastError::Request(e) => {
                let mut info = match e.cause.info() {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                info.insert("rpcMsgid".into(), json!(e.msgid));
                info.insert("rpcMethod".into(), json!(e.method));
                Value::Object(info)
            }
            FastError::Server(e) => e.cause.info.clone().unwrap_or_else(|| json!({})),
            FastError::BadMethod { method } => json!({
                "fastReason": FastReason::BadMethod.as_str(),
                "rpcMethod": method,
            }),
            _ => json!({}),
        }
    }
}

impl fmt::Display for FastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FastError::Protocol(e) => write!(f, "protocol error: {e}"),
            FastError::Transport(e) => write!(f, "transport error: {e}"),
            FastError::Server(e) => write!(f, "{e}"),
            FastError::Request(e) => write!(f, "{e}"),
            FastError::BadMethod { method } => {
                write!(f, "unsupported RPC method: \"{method}\"")
            }
            FastError::BufferOverflow { max_objects } => {
                write!(f, "server returned more than {max_objects} data objects")
            }
            FastError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            FastError::Detached => write!(f, "client detached from transport"),
            FastError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl Error for FastError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            FastError::Protocol(e) => Some(e),
            FastError::Transport(e) => Some(e),
            FastError::Server(e) => Some(&e.cause),
            FastError::Request(e) => Some(e.cause.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for FastError {
    fn from(e: io::Error) -> Self {
        FastError::Transport(e)
    }
}
