//! Error types surfaced by sessions and peers.
//!
//! `RpcError` is the only error a caller of [`Session`](crate::Session) ever sees.
//! `SerializedError` is the wire form used when a failure has to cross the
//! channel boundary in either direction.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport-stable error: survives the channel boundary with its name intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl SerializedError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            data: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Capture a local error. The name is the error's type name without its
    /// module path; the source chain is flattened into `stack`.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let full = std::any::type_name::<E>();
        let name = full.rsplit("::").next().unwrap_or(full);

        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(format!("caused by: {cause}"));
            source = cause.source();
        }

        let mut serialized = Self::new(name, err.to_string());
        if !chain.is_empty() {
            serialized.stack = Some(chain.join("\n"));
        }
        serialized
    }

    pub fn to_value(&self) -> Value {
        let mut value = serde_json::json!({
            "name": self.name,
            "message": self.message,
        });
        if let Some(ref stack) = self.stack {
            value["stack"] = Value::String(stack.clone());
        }
        if let Some(ref data) = self.data {
            value["data"] = data.clone();
        }
        value
    }

    /// Lenient decode: peers that only report a bare string still produce a
    /// usable error.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(message) => Some(Self::new("Error", message.clone())),
            Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for SerializedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for SerializedError {}

/// Every failure mode of a request/response exchange.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// No terminal response arrived before the deadline.
    #[error("{action} timed out after {}ms", .timeout.as_millis())]
    Timeout { action: String, timeout: Duration },

    /// Channel closed or never established.
    #[error("disconnected")]
    Disconnected,

    /// Handshake reported a protocol version we do not speak.
    #[error("unsupported version {reported} (supported: {supported})")]
    UnsupportedVersion { reported: u32, supported: u32 },

    /// The peer explicitly failed the request.
    #[error("remote error: {0}")]
    Remote(SerializedError),

    /// A message did not match any known shape.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RpcError {
    pub fn timeout(action: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            action: action.into(),
            timeout,
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Local failures never required the peer's cooperation.
    pub fn is_local(&self) -> bool {
        !matches!(self, Self::Remote(_))
    }
}

impl From<RpcError> for SerializedError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Remote(remote) => remote,
            RpcError::Timeout { .. } => SerializedError::new("TimeoutError", err.to_string()),
            RpcError::Disconnected => SerializedError::new("DisconnectedError", err.to_string()),
            RpcError::UnsupportedVersion { .. } => {
                SerializedError::new("UnsupportedVersionError", err.to_string())
            }
            RpcError::Protocol(_) => SerializedError::new("ProtocolError", err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
