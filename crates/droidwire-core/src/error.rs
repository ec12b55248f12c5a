//! Error types shared by every layer of the client.
//!
//! [`DeviceError`] unifies selector misuse, transport failures and errors
//! reported by the on-device agent, so callers can handle all of them through
//! a single `Result` type. Agent-reported JSON-RPC failures keep their raw
//! code, message and data inside [`RpcError`].

use std::fmt;

use serde_json::Value;
use thiserror::Error;

/// JSON-RPC code used by the agent for "client error" (also used for
/// element-not-found failures raised by mandatory waits).
pub const CLIENT_ERROR_CODE: i64 = -32002;

/// Human-readable category of a JSON-RPC error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Parse,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
    JsonRpc,
    Client,
    Server,
    Unknown,
}

impl ErrorCategory {
    /// Maps a JSON-RPC error code to its category.
    pub fn from_code(code: i64) -> Self {
        match code {
            -32700 => Self::Parse,
            -32600 => Self::InvalidRequest,
            -32601 => Self::MethodNotFound,
            -32602 => Self::InvalidParams,
            -32603 => Self::Internal,
            -32001 => Self::JsonRpc,
            -32002 => Self::Client,
            -32099..=-32000 => Self::Server,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "Parse error",
            Self::InvalidRequest => "Invalid Request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::Internal => "Internal error",
            Self::JsonRpc => "Jsonrpc error",
            Self::Client => "Client error",
            Self::Server => "Server error",
            Self::Unknown => "Unknown error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error reported by the agent in a JSON-RPC `error` member.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Value,
    /// The remote method that failed, when known.
    pub method: Option<String>,
}

impl RpcError {
    /// Builds an error from the raw `error` object of a JSON-RPC response.
    pub fn from_json(error: &Value, method: impl Into<String>) -> Self {
        Self {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            data: error.get("data").cloned().unwrap_or(Value::Null),
            method: Some(method.into()),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from_code(self.code)
    }

    /// Java exception type name the agent attaches to `data`, if any.
    pub fn exception_name(&self) -> Option<&str> {
        self.data.get("exceptionTypeName").and_then(Value::as_str)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = match &self.data {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        write!(
            f,
            "{} {}: <{}> data: {}, method: {}",
            self.code,
            self.category(),
            self.message,
            data,
            self.method.as_deref().unwrap_or("-"),
        )
    }
}

impl std::error::Error for RpcError {}

/// Errors that can occur while driving a device.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// A selector key outside the fixed attribute set was assigned.
    #[error("{0} is not allowed as a selector field")]
    InvalidField(String),

    /// A selector field was assigned a value of the wrong kind.
    #[error("selector field {field} expects a {expected} value")]
    InvalidValue {
        field: &'static str,
        expected: &'static str,
    },

    /// The transport timed out before the agent answered.
    #[error("RPC call timed out")]
    RpcTimeout,

    /// The agent rejected the call.
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// A mandatory wait for an element failed.
    #[error("element not found: {0}")]
    ElementNotFound(RpcError),

    /// An XPath selector matched nothing where a match was required.
    #[error("no element matched {0}")]
    NoMatch(String),

    /// `get_last_match` was called before any hierarchy was evaluated.
    #[error("no hierarchy has been matched yet")]
    NoLastSource,

    /// An XPath expression could not be parsed or evaluated.
    #[error("XPath error: {0}")]
    XPath(String),

    /// The hierarchy dump was not well-formed XML.
    #[error("hierarchy parse error: {0}")]
    Hierarchy(String),

    /// The agent returned an empty hierarchy dump.
    #[error("dump hierarchy is empty")]
    EmptyHierarchy,

    /// `call` was invoked on a watch context with no pending `when` criteria.
    #[error("when() must be called before registering a watch callback")]
    EmptyWatchRule,

    /// The watch context has been closed and cannot be restarted.
    #[error("watch context is closed")]
    WatchClosed,

    /// An HTTP-level failure talking to the agent.
    #[error("HTTP error: {0}")]
    Http(String),

    /// Failed to parse JSON data.
    #[error("JSON parse error: {0}")]
    JsonParse(String),

    /// The agent answered with something the client could not interpret.
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Builds the element-not-found error raised by a failed mandatory wait.
    pub fn element_not_found(selector: impl fmt::Display) -> Self {
        DeviceError::ElementNotFound(RpcError {
            code: CLIENT_ERROR_CODE,
            message: String::new(),
            data: Value::String(selector.to_string()),
            method: Some("wait".to_string()),
        })
    }

    /// Returns `true` for transport-level timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::RpcTimeout)
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::JsonParse(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_category_mapping() {
        assert_eq!(ErrorCategory::from_code(-32700), ErrorCategory::Parse);
        assert_eq!(ErrorCategory::from_code(-32600), ErrorCategory::InvalidRequest);
        assert_eq!(ErrorCategory::from_code(-32601), ErrorCategory::MethodNotFound);
        assert_eq!(ErrorCategory::from_code(-32602), ErrorCategory::InvalidParams);
        assert_eq!(ErrorCategory::from_code(-32603), ErrorCategory::Internal);
        assert_eq!(ErrorCategory::from_code(-32001), ErrorCategory::JsonRpc);
        assert_eq!(ErrorCategory::from_code(-32002), ErrorCategory::Client);
        assert_eq!(ErrorCategory::from_code(-32050), ErrorCategory::Server);
        assert_eq!(ErrorCategory::from_code(-32000), ErrorCategory::Server);
        assert_eq!(ErrorCategory::from_code(-32099), ErrorCategory::Server);
        assert_eq!(ErrorCategory::from_code(-1), ErrorCategory::Unknown);
        assert_eq!(ErrorCategory::from_code(-32100), ErrorCategory::Unknown);
    }

    #[test]
    fn test_rpc_error_from_json() {
        let raw = json!({
            "code": -32001,
            "message": "java.lang.NullPointerException",
            "data": {"exceptionTypeName": "java.lang.NullPointerException"}
        });
        let err = RpcError::from_json(&raw, "click");
        assert_eq!(err.code, -32001);
        assert_eq!(err.category(), ErrorCategory::JsonRpc);
        assert_eq!(err.exception_name(), Some("java.lang.NullPointerException"));
        assert_eq!(err.method.as_deref(), Some("click"));
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError {
            code: -32601,
            message: "no such method".to_string(),
            data: Value::String("x".to_string()),
            method: Some("frobnicate".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "-32601 Method not found: <no such method> data: x, method: frobnicate"
        );
    }

    #[test]
    fn test_element_not_found_is_client_error() {
        let err = DeviceError::element_not_found("Selector [text=\"OK\"]");
        match err {
            DeviceError::ElementNotFound(rpc) => {
                assert_eq!(rpc.category(), ErrorCategory::Client);
                assert_eq!(rpc.method.as_deref(), Some("wait"));
                assert_eq!(rpc.data, Value::String("Selector [text=\"OK\"]".to_string()));
            }
            other => panic!("expected ElementNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_device_error_display() {
        assert!(DeviceError::InvalidField("txt".into()).to_string().contains("txt"));
        assert!(DeviceError::RpcTimeout.to_string().contains("timed out"));
        assert!(DeviceError::RpcTimeout.is_timeout());
        assert!(!DeviceError::EmptyHierarchy.is_timeout());
    }
}
