//! Envelope wire format
//!
//! Envelopes are the only state that crosses the transport boundary. They
//! are JSON objects discriminated by `type`:
//!
//! ```json
//! {"type":"request","id":"req-1","method":"count","params":[[{"kinds":[1]}]]}
//! {"type":"response","id":"req-1","success":true,"result":3}
//! {"type":"stream","streamId":"stream-1700000000000-4","event":{...}}
//! ```

use crate::error::GatewayError;
use crate::types::{Event, StreamId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// RPC methods understood by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Add,
    Event,
    Replaceable,
    Count,
    Filters,
    Subscribe,
    CloseStream,
    Supports,
    SetBackend,
    GetBackend,
    GetBackendStatus,
    GetBackends,
    ReconnectBackends,
    IsBackendConnected,
}

impl Method {
    pub const ALL: [Method; 14] = [
        Method::Add,
        Method::Event,
        Method::Replaceable,
        Method::Count,
        Method::Filters,
        Method::Subscribe,
        Method::CloseStream,
        Method::Supports,
        Method::SetBackend,
        Method::GetBackend,
        Method::GetBackendStatus,
        Method::GetBackends,
        Method::ReconnectBackends,
        Method::IsBackendConnected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Add => "add",
            Method::Event => "event",
            Method::Replaceable => "replaceable",
            Method::Count => "count",
            Method::Filters => "filters",
            Method::Subscribe => "subscribe",
            Method::CloseStream => "close_stream",
            Method::Supports => "supports",
            Method::SetBackend => "set_backend",
            Method::GetBackend => "get_backend",
            Method::GetBackendStatus => "get_backend_status",
            Method::GetBackends => "get_backends",
            Method::ReconnectBackends => "reconnect_backends",
            Method::IsBackendConnected => "is_backend_connected",
        }
    }

    /// Methods answered by an acknowledgement plus stream envelopes
    pub fn is_streaming(&self) -> bool {
        matches!(self, Method::Filters | Method::Subscribe)
    }

    /// Administrative surface, privileged sessions only
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Method::SetBackend
                | Method::GetBackend
                | Method::GetBackendStatus
                | Method::GetBackends
                | Method::ReconnectBackends
                | Method::IsBackendConnected
        )
    }
}

impl FromStr for Method {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Method::ALL
            .iter()
            .copied()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| GatewayError::UnknownMethod(s.to_string()))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A call from the caller context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Caller-generated correlation id
    pub id: String,

    pub method: String,

    /// Positional arguments
    #[serde(default)]
    pub params: Vec<serde_json::Value>,
}

impl Request {
    pub fn new(id: impl Into<String>, method: Method, params: Vec<serde_json::Value>) -> Self {
        Self {
            id: id.into(),
            method: method.as_str().to_string(),
            params,
        }
    }
}

/// Result-or-error envelope for one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Machine-readable error code (see `GatewayError::code`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Response {
    pub fn ok(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
            code: None,
        }
    }

    pub fn err(id: impl Into<String>, error: &GatewayError) -> Self {
        Self {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.to_string()),
            code: Some(error.code().to_string()),
        }
    }

    /// Convert back into a `Result` on the caller side
    pub fn into_result(self) -> Result<serde_json::Value, GatewayError> {
        if self.success {
            Ok(self.result.unwrap_or(serde_json::Value::Null))
        } else {
            Err(GatewayError::from_remote(
                self.code.as_deref(),
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
    }
}

/// One item of a stream, addressed by stream id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub stream_id: StreamId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamEvent {
    pub fn event(stream_id: StreamId, event: Event) -> Self {
        Self {
            stream_id,
            event: Some(event),
            done: false,
            error: None,
        }
    }

    pub fn done(stream_id: StreamId) -> Self {
        Self {
            stream_id,
            event: None,
            done: true,
            error: None,
        }
    }

    pub fn error(stream_id: StreamId, error: impl Into<String>) -> Self {
        Self {
            stream_id,
            event: None,
            done: false,
            error: Some(error.into()),
        }
    }

    /// Whether this envelope ends the stream
    pub fn is_terminal(&self) -> bool {
        self.done || self.error.is_some()
    }
}

/// The serialized unit crossing the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Stream(StreamEvent),
}

impl Envelope {
    pub fn to_bytes(&self) -> Result<Vec<u8>, GatewayError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GatewayError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
