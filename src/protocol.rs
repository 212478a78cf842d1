//! The message protocol spoken between the coordinator and its workers.
//!
//! A closed set of tagged request/response/error messages. Every request
//! carries a correlation id allocated by the coordinator; a worker never
//! originates a request, it only answers with a response or error echoing
//! the id it received. All message bodies derive `Serialize`/`Deserialize`,
//! which is what makes them legal to copy structurally across an in-memory
//! channel, a thread message port or a process pipe.

use serde::{Deserialize, Serialize};

use crate::cache::SerializedRouteCache;
use crate::error::Error;
use crate::loader::RenderedPage;
use crate::route::{RouteDefinition, RouteKey, StaticPath};
use crate::{LogLevel, RuntimeMode};

/// Correlation id attached to a request and echoed in its settlement
pub type MessageId = u64;

/// Body of the `Init` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitPayload {
    /// Location of the compiled render entrypoint
    pub entrypoint: String,
    /// Opaque build settings forwarded to the render context
    pub build_settings: serde_json::Value,
    pub routes: Vec<RouteDefinition>,
    pub runtime_mode: RuntimeMode,
    pub origin: String,
    pub log_level: LogLevel,
    /// Whether fallback routes generate pages of their own
    pub generate_fallback_pages: bool,
    /// Default page size handed to the pagination helper
    pub page_size: usize,
    /// Present for workers 1..N-1: the sealed cache produced by worker 0
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_cache: Option<SerializedRouteCache>,
}

/// A serialized error crossing the worker boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WireError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Convert a worker-side error into its wire form.
    pub fn from_error(err: &Error) -> Self {
        let name = match err {
            Error::InitializationError(_) => "InitializationError",
            Error::ConfigError(_) => "ConfigError",
            Error::RenderError(_) => "RenderError",
            Error::ProtocolError(_) => "ProtocolError",
            Error::TransportError(_) => "TransportError",
            Error::Timeout(_) => "Timeout",
            Error::Worker(inner) => return inner.clone(),
        };
        Self::new(name, err.to_string())
    }

    /// Convert a caught panic payload into its wire form.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "worker panicked with a non-string payload".to_string()
        };
        Self::new("Panic", message)
    }
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

/// The closed set of protocol messages.
///
/// Each request type has exactly one success-response type; `Error` is the
/// shared failure response. `Shutdown` is fire-and-forget and carries no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Init {
        id: MessageId,
        payload: InitPayload,
    },
    InitResult {
        id: MessageId,
    },
    GetStaticPaths {
        id: MessageId,
    },
    StaticPathsResult {
        id: MessageId,
        paths: Vec<StaticPath>,
        route_cache: SerializedRouteCache,
    },
    Render {
        id: MessageId,
        url: String,
        route_key: RouteKey,
    },
    RenderResult {
        id: MessageId,
        page: RenderedPage,
    },
    Error {
        id: MessageId,
        error: WireError,
    },
    Shutdown,
}

impl Message {
    /// The correlation id, if this message kind carries one.
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Message::Init { id, .. }
            | Message::InitResult { id }
            | Message::GetStaticPaths { id }
            | Message::StaticPathsResult { id, .. }
            | Message::Render { id, .. }
            | Message::RenderResult { id, .. }
            | Message::Error { id, .. } => Some(*id),
            Message::Shutdown => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Init { .. } => "Init",
            Message::InitResult { .. } => "InitResult",
            Message::GetStaticPaths { .. } => "GetStaticPaths",
            Message::StaticPathsResult { .. } => "StaticPathsResult",
            Message::Render { .. } => "Render",
            Message::RenderResult { .. } => "RenderResult",
            Message::Error { .. } => "Error",
            Message::Shutdown => "Shutdown",
        }
    }
}
