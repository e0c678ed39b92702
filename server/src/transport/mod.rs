use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use argus_common::error::ApiError;

pub mod agent;
pub mod direct;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

impl WatchEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchEventType::Added => "ADDED",
            WatchEventType::Modified => "MODIFIED",
            WatchEventType::Deleted => "DELETED",
        }
    }
}

impl std::str::FromStr for WatchEventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADDED" => Ok(WatchEventType::Added),
            "MODIFIED" => Ok(WatchEventType::Modified),
            "DELETED" => Ok(WatchEventType::Deleted),
            other => Err(anyhow::anyhow!("unknown watch event type: {}", other)),
        }
    }
}

/// One upstream change, raw object bytes included. The hub attaches the
/// subscription key; the transport only knows type and payload.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Get,
    List,
    Create,
    Update,
    Patch,
    Delete,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
        }
    }

    pub fn is_mutating(&self) -> bool {
        matches!(self, Verb::Create | Verb::Update | Verb::Patch | Verb::Delete)
    }
}

impl std::str::FromStr for Verb {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "get" => Ok(Verb::Get),
            "list" => Ok(Verb::List),
            "create" => Ok(Verb::Create),
            "update" => Ok(Verb::Update),
            "patch" => Ok(Verb::Patch),
            "delete" => Ok(Verb::Delete),
            other => Err(anyhow::anyhow!("unknown verb: {}", other)),
        }
    }
}

/// A logical Kubernetes operation, transport-agnostic. The core API group is
/// the empty string here; the HTTP boundary encodes it as `_`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct K8sOp {
    pub verb: Verb,
    pub group: String,
    pub version: String,
    pub resource: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct K8sReply {
    pub status: u16,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// The cluster is between sessions; callers may retry. Never retried
    /// inside the core.
    #[error("{0}")]
    Unavailable(String),

    /// The upstream API answered with an error status.
    #[error("upstream status {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The peer violated the tunnel framing contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Unavailable(_))
    }
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unavailable(msg) => ApiError::Unavailable(msg),
            TransportError::Upstream { status, message } => {
                ApiError::Upstream { status, message }
            }
            TransportError::Protocol(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
            TransportError::Cancelled => ApiError::Unavailable("operation cancelled".into()),
        }
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<WatchEvent, TransportError>> + Send>>;

/// Capability object for one cluster: every Kubernetes operation and watch
/// flows through here, whatever the wire underneath.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn do_request(&self, op: K8sOp) -> Result<K8sReply, TransportError>;
    async fn open_watch(
        &self,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<EventStream, TransportError>;
}
