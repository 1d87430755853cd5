use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    domain::{ConnectionStatus, Group},
    error::ApiError,
};

pub const CONNECT_TOPIC: &str = "connect";
pub const CONNECTION_STATUS_TOPIC: &str = "connection_status";
pub const RUN_TERMINAL_FUNCTION_TOPIC: &str = "run_terminal_function";
pub const GROUP_CONTEXT_EVENTS_TOPIC: &str = "group_context_events";

/// Topics answered by the bridge. Published topics are on [`BridgeEvent`].
pub const RPC_TOPICS: [&str; 3] = [
    CONNECT_TOPIC,
    CONNECTION_STATUS_TOPIC,
    RUN_TERMINAL_FUNCTION_TOPIC,
];

/// Uniform reply envelope: `{status, message?, ...payload}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RpcResponse {
    pub fn ok() -> Self {
        Self {
            status: true,
            message: None,
            payload: Map::new(),
        }
    }

    pub fn ok_with(payload: Map<String, Value>) -> Self {
        Self {
            status: true,
            message: None,
            payload,
        }
    }

    pub fn ok_message(message: impl Into<String>) -> Self {
        Self {
            status: true,
            message: Some(message.into()),
            payload: Map::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: false,
            message: Some(message.into()),
            payload: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

impl From<ApiError> for RpcResponse {
    fn from(value: ApiError) -> Self {
        Self::failure(value.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub connect: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupContextEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<Group>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    pub external_source: bool,
}

/// Fire-and-forget notifications published by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeEvent {
    ConnectionStatus(ConnectionStatus),
    GroupContext(GroupContextEvent),
}

impl BridgeEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::ConnectionStatus(_) => CONNECTION_STATUS_TOPIC,
            Self::GroupContext(_) => GROUP_CONTEXT_EVENTS_TOPIC,
        }
    }

    pub fn payload(&self) -> serde_json::Result<Value> {
        match self {
            Self::ConnectionStatus(status) => serde_json::to_value(status),
            Self::GroupContext(event) => serde_json::to_value(event),
        }
    }
}

/// A published event as seen by bus subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    pub topic: String,
    pub payload: Value,
    pub published_at: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
        }
    }
}
