//! Outbound client events and inbound frames: the wire contract.
//!
//! Every outbound frame is `{"type": <kind>, ...}`. Tool and parameter
//! fields are `snake_case`; the indexing payload keeps its historical
//! `isIndexing` camelCase. The `<|END_MESSAGE|>` sentinel terminates one
//! complete agent turn. Clients ignore kinds they do not know; the server
//! does the same for inbound frames (reserved kinds are skipped, never
//! errored).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use liveset::{IndexingProgress, ParameterChange};
use mixchat::{AgentEvent, ApprovalRequest};

pub const END_MESSAGE_SENTINEL: &str = "<|END_MESSAGE|>";

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Text {
        content: String,
    },
    FunctionCall {
        tool_call_id: String,
        /// The tool name.
        content: String,
        arguments: Value,
    },
    FunctionResult {
        tool_call_id: String,
        content: String,
    },
    EndMessage {
        content: String,
    },
    ParameterChange {
        content: ParameterChange,
    },
    IndexingStatus {
        content: IndexingStatusBody,
    },
    Tracks {
        content: Value,
    },
    IndexError {
        content: String,
    },
    Error {
        content: String,
    },
    ApprovalRequired {
        content: Vec<ApprovalRequest>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexingStatusBody {
    #[serde(rename = "isIndexing")]
    pub is_indexing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl ClientEvent {
    pub fn end_message() -> Self {
        ClientEvent::EndMessage {
            content: END_MESSAGE_SENTINEL.to_string(),
        }
    }

    pub fn indexing_done() -> Self {
        ClientEvent::IndexingStatus {
            content: IndexingStatusBody {
                is_indexing: false,
                progress: Some(100),
            },
        }
    }
}

impl From<AgentEvent> for ClientEvent {
    fn from(event: AgentEvent) -> Self {
        match event {
            AgentEvent::Text(content) => ClientEvent::Text { content },
            AgentEvent::FunctionCall {
                tool_call_id,
                name,
                arguments,
            } => ClientEvent::FunctionCall {
                tool_call_id,
                content: name,
                arguments,
            },
            AgentEvent::FunctionResult {
                tool_call_id,
                content,
            } => ClientEvent::FunctionResult {
                tool_call_id,
                content,
            },
            AgentEvent::EndMessage => ClientEvent::end_message(),
            AgentEvent::Error(content) => ClientEvent::Error { content },
        }
    }
}

impl From<ParameterChange> for ClientEvent {
    fn from(change: ParameterChange) -> Self {
        ClientEvent::ParameterChange { content: change }
    }
}

impl From<IndexingProgress> for ClientEvent {
    fn from(frame: IndexingProgress) -> Self {
        ClientEvent::IndexingStatus {
            content: IndexingStatusBody {
                is_indexing: frame.is_indexing,
                progress: frame.progress,
            },
        }
    }
}

/// Inbound frames a client may send. Unknown shapes are ignored upstream.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub approvals: Option<std::collections::HashMap<String, bool>>,
}
