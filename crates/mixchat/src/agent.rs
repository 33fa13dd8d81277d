//! The multi-turn tool-using conversation driver.
//!
//! One user message triggers one run of the loop: stream a completion,
//! surface its text, execute any requested tools (mutating ones behind a
//! client approval round-trip), feed the results back, repeat until the
//! model answers without tools. Events flow through [`AgentChannel`]; the
//! loop itself never touches a socket.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::provider::{ChatProvider, StreamEvent, TurnRequest};
use crate::tools::{self, Toolbox};
use crate::types::{AssistantTurn, ChatContent, ChatMessage, ContentBlock};

/// Events the loop produces for the client, in order.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Text(String),
    FunctionCall {
        tool_call_id: String,
        name: String,
        arguments: Value,
    },
    FunctionResult {
        tool_call_id: String,
        content: String,
    },
    EndMessage,
    Error(String),
}

/// One mutating call awaiting a yes/no from the human.
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalRequest {
    pub tool_call_id: String,
    pub name: String,
    pub arguments: Value,
}

/// The session's side of the conversation: event emission plus the
/// approval round-trip. Implemented over the client channel.
#[async_trait]
pub trait AgentChannel: Send + Sync {
    fn emit(&self, event: AgentEvent);

    /// Surface the pending mutating calls and await the client's
    /// decisions, keyed by tool-call id. Missing ids count as denied.
    async fn request_approval(
        &self,
        requests: Vec<ApprovalRequest>,
    ) -> HashMap<String, bool>;
}

#[derive(Debug, Clone)]
pub struct TurnOptions {
    /// Upper bound on completion calls within one user turn.
    pub max_iterations: u32,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self { max_iterations: 8 }
    }
}

/// Run the agent loop for one user message, mutating `history` in place.
#[instrument(skip_all)]
pub async fn run_turn(
    provider: &dyn ChatProvider,
    toolbox: &dyn Toolbox,
    channel: &dyn AgentChannel,
    system: &str,
    history: &mut Vec<ChatMessage>,
    user_message: ChatContent,
    options: &TurnOptions,
) -> Result<()> {
    history.push(ChatMessage {
        role: crate::types::Role::User,
        content: user_message,
    });

    for iteration in 0..options.max_iterations {
        info!(iteration, "requesting completion");
        let turn = match stream_one_completion(provider, channel, system, history).await {
            Ok(turn) => turn,
            Err(e) => {
                channel.emit(AgentEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        history.push(ChatMessage::assistant_blocks(turn.blocks.clone()));
        channel.emit(AgentEvent::EndMessage);

        let tool_uses: Vec<(String, String, Value)> = turn
            .tool_uses()
            .into_iter()
            .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
            .collect();
        if tool_uses.is_empty() {
            return Ok(());
        }

        let mutating: Vec<ApprovalRequest> = tool_uses
            .iter()
            .filter(|(_, name, _)| tools::is_mutating(name))
            .map(|(id, name, input)| ApprovalRequest {
                tool_call_id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            })
            .collect();
        let decisions = if mutating.is_empty() {
            HashMap::new()
        } else {
            channel.request_approval(mutating).await
        };

        let mut results = Vec::with_capacity(tool_uses.len());
        for (id, name, input) in &tool_uses {
            let (content, is_error) = if tools::is_mutating(name)
                && !decisions.get(id).copied().unwrap_or(false)
            {
                info!(tool = %name, id = %id, "mutation denied by user");
                ("denied by user".to_string(), None)
            } else {
                match toolbox.execute(name, input).await {
                    Ok(value) => (value.to_string(), None),
                    Err(e) => {
                        warn!(tool = %name, error = %e, "tool execution failed");
                        (format!("Error: {e:#}"), Some(true))
                    }
                }
            };

            channel.emit(AgentEvent::FunctionCall {
                tool_call_id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            });
            channel.emit(AgentEvent::FunctionResult {
                tool_call_id: id.clone(),
                content: content.clone(),
            });
            results.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content,
                is_error,
            });
        }

        history.push(ChatMessage::user_blocks(results));
    }

    channel.emit(AgentEvent::Error(format!(
        "gave up after {} tool iterations",
        options.max_iterations
    )));
    bail!("max tool iterations ({}) exceeded", options.max_iterations)
}

/// Drive one streaming completion to its assembled turn, emitting text
/// deltas as they arrive.
async fn stream_one_completion(
    provider: &dyn ChatProvider,
    channel: &dyn AgentChannel,
    system: &str,
    history: &[ChatMessage],
) -> Result<AssistantTurn> {
    let mut rx = provider
        .stream_turn(TurnRequest {
            system: system.to_string(),
            messages: history.to_vec(),
            tools: tools::definitions(),
        })
        .await?;

    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::TextDelta(text) => channel.emit(AgentEvent::Text(text)),
            StreamEvent::Completed(turn) => return Ok(turn),
            StreamEvent::Failed(message) => bail!("completion stream failed: {message}"),
        }
    }
    bail!("completion stream closed without a final message")
}
