//! Streaming chat-completion provider.
//!
//! The LLM endpoint is modeled as a lazy sequence of [`StreamEvent`]s with
//! one consumer: text deltas as they arrive, then one `Completed` carrying
//! the fully assembled assistant turn (or `Failed`). Dropping the receiver
//! cancels the in-flight request.
//!
//! [`AnthropicProvider`] speaks the messages API over SSE. The byte-level
//! SSE splitter and the event-to-turn assembler are standalone so they can
//! be tested without a network.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{AssistantTurn, ChatMessage, ContentBlock, StopReason};

/// Everything one completion call needs.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Value,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text token fragment, in arrival order.
    TextDelta(String),
    /// The turn finished; the assembled assistant message.
    Completed(AssistantTurn),
    /// The stream failed; no `Completed` will follow.
    Failed(String),
}

/// Seam between the agent loop and the LLM endpoint; tests drive the loop
/// with a scripted implementation.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn stream_turn(&self, request: TurnRequest) -> Result<mpsc::Receiver<StreamEvent>>;
}

/// Generation settings for the real endpoint.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_key: String::new(),
            model: "claude-sonnet-4-20250514".to_string(),
            max_tokens: 4096,
            temperature: None,
        }
    }
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    async fn stream_turn(&self, request: TurnRequest) -> Result<mpsc::Receiver<StreamEvent>> {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "system": request.system,
            "tools": request.tools,
            "messages": request.messages,
            "stream": true,
        });
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }

        let response = self
            .client
            .post(format!(
                "{}/v1/messages",
                self.config.base_url.trim_end_matches('/')
            ))
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("completion request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("completion endpoint returned {status}: {text}");
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::default();
            let mut assembler = TurnAssembler::default();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Failed(e.to_string())).await;
                        return;
                    }
                };
                for sse in parser.feed(&chunk) {
                    for event in assembler.handle(&sse) {
                        let done = matches!(
                            &event,
                            StreamEvent::Completed(_) | StreamEvent::Failed(_)
                        );
                        if tx.send(event).await.is_err() {
                            // Consumer gone: the turn was cancelled.
                            return;
                        }
                        if done {
                            return;
                        }
                    }
                }
            }

            let _ = tx
                .send(StreamEvent::Failed(
                    "stream ended before message_stop".to_string(),
                ))
                .await;
        });

        Ok(rx)
    }
}

/// One server-sent event: `event:` name plus joined `data:` payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Byte-level SSE splitter. Chunks may end mid-line or mid-codepoint, so
/// the buffer is raw bytes and events are cut on blank lines.
#[derive(Default)]
pub struct SseParser {
    buf: Vec<u8>,
}

impl SseParser {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((cut, skip)) = find_blank_line(&self.buf) {
            let block: Vec<u8> = self.buf.drain(..cut + skip).collect();
            if let Some(event) = parse_block(&block) {
                events.push(event);
            }
        }
        events
    }
}

/// Position and width of the next event separator (`\n\n` or `\r\n\r\n`).
fn find_blank_line(buf: &[u8]) -> Option<(usize, usize)> {
    for i in 0..buf.len().saturating_sub(1) {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 4 <= buf.len() && &buf[i..i + 4] == b"\r\n\r\n" {
            return Some((i, 4));
        }
    }
    None
}

fn parse_block(block: &[u8]) -> Option<SseEvent> {
    let text = String::from_utf8_lossy(block);
    let mut event = String::new();
    let mut data = Vec::new();
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.trim_start().to_string());
        }
    }
    if event.is_empty() && data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event,
        data: data.join("\n"),
    })
}

/// Folds the endpoint's event stream into content blocks and a final turn.
#[derive(Default)]
pub struct TurnAssembler {
    blocks: BTreeMap<usize, PartialBlock>,
    stop_reason: Option<StopReason>,
}

enum PartialBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        partial_json: String,
    },
}

impl TurnAssembler {
    pub fn handle(&mut self, sse: &SseEvent) -> Vec<StreamEvent> {
        let data: Value = match serde_json::from_str(&sse.data) {
            Ok(v) => v,
            Err(_) if sse.data.is_empty() => Value::Null,
            Err(e) => {
                warn!(event = %sse.event, error = %e, "undecodable stream event");
                return vec![];
            }
        };

        match sse.event.as_str() {
            "content_block_start" => {
                let index = data["index"].as_u64().unwrap_or(0) as usize;
                let block = &data["content_block"];
                let partial = match block["type"].as_str() {
                    Some("tool_use") => PartialBlock::ToolUse {
                        id: block["id"].as_str().unwrap_or_default().to_string(),
                        name: block["name"].as_str().unwrap_or_default().to_string(),
                        partial_json: String::new(),
                    },
                    _ => PartialBlock::Text(
                        block["text"].as_str().unwrap_or_default().to_string(),
                    ),
                };
                self.blocks.insert(index, partial);
                vec![]
            }
            "content_block_delta" => {
                let index = data["index"].as_u64().unwrap_or(0) as usize;
                let delta = &data["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default().to_string();
                        if let Some(PartialBlock::Text(acc)) = self.blocks.get_mut(&index) {
                            acc.push_str(&text);
                        }
                        vec![StreamEvent::TextDelta(text)]
                    }
                    Some("input_json_delta") => {
                        if let Some(PartialBlock::ToolUse { partial_json, .. }) =
                            self.blocks.get_mut(&index)
                        {
                            partial_json
                                .push_str(delta["partial_json"].as_str().unwrap_or_default());
                        }
                        vec![]
                    }
                    _ => vec![],
                }
            }
            "message_delta" => {
                if let Some(reason) = data["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(StopReason::parse(reason));
                }
                vec![]
            }
            "message_stop" => {
                let blocks = std::mem::take(&mut self.blocks)
                    .into_values()
                    .map(PartialBlock::finish)
                    .collect();
                let turn = AssistantTurn {
                    blocks,
                    stop_reason: self.stop_reason.take().unwrap_or(StopReason::EndTurn),
                };
                vec![StreamEvent::Completed(turn)]
            }
            "error" => {
                let message = data["error"]["message"]
                    .as_str()
                    .unwrap_or("unknown stream error")
                    .to_string();
                vec![StreamEvent::Failed(message)]
            }
            // message_start, content_block_stop, ping: nothing to fold.
            other => {
                debug!(event = other, "ignoring stream event");
                vec![]
            }
        }
    }
}

impl PartialBlock {
    fn finish(self) -> ContentBlock {
        match self {
            PartialBlock::Text(text) => ContentBlock::Text { text },
            PartialBlock::ToolUse {
                id,
                name,
                partial_json,
            } => {
                let input = if partial_json.is_empty() {
                    serde_json::json!({})
                } else {
                    serde_json::from_str(&partial_json).unwrap_or_else(|e| {
                        warn!(error = %e, "tool input was not valid JSON");
                        serde_json::json!({})
                    })
                };
                ContentBlock::ToolUse { id, name, input }
            }
        }
    }
}
