//! Conversation data model and wire chunk types.
//!
//! These types are transport-agnostic: `Message` is what the session stores
//! and sends as history, `StreamChunk` is what the backend emits over the
//! wire, and `MessageDelta` is the unit the store merges into the streaming
//! tail message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ---------- Messages ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Stringified JSON arguments, accumulated from streamed fragments.
        arguments: String,
    },
    ToolResult {
        #[serde(rename = "toolCallId")]
        tool_call_id: String,
        output: JsonValue,
    },
}

/// Message content: either a plain string or an ordered part sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<MessagePart>),
}

impl MessageContent {
    /// Concatenated text of the content, ignoring tool parts.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    MessagePart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// Append a streamed text fragment in arrival order.
    pub fn append_text(&mut self, delta: &str) {
        match self {
            MessageContent::Text(text) => text.push_str(delta),
            MessageContent::Parts(parts) => match parts.last_mut() {
                Some(MessagePart::Text { text }) => text.push_str(delta),
                _ => parts.push(MessagePart::Text {
                    text: delta.to_string(),
                }),
            },
        }
    }

    /// Merge a tool-call fragment. Fragments for the same `index` accumulate
    /// their argument text; a fragment for an unseen index opens a new call.
    pub fn merge_tool_call(&mut self, index: usize, id: &str, name: &str, arguments: &str) {
        let parts = self.ensure_parts();
        let mut seen = 0usize;
        for part in parts.iter_mut() {
            if let MessagePart::ToolCall {
                arguments: existing,
                ..
            } = part
            {
                if seen == index {
                    existing.push_str(arguments);
                    return;
                }
                seen += 1;
            }
        }
        parts.push(MessagePart::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        });
    }

    fn ensure_parts(&mut self) -> &mut Vec<MessagePart> {
        if let MessageContent::Text(text) = self {
            let mut parts = Vec::new();
            if !text.is_empty() {
                parts.push(MessagePart::Text { text: text.clone() });
            }
            *self = MessageContent::Parts(parts);
        }
        match self {
            MessageContent::Parts(parts) => parts,
            MessageContent::Text(_) => unreachable!("converted above"),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        MessageContent::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        MessageContent::Text(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: MessageContent,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<MessageContent>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text.into())
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text.into())
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text.into())
    }

    pub fn tool(tool_call_id: impl Into<String>, output: JsonValue) -> Self {
        Self::new(
            Role::Tool,
            MessageContent::Parts(vec![MessagePart::ToolResult {
                tool_call_id: tool_call_id.into(),
                output,
            }]),
        )
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Structural checks applied before a message enters the store.
    /// Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("message id must not be empty".into());
        }
        if self.role == Role::Tool {
            let has_result = matches!(
                &self.content,
                MessageContent::Parts(parts) if parts
                    .iter()
                    .any(|part| matches!(part, MessagePart::ToolResult { .. }))
            );
            if !has_result {
                return Err("tool message must carry a tool-result part".into());
            }
        }
        Ok(())
    }
}

/// Unit of mutation applied to the streaming tail message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageDelta {
    Text(String),
    ToolCall {
        index: usize,
        id: String,
        name: String,
        arguments: String,
    },
}

// ---------- Wire protocol ----------

/// A single decoded chunk from the backend stream.
///
/// The `[DONE]` terminator is handled at the SSE layer and never surfaces as
/// a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamChunk {
    Text {
        content: String,
    },
    ToolCallDelta {
        #[serde(rename = "toolCallIndex")]
        tool_call_index: usize,
        #[serde(rename = "toolCall")]
        tool_call: ToolCallChunk,
    },
    Error {
        error: WireError,
    },
}

impl StreamChunk {
    /// Convert a content-bearing chunk into a store delta.
    /// Error chunks carry no content and return `None`.
    pub fn to_delta(&self) -> Option<MessageDelta> {
        match self {
            StreamChunk::Text { content } => Some(MessageDelta::Text(content.clone())),
            StreamChunk::ToolCallDelta {
                tool_call_index,
                tool_call,
            } => Some(MessageDelta::ToolCall {
                index: *tool_call_index,
                id: tool_call.id.clone(),
                name: tool_call.function.name.clone(),
                arguments: tool_call.function.arguments.clone(),
            }),
            StreamChunk::Error { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallChunk {
    pub id: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

/// POST payload for a chat request: full history plus caller extras.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequestBody {
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

#[cfg(test)]
#[path = "../tests/message_tests.rs"]
mod message_tests;
#[cfg(test)]
#[path = "../tests/wire_tests.rs"]
mod wire_tests;
