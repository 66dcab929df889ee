//! Ordered message log with a single mutable streaming slot at the tail.
//!
//! The store is an append-only log of finalized messages plus at most one
//! in-progress assistant message. While the streaming flag is set, the last
//! message is the only mutable entry; `finalize_streaming` freezes it back
//! into the immutable log.

use crate::chat_core::error::ChatError;
use crate::chat_types::{Message, MessageDelta, Role};

#[derive(Debug, Default)]
pub struct MessageStore {
    messages: Vec<Message>,
    streaming_tail: bool,
}

impl MessageStore {
    pub fn new(initial: Vec<Message>) -> Self {
        Self {
            messages: initial,
            streaming_tail: false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming_tail
    }

    /// Append a finalized message. Rejects before any mutation.
    pub fn append(&mut self, message: Message) -> Result<(), ChatError> {
        if self.streaming_tail {
            return Err(ChatError::invariant(
                "cannot append while a streaming message is open",
            ));
        }
        message.validate().map_err(ChatError::validation)?;
        self.messages.push(message);
        Ok(())
    }

    /// Replace the whole conversation. Transactional: every message is
    /// validated before any state changes.
    pub fn replace_all(&mut self, messages: Vec<Message>) -> Result<(), ChatError> {
        for message in &messages {
            message.validate().map_err(ChatError::validation)?;
        }
        self.messages = messages;
        self.streaming_tail = false;
        Ok(())
    }

    /// Open the streaming slot with a fresh assistant message.
    pub fn begin_streaming(&mut self, message: Message) -> Result<(), ChatError> {
        if self.streaming_tail {
            return Err(ChatError::invariant("streaming message already open"));
        }
        if message.role != Role::Assistant {
            return Err(ChatError::invariant(
                "streaming message must have the assistant role",
            ));
        }
        self.messages.push(message);
        self.streaming_tail = true;
        Ok(())
    }

    /// Merge a streamed delta into the open streaming message, in arrival
    /// order. Fails when no streaming slot is open (out-of-order delivery).
    pub fn update_last(&mut self, delta: &MessageDelta) -> Result<(), ChatError> {
        if !self.streaming_tail {
            return Err(ChatError::invariant(
                "delta arrived with no streaming message present",
            ));
        }
        let last = self
            .messages
            .last_mut()
            .ok_or_else(|| ChatError::invariant("streaming flag set on empty store"))?;
        match delta {
            MessageDelta::Text(fragment) => last.content.append_text(fragment),
            MessageDelta::ToolCall {
                index,
                id,
                name,
                arguments,
            } => last.content.merge_tool_call(*index, id, name, arguments),
        }
        Ok(())
    }

    /// Freeze the streaming tail into the immutable log.
    pub fn finalize_streaming(&mut self) -> Option<&Message> {
        if !self.streaming_tail {
            return None;
        }
        self.streaming_tail = false;
        self.messages.last()
    }

    pub fn remove_last(&mut self) -> Option<Message> {
        self.streaming_tail = false;
        self.messages.pop()
    }

    /// Drop everything after the last user message, for regeneration.
    /// Returns the number of messages removed, or `None` when the
    /// conversation holds no user message.
    pub fn truncate_after_last_user(&mut self) -> Option<usize> {
        let last_user = self
            .messages
            .iter()
            .rposition(|message| message.role == Role::User)?;
        let removed = self.messages.len() - (last_user + 1);
        self.messages.truncate(last_user + 1);
        self.streaming_tail = false;
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.streaming_tail = false;
    }
}
