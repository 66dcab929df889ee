//! Reactive binding over a [`ChatSession`].
//!
//! `ChatHandle` plays the role a UI hook plays in a frontend framework: it
//! owns one session, subscribes to its change callbacks, and republishes
//! `messages`, `is_loading`, and `error` through `tokio::sync::watch`
//! channels any consumer can observe. The handle's options deliberately
//! omit the three change callbacks — the handle registers those listeners
//! itself, and an external subscriber would race its own.

use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::watch;

use crate::chat_core::connection::Connection;
use crate::chat_core::error::ChatError;
use crate::chat_core::session::{
    BusyPolicy, ChatSession, ChatSessionOptions, ChunkCallback, ErrorCallback, FinishCallback,
};
use crate::chat_types::Message;

pub struct ChatHandleOptions {
    pub connection: Arc<dyn Connection>,
    pub id: Option<String>,
    pub initial_messages: Vec<Message>,
    pub body: Option<JsonValue>,
    pub busy: BusyPolicy,
    pub on_chunk: Option<ChunkCallback>,
    pub on_finish: Option<FinishCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl ChatHandleOptions {
    pub fn new(connection: Arc<dyn Connection>) -> Self {
        Self {
            connection,
            id: None,
            initial_messages: Vec::new(),
            body: None,
            busy: BusyPolicy::default(),
            on_chunk: None,
            on_finish: None,
            on_error: None,
        }
    }
}

pub struct ChatHandle {
    session: ChatSession,
    messages: watch::Receiver<Vec<Message>>,
    is_loading: watch::Receiver<bool>,
    error: watch::Receiver<Option<Arc<ChatError>>>,
}

impl ChatHandle {
    pub fn new(options: ChatHandleOptions) -> Self {
        let (messages_tx, messages_rx) = watch::channel(options.initial_messages.clone());
        let (loading_tx, loading_rx) = watch::channel(false);
        let (error_tx, error_rx) = watch::channel(None::<Arc<ChatError>>);

        let mut session_options = ChatSessionOptions::new(options.connection)
            .initial_messages(options.initial_messages)
            .busy(options.busy)
            .on_messages_change(move |messages: &[Message]| {
                let _ = messages_tx.send(messages.to_vec());
            })
            .on_loading_change(move |loading| {
                let _ = loading_tx.send(loading);
            })
            .on_error_change(move |error| {
                let _ = error_tx.send(error);
            });
        if let Some(id) = options.id {
            session_options = session_options.id(id);
        }
        if let Some(body) = options.body {
            session_options = session_options.body(body);
        }
        session_options.on_chunk = options.on_chunk;
        session_options.on_finish = options.on_finish;
        session_options.on_error = options.on_error;

        Self {
            session: ChatSession::new(session_options),
            messages: messages_rx,
            is_loading: loading_rx,
            error: error_rx,
        }
    }

    // ---------- reactive values ----------

    pub fn messages(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        *self.is_loading.borrow()
    }

    pub fn error(&self) -> Option<Arc<ChatError>> {
        self.error.borrow().clone()
    }

    /// Subscribe to message updates, e.g. to drive re-render scheduling.
    pub fn watch_messages(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.clone()
    }

    pub fn watch_is_loading(&self) -> watch::Receiver<bool> {
        self.is_loading.clone()
    }

    pub fn watch_error(&self) -> watch::Receiver<Option<Arc<ChatError>>> {
        self.error.clone()
    }

    // ---------- bound session methods ----------

    pub async fn send_message(&self, content: impl Into<String>) {
        self.session.send_message(content).await;
    }

    pub async fn append(&self, message: Message) {
        self.session.append(message).await;
    }

    pub async fn reload(&self) {
        self.session.reload().await;
    }

    pub fn stop(&self) {
        self.session.stop();
    }

    pub fn set_messages(&self, messages: Vec<Message>) {
        self.session.set_messages(messages);
    }

    pub fn clear(&self) {
        self.session.clear();
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }
}

impl Drop for ChatHandle {
    fn drop(&mut self) {
        // Unmount semantics: stop any in-flight generation.
        self.session.stop();
    }
}

#[cfg(test)]
#[path = "../tests/handle_tests.rs"]
mod handle_tests;
