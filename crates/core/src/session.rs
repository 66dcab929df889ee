//! The chat session state machine.
//!
//! Composes the message store and the request controller behind a small
//! public surface: `send_message`, `append`, `reload`, `stop`,
//! `set_messages`, `clear`. Failures are never returned from these methods;
//! they land in the `error` observable and the async methods resolve once the
//! turn reaches its terminal state.

use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::chat_core::connection::{ChunkStream, Connection};
use crate::chat_core::error::ChatError;
use crate::chat_core::request::{RequestController, RequestId, RequestState};
use crate::chat_core::store::MessageStore;
use crate::chat_types::{ChatRequestBody, Message, Role, StreamChunk};

pub type MessagesCallback = Arc<dyn Fn(&[Message]) + Send + Sync>;
pub type LoadingCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type ErrorChangeCallback = Arc<dyn Fn(Option<Arc<ChatError>>) + Send + Sync>;
pub type ChunkCallback = Arc<dyn Fn(&StreamChunk) + Send + Sync>;
pub type FinishCallback = Arc<dyn Fn(&Message) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&ChatError) + Send + Sync>;

/// What to do when a request is issued while another one is streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Cancel the outstanding request, then start the new one.
    #[default]
    CancelPrevious,
    /// Drop the new request without touching state.
    Reject,
}

pub struct ChatSessionOptions {
    pub connection: Arc<dyn Connection>,
    pub id: Option<String>,
    pub initial_messages: Vec<Message>,
    /// Extra fields merged into every request body.
    pub body: Option<JsonValue>,
    pub busy: BusyPolicy,
    pub on_chunk: Option<ChunkCallback>,
    pub on_finish: Option<FinishCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_messages_change: Option<MessagesCallback>,
    pub on_loading_change: Option<LoadingCallback>,
    pub on_error_change: Option<ErrorChangeCallback>,
}

impl ChatSessionOptions {
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
            on_messages_change: None,
            on_loading_change: None,
            on_error_change: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn initial_messages(mut self, messages: Vec<Message>) -> Self {
        self.initial_messages = messages;
        self
    }

    pub fn body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    pub fn busy(mut self, policy: BusyPolicy) -> Self {
        self.busy = policy;
        self
    }

    pub fn on_chunk(mut self, f: impl Fn(&StreamChunk) + Send + Sync + 'static) -> Self {
        self.on_chunk = Some(Arc::new(f));
        self
    }

    pub fn on_finish(mut self, f: impl Fn(&Message) + Send + Sync + 'static) -> Self {
        self.on_finish = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&ChatError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_messages_change(mut self, f: impl Fn(&[Message]) + Send + Sync + 'static) -> Self {
        self.on_messages_change = Some(Arc::new(f));
        self
    }

    pub fn on_loading_change(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.on_loading_change = Some(Arc::new(f));
        self
    }

    pub fn on_error_change(
        mut self,
        f: impl Fn(Option<Arc<ChatError>>) + Send + Sync + 'static,
    ) -> Self {
        self.on_error_change = Some(Arc::new(f));
        self
    }
}

struct SessionState {
    store: MessageStore,
    is_loading: bool,
    error: Option<Arc<ChatError>>,
}

/// Which observables a committed transition touched.
#[derive(Default)]
struct Changes {
    messages: bool,
    loading: bool,
    error: bool,
}

struct Callbacks {
    on_chunk: Option<ChunkCallback>,
    on_finish: Option<FinishCallback>,
    on_error: Option<ErrorCallback>,
    on_messages_change: Option<MessagesCallback>,
    on_loading_change: Option<LoadingCallback>,
    on_error_change: Option<ErrorChangeCallback>,
}

struct SessionInner {
    id: String,
    connection: Arc<dyn Connection>,
    controller: RequestController,
    body: Option<JsonValue>,
    busy: BusyPolicy,
    callbacks: Callbacks,
    state: Mutex<SessionState>,
}

/// A single conversation against one backend. Cheap to clone; all clones
/// share the same state.
#[derive(Clone)]
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

impl ChatSession {
    pub fn new(options: ChatSessionOptions) -> Self {
        let id = options
            .id
            .unwrap_or_else(|| format!("chat-{}", uuid::Uuid::new_v4()));
        Self {
            inner: Arc::new(SessionInner {
                id,
                connection: options.connection,
                controller: RequestController::new(),
                body: options.body,
                busy: options.busy,
                callbacks: Callbacks {
                    on_chunk: options.on_chunk,
                    on_finish: options.on_finish,
                    on_error: options.on_error,
                    on_messages_change: options.on_messages_change,
                    on_loading_change: options.on_loading_change,
                    on_error_change: options.on_error_change,
                },
                state: Mutex::new(SessionState {
                    store: MessageStore::new(options.initial_messages),
                    is_loading: false,
                    error: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().unwrap().store.snapshot()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.lock().unwrap().is_loading
    }

    pub fn error(&self) -> Option<Arc<ChatError>> {
        self.inner.state.lock().unwrap().error.clone()
    }

    pub fn request_state(&self) -> RequestState {
        self.inner.controller.state()
    }

    /// Send a user message and stream the assistant reply. Resolves at the
    /// turn's terminal event; failures land in [`ChatSession::error`].
    pub async fn send_message(&self, content: impl Into<String>) {
        let content = content.into();
        let trimmed = content.trim();
        if trimmed.is_empty() {
            return;
        }
        self.append(Message::user(trimmed)).await;
    }

    /// Append a pre-built message. A `user` message triggers a backend
    /// request; any other role is a pure state update.
    pub async fn append(&self, message: Message) {
        if self.is_loading() {
            match self.inner.busy {
                BusyPolicy::Reject => {
                    debug!(
                        target: "chat_client::session",
                        session = %self.inner.id,
                        "rejecting append while a request is streaming"
                    );
                    return;
                }
                BusyPolicy::CancelPrevious => self.interrupt(),
            }
        }

        let triggers_request = message.role == Role::User;
        let appended = self.commit(|state, changes| {
            match state.store.append(message) {
                Ok(()) => {
                    changes.messages = true;
                    true
                }
                Err(err) => {
                    // Rejected before any mutation; surface via the observable.
                    state.error = Some(Arc::new(err));
                    changes.error = true;
                    false
                }
            }
        });
        if !appended {
            if let (Some(cb), Some(err)) = (&self.inner.callbacks.on_error, self.error()) {
                cb(&err);
            }
            return;
        }
        if triggers_request {
            self.run_turn().await;
        }
    }

    /// Re-issue the last user turn, discarding the assistant reply it had.
    /// No-op when the conversation holds no user message.
    pub async fn reload(&self) {
        if self.is_loading() {
            match self.inner.busy {
                BusyPolicy::Reject => return,
                BusyPolicy::CancelPrevious => self.interrupt(),
            }
        }

        let found_user = self.commit(|state, changes| {
            match state.store.truncate_after_last_user() {
                Some(removed) => {
                    if removed > 0 {
                        changes.messages = true;
                    }
                    true
                }
                None => false,
            }
        });
        if !found_user {
            return;
        }
        self.run_turn().await;
    }

    /// Cancel the active request, keeping whatever partial content streamed.
    /// Safe to call in any state.
    pub fn stop(&self) {
        if !self.inner.controller.cancel() {
            return;
        }
        self.commit(|state, changes| {
            if state.store.is_streaming() {
                state.store.finalize_streaming();
            }
            if state.is_loading {
                state.is_loading = false;
                changes.loading = true;
            }
        });
    }

    /// Replace the conversation wholesale (history hydration). Cancels any
    /// in-flight request first.
    pub fn set_messages(&self, messages: Vec<Message>) {
        self.inner.controller.cancel();
        self.commit(|state, changes| {
            if state.is_loading {
                state.is_loading = false;
                changes.loading = true;
            }
            match state.store.replace_all(messages) {
                Ok(()) => changes.messages = true,
                Err(err) => {
                    state.error = Some(Arc::new(err));
                    changes.error = true;
                }
            }
        });
    }

    /// Reset to an empty conversation and clear the error.
    pub fn clear(&self) {
        self.inner.controller.cancel();
        self.commit(|state, changes| {
            if state.is_loading {
                state.is_loading = false;
                changes.loading = true;
            }
            state.store.clear();
            changes.messages = true;
            if state.error.take().is_some() {
                changes.error = true;
            }
        });
    }

    // ---------- turn machinery ----------

    /// Cancel the outstanding request and freeze its partial tail, as a
    /// prelude to superseding it.
    fn interrupt(&self) {
        self.stop();
    }

    async fn run_turn(&self) {
        let id = self.inner.controller.begin();
        // Subscribe before any await so a stop() issued from here on is
        // guaranteed to wake the drive loop.
        let cancel_rx = self.inner.controller.cancel_signal();
        self.commit(|state, changes| {
            if !state.is_loading {
                state.is_loading = true;
                changes.loading = true;
            }
            if state.error.take().is_some() {
                changes.error = true;
            }
        });

        let body = ChatRequestBody {
            messages: self.messages(),
            data: self.inner.body.clone(),
        };
        let stream = match self.inner.connection.connect(&body).await {
            Ok(stream) => stream,
            Err(err) => {
                self.finish_failed(id, err);
                return;
            }
        };
        self.drive(id, stream, cancel_rx).await;
    }

    /// Apply chunks in arrival order until a terminal condition. Every event
    /// is checked against the request identity; stale events are discarded.
    /// The cancel signal wakes the loop when the request is superseded or
    /// stopped while the transport is quiet, so callers are not left waiting
    /// on a stream that may never yield again.
    async fn drive(
        &self,
        id: RequestId,
        mut stream: ChunkStream,
        mut cancel_rx: tokio::sync::watch::Receiver<u64>,
    ) {
        loop {
            let next = tokio::select! {
                next = stream.next() => next,
                _ = cancel_rx.changed() => {
                    debug!(
                        target: "chat_client::session",
                        session = %self.inner.id,
                        request = id.value(),
                        "request cancelled while awaiting stream"
                    );
                    return;
                }
            };
            if !self.inner.controller.is_current(id) {
                debug!(
                    target: "chat_client::session",
                    session = %self.inner.id,
                    request = id.value(),
                    "discarding event for stale request"
                );
                return;
            }
            match next {
                None => {
                    self.finish_succeeded(id);
                    return;
                }
                Some(Ok(chunk)) => {
                    if let Some(cb) = &self.inner.callbacks.on_chunk {
                        cb(&chunk);
                    }
                    if let StreamChunk::Error { error } = chunk {
                        self.finish_failed(id, ChatError::upstream(error));
                        return;
                    }
                    if let Err(err) = self.apply_delta(id, &chunk) {
                        warn!(
                            target: "chat_client::session",
                            session = %self.inner.id,
                            error = %err,
                            "failed to apply stream delta"
                        );
                        self.finish_failed(id, err);
                        return;
                    }
                }
                Some(Err(err)) => {
                    self.finish_failed(id, err);
                    return;
                }
            }
        }
    }

    /// Merge one content-bearing chunk into the streaming tail, opening the
    /// tail lazily on the first delta so a zero-delta failure leaves no empty
    /// assistant message behind.
    fn apply_delta(&self, id: RequestId, chunk: &StreamChunk) -> Result<(), ChatError> {
        let Some(delta) = chunk.to_delta() else {
            return Ok(());
        };
        self.commit(|state, changes| {
            // Re-check identity under the state lock: a stop() on another
            // thread may have committed between the drive loop's guard and
            // this commit, and its finalize must win over the stale delta.
            if !self.inner.controller.is_current(id) {
                return Ok(());
            }
            if !state.store.is_streaming() {
                state.store.begin_streaming(Message::assistant(""))?;
            }
            state.store.update_last(&delta)?;
            changes.messages = true;
            Ok(())
        })
    }

    fn finish_succeeded(&self, id: RequestId) {
        if !self.inner.controller.complete(id) {
            return;
        }
        let finished = self.commit(|state, changes| {
            let finished = state.store.finalize_streaming().cloned();
            if state.is_loading {
                state.is_loading = false;
                changes.loading = true;
            }
            finished
        });
        if let (Some(cb), Some(message)) = (&self.inner.callbacks.on_finish, finished) {
            cb(&message);
        }
    }

    fn finish_failed(&self, id: RequestId, err: ChatError) {
        if !self.inner.controller.fail(id) {
            return;
        }
        let err = Arc::new(err);
        self.commit(|state, changes| {
            if state.store.is_streaming() {
                // Keep partial content; drop the tail if nothing ever landed.
                let empty = state
                    .store
                    .last()
                    .map(|message| message.content.is_empty())
                    .unwrap_or(false);
                state.store.finalize_streaming();
                if empty {
                    state.store.remove_last();
                    changes.messages = true;
                }
            }
            if state.is_loading {
                state.is_loading = false;
                changes.loading = true;
            }
            state.error = Some(err.clone());
            changes.error = true;
        });
        if let Some(cb) = &self.inner.callbacks.on_error {
            cb(&err);
        }
    }

    /// Apply a state transition under the lock, then fire change callbacks
    /// outside it, in the fixed order messages → loading → error, so a
    /// consumer snapshotting all three mid-callback sees a consistent triple.
    fn commit<R>(&self, f: impl FnOnce(&mut SessionState, &mut Changes) -> R) -> R {
        let mut changes = Changes::default();
        let (result, messages, loading, error) = {
            let mut state = self.inner.state.lock().unwrap();
            let result = f(&mut state, &mut changes);
            let messages = changes.messages.then(|| state.store.snapshot());
            let loading = changes.loading.then_some(state.is_loading);
            let error = changes.error.then(|| state.error.clone());
            (result, messages, loading, error)
        };
        if let (Some(cb), Some(messages)) = (&self.inner.callbacks.on_messages_change, &messages) {
            cb(messages);
        }
        if let (Some(cb), Some(loading)) = (&self.inner.callbacks.on_loading_change, loading) {
            cb(loading);
        }
        if let (Some(cb), Some(error)) = (&self.inner.callbacks.on_error_change, error) {
            cb(error);
        }
        result
    }
}

#[cfg(test)]
#[path = "../tests/session_tests.rs"]
mod session_tests;
