use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tokio::sync::mpsc;

use crate::chat_core::connection::{ChunkStream, Connection};
use crate::chat_core::error::{ChatError, TransportError};
use crate::chat_core::request::RequestState;
use crate::chat_core::session::{BusyPolicy, ChatSession, ChatSessionOptions};
use crate::chat_types::{ChatRequestBody, Message, Role, StreamChunk, WireError};

type ScriptItem = Result<StreamChunk, ChatError>;

fn text(fragment: &str) -> ScriptItem {
    Ok(StreamChunk::Text {
        content: fragment.into(),
    })
}

fn wire_error(kind: &str, message: &str) -> ScriptItem {
    Ok(StreamChunk::Error {
        error: WireError {
            kind: kind.into(),
            message: message.into(),
        },
    })
}

/// Replays one fixed script per `connect` call, in order.
struct ScriptedConnection {
    scripts: Mutex<Vec<Vec<ScriptItem>>>,
}

impl ScriptedConnection {
    fn new(scripts: Vec<Vec<ScriptItem>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts),
        })
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn connect(&self, _body: &ChatRequestBody) -> Result<ChunkStream, ChatError> {
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                return Err(TransportError::Other("no script left".into()).into());
            }
            scripts.remove(0)
        };
        Ok(Box::pin(stream::iter(script)))
    }
}

type Feed = mpsc::UnboundedSender<ScriptItem>;

/// Hands out one externally-fed stream per `connect` call, so tests control
/// delivery timing. The stream ends (completion) when its sender drops.
struct ChannelConnection {
    receivers: Mutex<Vec<mpsc::UnboundedReceiver<ScriptItem>>>,
}

impl ChannelConnection {
    fn new(count: usize) -> (Vec<Feed>, Arc<Self>) {
        let mut senders = Vec::new();
        let mut receivers = Vec::new();
        for _ in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }
        (
            senders,
            Arc::new(Self {
                receivers: Mutex::new(receivers),
            }),
        )
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    async fn connect(&self, _body: &ChatRequestBody) -> Result<ChunkStream, ChatError> {
        let rx = {
            let mut receivers = self.receivers.lock().unwrap();
            if receivers.is_empty() {
                return Err(TransportError::Other("no stream left".into()).into());
            }
            receivers.remove(0)
        };
        Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn session_with(connection: Arc<dyn Connection>) -> ChatSession {
    ChatSession::new(ChatSessionOptions::new(connection))
}

fn content_of(messages: &[Message], index: usize) -> String {
    messages[index].content.text()
}

// ---------- scenarios ----------

#[tokio::test]
async fn happy_path_streams_an_assistant_reply() {
    let session = session_with(ScriptedConnection::new(vec![vec![text("4")]]));
    session.send_message("2+2?").await;

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(content_of(&messages, 0), "2+2?");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(content_of(&messages, 1), "4");
    assert!(!session.is_loading());
    assert!(session.error().is_none());
    assert_eq!(session.request_state(), RequestState::Succeeded);
}

#[tokio::test]
async fn deltas_concatenate_in_arrival_order() {
    let fragments = ["Once", " upon", " a", " time"];
    let script = fragments.iter().map(|f| text(f)).collect();
    let session = session_with(ScriptedConnection::new(vec![script]));
    session.send_message("tell a story").await;

    let messages = session.messages();
    assert_eq!(content_of(&messages, 1), fragments.concat());
}

#[tokio::test]
async fn upstream_error_without_deltas_leaves_no_assistant_message() {
    let session = session_with(ScriptedConnection::new(vec![vec![wire_error(
        "RateLimitError",
        "rate limited",
    )]]));
    session.send_message("x").await;

    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert!(!session.is_loading());
    let error = session.error().expect("error should be set");
    assert!(matches!(
        &*error,
        ChatError::Upstream { message, .. } if message == "rate limited"
    ));
    assert_eq!(session.request_state(), RequestState::Failed);
}

#[tokio::test]
async fn transport_failure_mid_stream_keeps_partial_content() {
    let session = session_with(ScriptedConnection::new(vec![vec![
        text("par"),
        Err(TransportError::StreamClosed.into()),
    ]]));
    session.send_message("go").await;

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(content_of(&messages, 1), "par");
    assert!(matches!(
        &*session.error().unwrap(),
        ChatError::Transport(TransportError::StreamClosed)
    ));
}

#[tokio::test]
async fn connect_failure_is_absorbed_into_error_state() {
    // Empty script list: connect itself fails.
    let session = session_with(ScriptedConnection::new(Vec::new()));
    session.send_message("hi").await;

    assert_eq!(session.messages().len(), 1);
    assert!(!session.is_loading());
    assert!(session.error().is_some());
}

#[tokio::test]
async fn stop_mid_stream_keeps_what_streamed() {
    let (feeds, connection) = ChannelConnection::new(1);
    let session = session_with(connection);
    let turn = {
        let session = session.clone();
        tokio::spawn(async move { session.send_message("tell a story").await })
    };

    feeds[0].send(text("Once")).unwrap();
    feeds[0].send(text(" upon")).unwrap();
    {
        let session = session.clone();
        wait_until(move || {
            let messages = session.messages();
            messages.len() == 2 && messages[1].content.text() == "Once upon"
        })
        .await;
    }

    session.stop();
    assert!(!session.is_loading());
    assert_eq!(session.request_state(), RequestState::Cancelled);

    // Late events for the cancelled request must not resurrect content. The
    // receiver may already be gone, so a send error is fine here.
    let _ = feeds[0].send(text(" a time"));
    turn.await.unwrap();

    let messages = session.messages();
    assert_eq!(content_of(&messages, 1), "Once upon");
    assert!(session.error().is_none());
}

#[tokio::test]
async fn stop_resolves_a_turn_with_a_silent_transport() {
    let (feeds, connection) = ChannelConnection::new(1);
    let session = session_with(connection);
    let turn = {
        let session = session.clone();
        tokio::spawn(async move { session.send_message("hello?").await })
    };
    {
        let session = session.clone();
        wait_until(move || session.is_loading()).await;
    }

    // No events are ever fed; stop alone must complete the turn.
    session.stop();
    turn.await.unwrap();
    assert!(!session.is_loading());
    drop(feeds);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deltas_racing_stop_never_mutate_after_cancel() {
    // Feed deltas from one thread while stopping from another. A delta that
    // slips past the drive loop's identity check must still lose to the
    // concurrently committed stop: nothing mutates after stop() returns and
    // no open streaming tail is left behind.
    for _ in 0..200 {
        let (mut feeds, connection) = ChannelConnection::new(1);
        let session = session_with(connection);
        let turn = {
            let session = session.clone();
            tokio::spawn(async move { session.send_message("race").await })
        };
        let feed = feeds.remove(0);
        let feeder = tokio::spawn(async move {
            for _ in 0..10_000 {
                if feed.send(text("x")).is_err() {
                    break;
                }
                tokio::task::yield_now().await;
            }
        });
        {
            let session = session.clone();
            wait_until(move || session.is_loading()).await;
        }

        session.stop();
        let frozen = session.messages();
        turn.await.unwrap();
        feeder.await.unwrap();

        assert_eq!(session.messages(), frozen);
        assert_eq!(session.request_state(), RequestState::Cancelled);

        // A leaked streaming tail would make this append fail.
        session.append(Message::assistant("after")).await;
        assert!(session.error().is_none());
        assert_eq!(session.messages().len(), frozen.len() + 1);
    }
}

#[tokio::test]
async fn stop_when_idle_is_a_no_op() {
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = events.clone();
    let options = ChatSessionOptions::new(ScriptedConnection::new(Vec::new()))
        .on_loading_change(move |_| recorded.lock().unwrap().push("loading"));
    let session = ChatSession::new(options);

    session.stop();
    assert!(!session.is_loading());
    assert!(session.error().is_none());
    assert_eq!(session.request_state(), RequestState::Idle);
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn new_send_cancels_the_outstanding_request() {
    let (feeds, connection) = ChannelConnection::new(2);
    let session = session_with(connection);

    let first_turn = {
        let session = session.clone();
        tokio::spawn(async move { session.send_message("first").await })
    };
    feeds[0].send(text("Hel")).unwrap();
    {
        let session = session.clone();
        wait_until(move || {
            let messages = session.messages();
            messages.len() == 2 && messages[1].content.text() == "Hel"
        })
        .await;
    }

    let second_turn = {
        let session = session.clone();
        tokio::spawn(async move { session.send_message("second").await })
    };
    {
        let session = session.clone();
        wait_until(move || {
            session.messages().len() == 3 && session.request_state() == RequestState::Streaming
        })
        .await;
    }

    // Stale deltas from the superseded request are discarded.
    let _ = feeds[0].send(text("XXX"));

    feeds[1].send(text("World")).unwrap();
    drop(feeds);
    first_turn.await.unwrap();
    second_turn.await.unwrap();

    let messages = session.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(content_of(&messages, 1), "Hel");
    assert_eq!(content_of(&messages, 2), "second");
    assert_eq!(content_of(&messages, 3), "World");
    assert!(!messages.iter().any(|m| m.content.text().contains("XXX")));
    assert_eq!(session.request_state(), RequestState::Succeeded);
}

#[tokio::test]
async fn reject_policy_drops_sends_while_busy() {
    let (feeds, connection) = ChannelConnection::new(1);
    let options = ChatSessionOptions::new(connection).busy(BusyPolicy::Reject);
    let session = ChatSession::new(options);

    let turn = {
        let session = session.clone();
        tokio::spawn(async move { session.send_message("first").await })
    };
    feeds[0].send(text("Hi")).unwrap();
    {
        let session = session.clone();
        wait_until(move || session.messages().len() == 2).await;
    }

    session.send_message("second").await;
    assert_eq!(session.messages().len(), 2);
    assert!(session.is_loading());

    drop(feeds);
    turn.await.unwrap();
    assert_eq!(session.messages().len(), 2);
}

#[tokio::test]
async fn reload_replaces_the_assistant_turn() {
    let session = session_with(ScriptedConnection::new(vec![
        vec![text("hello")],
        vec![text("hello again")],
    ]));
    session.send_message("hi").await;
    session.reload().await;

    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(content_of(&messages, 0), "hi");
    assert_eq!(content_of(&messages, 1), "hello again");
}

#[tokio::test]
async fn reload_retries_after_an_error() {
    let session = session_with(ScriptedConnection::new(vec![
        vec![wire_error("ServerError", "boom")],
        vec![text("recovered")],
    ]));
    session.send_message("x").await;
    assert!(session.error().is_some());

    session.reload().await;
    let messages = session.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(content_of(&messages, 1), "recovered");
    assert!(session.error().is_none());
}

#[tokio::test]
async fn reload_without_a_user_message_is_a_no_op() {
    let session = session_with(ScriptedConnection::new(Vec::new()));
    session.reload().await;
    assert!(session.messages().is_empty());
    assert_eq!(session.request_state(), RequestState::Idle);

    session.set_messages(vec![Message::system("be brief")]);
    session.reload().await;
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.request_state(), RequestState::Idle);
}

#[tokio::test]
async fn append_of_non_user_message_records_state_only() {
    let session = session_with(ScriptedConnection::new(Vec::new()));
    session
        .append(Message::assistant("seeded greeting"))
        .await;

    assert_eq!(session.messages().len(), 1);
    assert!(!session.is_loading());
    assert!(session.error().is_none());
    assert_eq!(session.request_state(), RequestState::Idle);
}

#[tokio::test]
async fn append_of_invalid_message_sets_validation_error() {
    let session = session_with(ScriptedConnection::new(vec![vec![text("unused")]]));
    session.append(Message::user("x").with_id("")).await;

    assert!(session.messages().is_empty());
    assert!(!session.is_loading());
    assert!(session.error().unwrap().is_validation());
    // The request was never started.
    assert_eq!(session.request_state(), RequestState::Idle);
}

#[tokio::test]
async fn set_messages_cancels_the_inflight_request() {
    let (feeds, connection) = ChannelConnection::new(1);
    let session = session_with(connection);
    let turn = {
        let session = session.clone();
        tokio::spawn(async move { session.send_message("old").await })
    };
    feeds[0].send(text("partial")).unwrap();
    {
        let session = session.clone();
        wait_until(move || session.messages().len() == 2).await;
    }

    session.set_messages(vec![Message::user("restored")]);
    assert!(!session.is_loading());
    assert_eq!(session.request_state(), RequestState::Cancelled);

    let _ = feeds[0].send(text("stale"));
    turn.await.unwrap();

    let messages = session.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(content_of(&messages, 0), "restored");
}

#[tokio::test]
async fn clear_resets_messages_and_error() {
    let session = session_with(ScriptedConnection::new(vec![vec![wire_error(
        "ServerError",
        "boom",
    )]]));
    session.send_message("x").await;
    assert!(session.error().is_some());

    session.clear();
    assert!(session.messages().is_empty());
    assert!(session.error().is_none());
    assert!(!session.is_loading());
}

#[tokio::test]
async fn blank_input_is_ignored() {
    let session = session_with(ScriptedConnection::new(Vec::new()));
    session.send_message("   ").await;
    assert!(session.messages().is_empty());
    assert_eq!(session.request_state(), RequestState::Idle);
}

#[tokio::test]
async fn input_is_trimmed_before_sending() {
    let session = session_with(ScriptedConnection::new(vec![vec![text("hi")]]));
    session.send_message("  hello  ").await;
    assert_eq!(content_of(&session.messages(), 0), "hello");
}

#[tokio::test]
async fn change_callbacks_fire_in_fixed_order() {
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let (messages_log, loading_log, error_log) = (events.clone(), events.clone(), events.clone());
    let options = ChatSessionOptions::new(ScriptedConnection::new(vec![vec![text("4")]]))
        .on_messages_change(move |_| messages_log.lock().unwrap().push("messages"))
        .on_loading_change(move |_| loading_log.lock().unwrap().push("loading"))
        .on_error_change(move |_| error_log.lock().unwrap().push("error"));
    let session = ChatSession::new(options);

    session.send_message("2+2?").await;

    // append user → messages; request start → loading; one delta → messages;
    // completion → loading. No error transition in the happy path.
    assert_eq!(
        *events.lock().unwrap(),
        vec!["messages", "loading", "messages", "loading"]
    );
}

#[tokio::test]
async fn observers_see_a_consistent_triple_mid_callback() {
    let session_slot: Arc<Mutex<Option<ChatSession>>> = Arc::new(Mutex::new(None));
    let observed: Arc<Mutex<Vec<(usize, bool)>>> = Arc::new(Mutex::new(Vec::new()));
    let (slot, log) = (session_slot.clone(), observed.clone());
    let options = ChatSessionOptions::new(ScriptedConnection::new(vec![vec![text("4")]]))
        .on_loading_change(move |loading| {
            if let Some(session) = slot.lock().unwrap().as_ref() {
                log.lock().unwrap().push((session.messages().len(), loading));
            }
        });
    let session = ChatSession::new(options);
    *session_slot.lock().unwrap() = Some(session.clone());

    session.send_message("2+2?").await;

    let observed = observed.lock().unwrap();
    // Loading flipped on after the user message was visible, and off after
    // the assistant message was visible.
    assert_eq!(*observed, vec![(1, true), (2, false)]);
}

#[tokio::test]
async fn finish_callback_receives_the_final_message() {
    let finished: Arc<Mutex<Option<Message>>> = Arc::new(Mutex::new(None));
    let log = finished.clone();
    let options = ChatSessionOptions::new(ScriptedConnection::new(vec![vec![
        text("Once"),
        text(" upon"),
    ]]))
    .on_finish(move |message| *log.lock().unwrap() = Some(message.clone()));
    let session = ChatSession::new(options);

    session.send_message("story").await;
    let message = finished.lock().unwrap().clone().expect("on_finish fired");
    assert_eq!(message.role, Role::Assistant);
    assert_eq!(message.content.text(), "Once upon");
}

#[tokio::test]
async fn error_callback_fires_on_failure() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let options = ChatSessionOptions::new(ScriptedConnection::new(vec![vec![wire_error(
        "ServerError",
        "boom",
    )]]))
    .on_error(move |error| log.lock().unwrap().push(error.to_string()));
    let session = ChatSession::new(options);

    session.send_message("x").await;
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("boom"));
}

#[tokio::test]
async fn initial_messages_seed_the_conversation() {
    let options = ChatSessionOptions::new(ScriptedConnection::new(vec![vec![text("sure")]]))
        .initial_messages(vec![Message::system("be brief")])
        .id("restored-chat");
    let session = ChatSession::new(options);
    assert_eq!(session.id(), "restored-chat");

    session.send_message("ok?").await;
    let messages = session.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].role, Role::System);
}
