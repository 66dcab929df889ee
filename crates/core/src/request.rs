//! Request lifecycle bookkeeping: at most one stream is live per controller.
//!
//! Each request gets a monotone identity. Every event a drive loop wants to
//! apply is first checked with [`RequestController::is_current`]; events from
//! a cancelled or superseded request fail the check and must be discarded, so
//! a slow stale stream can never resurrect content after a newer request has
//! started.

use std::sync::Mutex;

use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Streaming,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug)]
struct ControllerInner {
    seq: u64,
    current: Option<u64>,
    state: RequestState,
}

#[derive(Debug)]
pub struct RequestController {
    inner: Mutex<ControllerInner>,
    /// Bumped on every cancellation or supersede so suspended drive loops
    /// wake up instead of waiting on a transport that may never yield again.
    cancel_tx: watch::Sender<u64>,
}

impl Default for RequestController {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestController {
    pub fn new() -> Self {
        let (cancel_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(ControllerInner {
                seq: 0,
                current: None,
                state: RequestState::Idle,
            }),
            cancel_tx,
        }
    }

    /// Subscribe to cancellation wakeups. A change notification means every
    /// request begun before the subscription is stale.
    pub fn cancel_signal(&self) -> watch::Receiver<u64> {
        self.cancel_tx.subscribe()
    }

    /// Start a new request, superseding any active one.
    pub fn begin(&self) -> RequestId {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == RequestState::Streaming {
            debug!(
                target: "chat_client::request",
                superseded = ?inner.current,
                "cancelling active request before starting a new one"
            );
        }
        inner.seq += 1;
        inner.current = Some(inner.seq);
        inner.state = RequestState::Streaming;
        let id = RequestId(inner.seq);
        drop(inner);
        self.cancel_tx.send_modify(|epoch| *epoch += 1);
        id
    }

    /// Whether events tagged with `id` should still be applied.
    pub fn is_current(&self, id: RequestId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == RequestState::Streaming && inner.current == Some(id.0)
    }

    /// Cancel the active request. Idempotent: returns `false` (and changes
    /// nothing) when no request is streaming.
    pub fn cancel(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != RequestState::Streaming {
            return false;
        }
        inner.state = RequestState::Cancelled;
        inner.current = None;
        drop(inner);
        self.cancel_tx.send_modify(|epoch| *epoch += 1);
        true
    }

    /// Mark the request finished successfully. Ignored when stale.
    pub fn complete(&self, id: RequestId) -> bool {
        self.finish(id, RequestState::Succeeded)
    }

    /// Mark the request failed. Ignored when stale.
    pub fn fail(&self, id: RequestId) -> bool {
        self.finish(id, RequestState::Failed)
    }

    fn finish(&self, id: RequestId, state: RequestState) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != RequestState::Streaming || inner.current != Some(id.0) {
            debug!(
                target: "chat_client::request",
                request = id.0,
                "ignoring terminal event for stale request"
            );
            return false;
        }
        inner.state = state;
        inner.current = None;
        true
    }

    pub fn state(&self) -> RequestState {
        self.inner.lock().unwrap().state
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == RequestState::Streaming
    }
}
