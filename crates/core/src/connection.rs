//! Transport seam between the session and a chat backend.

use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;

use crate::chat_core::error::ChatError;
use crate::chat_types::{ChatRequestBody, StreamChunk};

/// Ordered chunk stream for one request. Ends after the terminal condition:
/// either the stream closes normally (completion) or yields an `Err`.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ChatError>> + Send>>;

/// A way to reach a chat backend. Implementations own the wire format and
/// any timeout policy; the session only requires ordered chunk delivery.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self, body: &ChatRequestBody) -> Result<ChunkStream, ChatError>;
}
