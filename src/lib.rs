#[path = "../crates/chat-types/src/lib.rs"]
pub mod types;
#[path = "../crates/core/src/lib.rs"]
pub mod core;
#[path = "../crates/streaming-sse/src/lib.rs"]
pub mod streaming_sse;
#[cfg(feature = "reqwest")]
#[path = "../crates/transports/reqwest/src/lib.rs"]
pub mod transport_reqwest;
#[path = "../crates/reactive/src/lib.rs"]
pub mod reactive;

#[cfg(feature = "reqwest")]
pub mod transports {
    pub use crate::transport_reqwest as reqwest;
}

pub(crate) use crate::core as chat_core;
#[allow(unused_imports)]
pub(crate) use crate::reactive as chat_reactive;
pub(crate) use crate::streaming_sse as chat_streaming_sse;
pub(crate) use crate::types as chat_types;
#[cfg(feature = "reqwest")]
#[allow(unused_imports)]
pub(crate) use crate::transport_reqwest as reqwest_transport;

pub use crate::core::{
    BusyPolicy, ChatError, ChatSession, ChatSessionOptions, ChunkStream, Connection,
    MessageStore, RequestController, RequestId, RequestState, TransportError,
};
pub use crate::reactive::{ChatHandle, ChatHandleOptions};
pub use crate::types::{
    ChatRequestBody, Message, MessageContent, MessageDelta, MessagePart, Role, StreamChunk,
    ToolCallChunk, ToolCallFunction, WireError,
};
#[cfg(feature = "reqwest")]
pub use crate::transport_reqwest::{ConnectionConfig, SseConnection};
