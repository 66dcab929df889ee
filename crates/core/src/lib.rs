pub mod connection;
pub mod error;
pub mod request;
pub mod session;
pub mod store;

pub use crate::chat_core::connection::{ChunkStream, Connection};
pub use crate::chat_core::error::{
    build_http_status_transport_error, http_status_fallback_message, ChatError, TransportError,
};
pub use crate::chat_core::request::{RequestController, RequestId, RequestState};
pub use crate::chat_core::session::{BusyPolicy, ChatSession, ChatSessionOptions};
pub use crate::chat_core::store::MessageStore;

#[cfg(test)]
#[path = "../tests/request_tests.rs"]
mod request_tests;
#[cfg(test)]
#[path = "../tests/store_tests.rs"]
mod store_tests;
