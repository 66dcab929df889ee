//! reqwest-backed [`Connection`]: POST the conversation as JSON and consume
//! the SSE response body as a chunk stream.

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tracing::debug;

use crate::chat_core::connection::{ChunkStream, Connection};
use crate::chat_core::error::{build_http_status_transport_error, ChatError, TransportError};
use crate::chat_streaming_sse::{parse_chunk, SseStreamExt};
use crate::chat_types::ChatRequestBody;

#[derive(Clone, Debug)]
pub struct ConnectionConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Overall request timeout. Streaming responses usually want `None`.
    pub request_timeout: Option<Duration>,
    /// Extra headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: None,
            headers: Vec::new(),
        }
    }
}

pub struct SseConnection {
    client: Client,
    url: String,
    cfg: ConnectionConfig,
}

impl SseConnection {
    pub fn try_new(url: impl Into<String>, cfg: ConnectionConfig) -> Result<Self, TransportError> {
        let mut builder = Client::builder().connect_timeout(cfg.connect_timeout);
        if let Some(request_timeout) = cfg.request_timeout {
            builder = builder.timeout(request_timeout);
        }
        let client = builder
            .build()
            .map_err(|err| TransportError::Other(format!("reqwest client build failed: {err}")))?;
        Ok(Self {
            client,
            url: url.into(),
            cfg,
        })
    }

    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        match Self::try_new(url.clone(), ConnectionConfig::default()) {
            Ok(connection) => connection,
            Err(err) => {
                debug!(
                    target: "chat_client::transport",
                    error = %err,
                    "falling back to reqwest::Client::new after client init failure"
                );
                Self {
                    client: Client::new(),
                    url,
                    cfg: ConnectionConfig::default(),
                }
            }
        }
    }
}

#[async_trait]
impl Connection for SseConnection {
    async fn connect(&self, body: &ChatRequestBody) -> Result<ChunkStream, ChatError> {
        let mut request = self.client.post(&self.url).json(body);
        for (name, value) in &self.cfg.headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|err| TransportError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(build_http_status_transport_error(status.as_u16(), body_text).into());
        }
        debug!(
            target: "chat_client::transport",
            url = %self.url,
            status = status.as_u16(),
            "chat stream opened"
        );

        let mut events = Box::pin(response.bytes_stream()).into_sse_stream();
        let stream = try_stream! {
            while let Some(event) = events.next().await {
                let event = event.map_err(|err| TransportError::BodyRead(err.to_string()))?;
                match parse_chunk(&event)? {
                    Some(parsed) => yield parsed,
                    // [DONE]: the backend is finished with this turn.
                    None => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}
