use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt as _, Stream, StreamExt as _};

use crate::errors::TransportError;

/// One remote agent invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvocationRequest {
    pub prompt: String,
    pub session_id: String,
    pub actor_id: String,
    /// Ask the runtime for an SSE response instead of a single body.
    pub stream: bool,
}

impl InvocationRequest {
    pub fn new(
        prompt: impl Into<String>,
        session_id: impl Into<String>,
        actor_id: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            session_id: session_id.into(),
            actor_id: actor_id.into(),
            stream: false,
        }
    }

    pub fn streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// JSON body understood by the agent runtime entrypoint.
    pub fn payload(&self) -> serde_json::Value {
        serde_json::json!({
            "prompt": self.prompt,
            "session_id": self.session_id,
            "actor_id": self.actor_id,
            "stream": self.stream,
        })
    }
}

/// Response that supports incremental pulls.
pub struct ChunkedSource {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>,
}

impl ChunkedSource {
    pub fn new(stream: impl Stream<Item = Result<Bytes, TransportError>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Stream for ChunkedSource {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for ChunkedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedSource").finish_non_exhaustive()
    }
}

/// Response that only supports one read to completion.
pub struct WholeBodySource {
    read: BoxFuture<'static, Result<Bytes, TransportError>>,
}

impl WholeBodySource {
    pub fn new(read: impl Future<Output = Result<Bytes, TransportError>> + Send + 'static) -> Self {
        Self {
            read: read.boxed(),
        }
    }

    pub fn ready(body: impl Into<Bytes>) -> Self {
        Self::new(futures::future::ready(Ok(body.into())))
    }

    pub async fn read(self) -> Result<Bytes, TransportError> {
        self.read.await
    }
}

impl fmt::Debug for WholeBodySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WholeBodySource").finish_non_exhaustive()
    }
}

/// Response body of an invocation. The variant is fixed when the transport
/// returns; consumers never re-check it per chunk.
#[derive(Debug)]
pub enum ResponseBody {
    Chunked(ChunkedSource),
    Whole(WholeBodySource),
}

impl ResponseBody {
    /// Reads the whole body regardless of variant.
    pub async fn read_to_string(self) -> Result<String, TransportError> {
        let bytes = match self {
            ResponseBody::Whole(source) => source.read().await?.to_vec(),
            ResponseBody::Chunked(mut source) => {
                let mut buf = Vec::new();
                while let Some(chunk) = source.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                buf
            }
        };
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Remote agent runtime seen by the relay.
#[async_trait::async_trait]
pub trait AgentTransport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Starts an invocation. Errors here happen before any body is read.
    async fn invoke(&self, request: InvocationRequest) -> Result<ResponseBody, TransportError>;
}

/// Serves a captured response body, either whole or in fixed-size chunks.
///
/// Used for offline replays and for exercising the relay without a runtime.
#[derive(Clone, Debug)]
pub struct ReplayTransport {
    body: Bytes,
    chunk_size: Option<usize>,
}

impl ReplayTransport {
    /// Replays `body` as a single blocking read.
    pub fn whole(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            chunk_size: None,
        }
    }

    /// Replays `body` as chunks of at most `chunk_size` bytes.
    pub fn chunked(body: impl Into<Bytes>, chunk_size: usize) -> Self {
        Self {
            body: body.into(),
            chunk_size: Some(chunk_size.max(1)),
        }
    }
}

#[async_trait::async_trait]
impl AgentTransport for ReplayTransport {
    fn name(&self) -> &str {
        "replay"
    }

    async fn invoke(&self, _request: InvocationRequest) -> Result<ResponseBody, TransportError> {
        let Some(size) = self.chunk_size else {
            return Ok(ResponseBody::Whole(WholeBodySource::ready(self.body.clone())));
        };
        let chunks: Vec<Result<Bytes, TransportError>> = self
            .body
            .chunks(size)
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
            .collect();
        Ok(ResponseBody::Chunked(ChunkedSource::new(futures::stream::iter(
            chunks,
        ))))
    }
}
