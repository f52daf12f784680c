use futures::StreamExt as _;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use tracing::debug;

use crate::errors::{RelayError, TransportError};
use crate::source::{AgentTransport, ChunkedSource, InvocationRequest, ResponseBody, WholeBodySource};

use super::config::RuntimeConfig;

/// Header the runtime uses to pin an invocation to a session.
pub const SESSION_HEADER: &str = "X-Amzn-Bedrock-AgentCore-Runtime-Session-Id";

/// [`AgentTransport`] over the runtime's HTTP invocations endpoint.
pub struct HttpAgentTransport {
    client: reqwest::Client,
    config: RuntimeConfig,
    url: String,
}

impl HttpAgentTransport {
    pub fn new(config: RuntimeConfig) -> Result<Self, RelayError> {
        let url = config.invocations_url()?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| RelayError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            config,
            url,
        })
    }

    pub fn from_env() -> Result<Self, RelayError> {
        Self::new(RuntimeConfig::from_env()?)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl AgentTransport for HttpAgentTransport {
    fn name(&self) -> &str {
        "agentcore-http"
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<ResponseBody, TransportError> {
        debug!(session_id = %request.session_id, stream = request.stream, url = %self.url, "invoking agent runtime");
        let accept = if request.stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        let mut http_req = self
            .client
            .post(&self.url)
            .header(SESSION_HEADER, &request.session_id)
            .header(ACCEPT, accept)
            .json(&request.payload());
        if let Some(token) = self.config.bearer_token.as_deref() {
            http_req = http_req.bearer_auth(token);
        }
        if !request.stream {
            http_req = http_req.timeout(self.config.timeout);
        }

        let response = http_req
            .send()
            .await
            .map_err(|e| TransportError::request(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::status(status.as_u16(), body));
        }

        if is_event_stream(response.headers()) {
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| TransportError::read(e.to_string())));
            Ok(ResponseBody::Chunked(ChunkedSource::new(stream)))
        } else {
            Ok(ResponseBody::Whole(WholeBodySource::new(async move {
                response
                    .bytes()
                    .await
                    .map_err(|e| TransportError::read(e.to_string()))
            })))
        }
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().to_ascii_lowercase().starts_with("text/event-stream"))
}
