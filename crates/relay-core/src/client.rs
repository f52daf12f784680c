use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::config::RelayConfig;
use crate::errors::RelayError;
use crate::parser::try_parse_json;
use crate::relay::RelayStream;
use crate::source::{AgentTransport, InvocationRequest};

/// Entry point for invoking a remote agent, blocking or streamed.
///
/// Cheap to clone; share one per process and pass it where it is needed.
#[derive(Clone)]
pub struct AgentClient {
    transport: Arc<dyn AgentTransport>,
    relay: RelayConfig,
}

impl AgentClient {
    pub fn new(transport: Arc<dyn AgentTransport>, relay: RelayConfig) -> Self {
        Self { transport, relay }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn relay_config(&self) -> &RelayConfig {
        &self.relay
    }

    /// Invokes the agent and returns its complete response text.
    pub async fn invoke(
        &self,
        prompt: &str,
        session_id: &str,
        actor_id: &str,
    ) -> Result<String, RelayError> {
        validate(prompt, session_id)?;
        debug!(session_id, transport = self.transport.name(), "invoking agent");
        let request = InvocationRequest::new(prompt, session_id, actor_id);
        let body = self.transport.invoke(request).await?;
        let text = body.read_to_string().await?;
        Ok(extract_text(&text))
    }

    /// Starts a streamed invocation. The returned stream owns the producer.
    pub fn invoke_stream(
        &self,
        prompt: &str,
        session_id: &str,
        actor_id: &str,
    ) -> Result<RelayStream, RelayError> {
        validate(prompt, session_id)?;
        let request = InvocationRequest::new(prompt, session_id, actor_id).streaming(true);
        Ok(RelayStream::spawn(
            self.transport.clone(),
            request,
            &self.relay,
        ))
    }
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("transport", &self.transport.name())
            .field("relay", &self.relay)
            .finish()
    }
}

fn validate(prompt: &str, session_id: &str) -> Result<(), RelayError> {
    if prompt.trim().is_empty() {
        return Err(RelayError::Validation("prompt must not be empty".into()));
    }
    if session_id.trim().is_empty() {
        return Err(RelayError::Validation(
            "session_id must not be empty".into(),
        ));
    }
    Ok(())
}

/// Text of a blocking response.
///
/// The runtime JSON-encodes its return value, so a body that is a JSON string
/// is unwrapped once and an object with an `output` string yields that field.
/// Anything else is returned as-is.
pub fn extract_text(body: &str) -> String {
    match try_parse_json(body.trim()) {
        Ok(Value::String(text)) => text,
        Ok(Value::Object(map)) => match map.get("output").and_then(Value::as_str) {
            Some(output) => output.to_string(),
            None => body.to_string(),
        },
        _ => body.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use crate::source::{ReplayTransport, ResponseBody};

    struct FailingTransport;

    #[async_trait::async_trait]
    impl AgentTransport for FailingTransport {
        fn name(&self) -> &str {
            "failing"
        }

        async fn invoke(&self, _request: InvocationRequest) -> Result<ResponseBody, TransportError> {
            Err(TransportError::status(429, "ThrottlingException"))
        }
    }

    fn client(transport: impl AgentTransport + 'static) -> AgentClient {
        AgentClient::new(Arc::new(transport), RelayConfig::default())
    }

    #[test]
    fn extract_text_unwraps_json_string_once() {
        assert_eq!(extract_text("\"Hello\\nthere\""), "Hello\nthere");
        assert_eq!(extract_text("\"\\\"quoted\\\"\""), "\"quoted\"");
        assert_eq!(extract_text("{\"output\":\"done\"}"), "done");
        assert_eq!(extract_text("{\"other\":1}"), "{\"other\":1}");
        assert_eq!(extract_text("plain words"), "plain words");
    }

    #[tokio::test]
    async fn invoke_returns_decoded_body() {
        let text = client(ReplayTransport::whole("\"The answer is 4.\""))
            .invoke("what is 2+2", "s1", "default")
            .await
            .expect("invoke");
        assert_eq!(text, "The answer is 4.");
    }

    #[tokio::test]
    async fn invoke_rejects_blank_inputs() {
        let client = client(ReplayTransport::whole(""));
        assert!(matches!(
            client.invoke("  ", "s1", "default").await,
            Err(RelayError::Validation(msg)) if msg.contains("prompt")
        ));
        assert!(matches!(
            client.invoke_stream("hi", "", "default"),
            Err(RelayError::Validation(msg)) if msg.contains("session_id")
        ));
    }

    #[tokio::test]
    async fn invoke_surfaces_transport_errors() {
        let err = client(FailingTransport)
            .invoke("hi", "s1", "default")
            .await
            .expect_err("throttled");
        assert!(matches!(
            err,
            RelayError::Transport(TransportError::Status { status_code: 429, .. })
        ));
    }

    #[tokio::test]
    async fn invoke_stream_starts_with_session() {
        let mut stream = client(ReplayTransport::whole(""))
            .invoke_stream("hi", "s-42", "default")
            .expect("stream");
        let first = stream.next_event().await.expect("start");
        assert_eq!(first.name, "start");
        assert_eq!(first.data["session_id"], "s-42");
    }
}
