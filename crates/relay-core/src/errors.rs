use std::time::Duration;

/// Errors raised while constructing an [`Event`](crate::Event).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    /// Payload could not be serialized, or did not serialize to a JSON object.
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

/// A `data:` line (or whole body) that failed JSON decoding.
///
/// Never propagated out of the parser; decode sites branch on it and fall back
/// to a `{"raw": ...}` payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed chunk ({reason}): {text}")]
pub struct MalformedChunk {
    pub text: String,
    pub reason: String,
}

/// Errors returned by an [`AgentTransport`](crate::AgentTransport) while
/// invoking the remote agent or reading its response.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Request could not be sent (connect, DNS, TLS, client timeout).
    #[error("agent request failed: {message}")]
    Request { message: String },
    /// Runtime answered with a non-success status (auth, throttling, etc.).
    #[error("agent runtime returned status {status_code}: {message}")]
    Status { status_code: u16, message: String },
    /// Response body read failed midway.
    #[error("agent response read failed: {message}")]
    Read { message: String },
}

impl TransportError {
    /// Creates a request-level error.
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    /// Creates a status error.
    pub fn status(status_code: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status_code,
            message: message.into(),
        }
    }

    /// Creates a body read error.
    pub fn read(message: impl Into<String>) -> Self {
        Self::Read {
            message: message.into(),
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Request { message } | Self::Status { message, .. } | Self::Read { message } => {
                message
            }
        }
    }
}

/// Terminal failure classification logged with every relay error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayFailure {
    /// Remote invocation failed (network, auth, throttling, body read).
    #[error("transport failure: {message}")]
    Transport { message: String },
    /// Consumer waited past the session deadline.
    #[error("stream stalled: {message}")]
    StallTimeout { message: String },
    /// Producer task ended without pushing a sentinel.
    #[error("producer exited: {message}")]
    ProducerExited { message: String },
}

/// Top-level error type for the public relay API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Invalid client/runtime/relay configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// Remote invocation failed outside a stream.
    #[error(transparent)]
    Transport(TransportError),
    /// No sentinel arrived before the session deadline.
    #[error("stream stalled for {waited:?} without completing")]
    StallTimeout { waited: Duration },
    /// Producer ended without signalling completion.
    #[error("producer exited: {0}")]
    ProducerExited(String),
}

impl From<TransportError> for RelayError {
    fn from(value: TransportError) -> Self {
        RelayError::Transport(value)
    }
}

impl RelayFailure {
    /// Short label used as the `kind` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::StallTimeout { .. } => "stall_timeout",
            Self::ProducerExited { .. } => "producer_exited",
        }
    }
}

impl RelayError {
    /// Maps a stream-time error onto its failure classification. Returns `None` for errors that only occur before a
    /// stream is started.
    pub fn failure(&self) -> Option<RelayFailure> {
        match self {
            Self::Transport(err) => Some(RelayFailure::Transport {
                message: err.to_string(),
            }),
            Self::StallTimeout { .. } => Some(RelayFailure::StallTimeout {
                message: self.to_string(),
            }),
            Self::ProducerExited(message) => Some(RelayFailure::ProducerExited {
                message: message.clone(),
            }),
            Self::Config(_) | Self::Validation(_) => None,
        }
    }
}
