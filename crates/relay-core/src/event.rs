use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::errors::EventError;

/// JSON object carried by every event. Shape depends on the upstream kind and
/// is intentionally left open.
pub type Payload = Map<String, Value>;

/// Closed vocabulary of pipeline events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Start of a relayed run (synthetic, emitted by the relay).
    Start,
    /// Agent began reasoning over the request.
    AgentStart,
    /// Tool invocation started.
    ToolStart,
    /// Tool invocation produced a result.
    ToolEnd,
    /// Incremental chunk of generated text.
    ContentDelta,
    /// Final complete text of the run.
    ContentFinal,
    /// Upstream or relay failure.
    Error,
    /// Liveness signal with no content.
    Heartbeat,
    /// End of stream.
    Done,
}

impl EventKind {
    #[cfg(test)]
    pub(crate) const ALL: [EventKind; 9] = [
        EventKind::Start,
        EventKind::AgentStart,
        EventKind::ToolStart,
        EventKind::ToolEnd,
        EventKind::ContentDelta,
        EventKind::ContentFinal,
        EventKind::Error,
        EventKind::Heartbeat,
        EventKind::Done,
    ];

    /// Canonical name written on the `event:` line.
    pub fn wire_name(self) -> &'static str {
        match self {
            EventKind::Start => "start",
            EventKind::AgentStart => "agent_start",
            EventKind::ToolStart => "tool_start",
            EventKind::ToolEnd => "tool_end",
            EventKind::ContentDelta => "content_delta",
            EventKind::ContentFinal => "content_final",
            EventKind::Error => "error",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Done => "done",
        }
    }

    /// Resolves an `event:` name to a kind.
    ///
    /// Accepts canonical names, the agent runtime's upper-case vocabulary, and
    /// the downstream `message` name (which needs the payload to tell a final
    /// message from a partial one). Returns `None` for unknown names.
    pub fn from_wire_name(name: &str, payload: &Payload) -> Option<EventKind> {
        let kind = match name.trim() {
            "start" => EventKind::Start,
            "agent_start" | "AGENT_START" => EventKind::AgentStart,
            "tool_start" | "TOOL_CALL" => EventKind::ToolStart,
            "tool_end" | "TOOL_RESULT" => EventKind::ToolEnd,
            "content_delta" | "LLM_RESPONSE" => EventKind::ContentDelta,
            "content_final" | "AGENT_END" => EventKind::ContentFinal,
            "error" | "ERROR" => EventKind::Error,
            "heartbeat" | "THINKING" => EventKind::Heartbeat,
            "done" => EventKind::Done,
            "message" => {
                if payload.get("final").and_then(Value::as_bool) == Some(true) {
                    EventKind::ContentFinal
                } else {
                    EventKind::ContentDelta
                }
            }
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Atomic unit flowing through the pipeline. Immutable once constructed.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    kind: EventKind,
    payload: Payload,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Builds an event from any serializable payload.
    ///
    /// The payload must serialize to a JSON object.
    pub fn new(kind: EventKind, payload: impl Serialize) -> Result<Self, EventError> {
        match serde_json::to_value(payload) {
            Ok(Value::Object(map)) => Ok(Self::from_payload(kind, map)),
            Ok(other) => Err(EventError::InvalidPayload(format!(
                "expected a JSON object, got {}",
                json_type_name(&other)
            ))),
            Err(e) => Err(EventError::InvalidPayload(e.to_string())),
        }
    }

    /// Builds an event from an already-decoded payload.
    pub fn from_payload(kind: EventKind, payload: Payload) -> Self {
        Self {
            kind,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// When the pipeline first observed this event. Diagnostic only.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Text carried by a content event: `content`, falling back to `output`.
    pub fn content_text(&self) -> Option<&str> {
        self.str_field("content").or_else(|| self.str_field("output"))
    }

    /// `event: <kind>\ndata: <json>\n\n`. The timestamp is not wire-visible.
    pub fn to_wire_format(&self) -> String {
        format_sse(self.kind.wire_name(), &Value::Object(self.payload.clone()))
    }

    /// JSON-lines diagnostics form, newline terminated.
    pub fn to_json_line(&self) -> String {
        let line = serde_json::json!({
            "type": self.kind.wire_name(),
            "data": self.payload,
            "timestamp": self.timestamp.to_rfc3339(),
        });
        format!("{line}\n")
    }
}

/// Downstream-facing event produced by the relay consumer.
#[derive(Clone, Debug, PartialEq)]
pub struct OutboundEvent {
    pub name: &'static str,
    pub data: Value,
}

impl OutboundEvent {
    pub fn new(name: &'static str, data: Value) -> Self {
        Self { name, data }
    }

    pub fn start(session_id: &str) -> Self {
        Self::new("start", serde_json::json!({ "session_id": session_id }))
    }

    pub fn done() -> Self {
        Self::new("done", serde_json::json!({ "status": "complete" }))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("error", serde_json::json!({ "error": message.into() }))
    }

    pub fn heartbeat(at: DateTime<Utc>) -> Self {
        Self::new("heartbeat", serde_json::json!({ "timestamp": at.to_rfc3339() }))
    }

    /// SSE text for this event. The `data:` line is always single-line JSON.
    pub fn to_sse(&self) -> String {
        format_sse(self.name, &self.data)
    }
}

fn format_sse(name: &str, data: &Value) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
