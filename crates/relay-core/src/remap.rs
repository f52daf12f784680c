use serde_json::{Value, json};
use tracing::debug;

use crate::config::DedupPolicy;
use crate::event::{Event, EventKind, OutboundEvent};

/// Consumer-side translation from pipeline events to the downstream
/// vocabulary (`agent_start`, `tool_start`, `tool_end`, `message`, `error`,
/// `heartbeat`).
///
/// Owns the content de-duplication state; the producer never touches it.
#[derive(Debug, Default)]
pub struct Remapper {
    policy: DedupPolicy,
    last_emitted_content: Option<String>,
    streamed_since_final: String,
}

impl Remapper {
    pub fn new(policy: DedupPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub(crate) fn last_emitted_content(&self) -> Option<&str> {
        self.last_emitted_content.as_deref()
    }

    /// Returns the downstream form of `event`, or `None` when it should not be
    /// re-emitted (relay-owned lifecycle kinds, empty content, echoes).
    pub fn remap(&mut self, event: &Event) -> Option<OutboundEvent> {
        match event.kind() {
            EventKind::AgentStart => Some(OutboundEvent::new(
                "agent_start",
                Value::Object(event.payload().clone()),
            )),
            EventKind::ToolStart => Some(OutboundEvent::new(
                "tool_start",
                json!({
                    "tool": tool_name(event),
                    "args": event.field("args").cloned().unwrap_or_else(|| json!({})),
                }),
            )),
            EventKind::ToolEnd => Some(OutboundEvent::new(
                "tool_end",
                json!({
                    "tool": tool_name(event),
                    "result": event.field("result").cloned().unwrap_or_else(|| json!("")),
                }),
            )),
            EventKind::ContentDelta => {
                let content = content_of(event)?;
                self.streamed_since_final.push_str(content);
                self.last_emitted_content = Some(content.to_string());
                Some(OutboundEvent::new(
                    "message",
                    json!({ "content": content, "partial": true }),
                ))
            }
            EventKind::ContentFinal => {
                let content = content_of(event)?;
                let echo = self.is_echo(content);
                self.streamed_since_final.clear();
                if echo {
                    debug!(bytes = content.len(), "suppressing final message that repeats streamed content");
                    return None;
                }
                self.last_emitted_content = Some(content.to_string());
                Some(OutboundEvent::new(
                    "message",
                    json!({ "content": content, "final": true }),
                ))
            }
            EventKind::Error => Some(OutboundEvent::error(error_message(event))),
            EventKind::Heartbeat => Some(OutboundEvent::new(
                "heartbeat",
                Value::Object(event.payload().clone()),
            )),
            EventKind::Start | EventKind::Done => {
                debug!(kind = %event.kind(), "dropping upstream lifecycle event");
                None
            }
        }
    }

    fn is_echo(&self, content: &str) -> bool {
        let matches_last = self.last_emitted_content.as_deref() == Some(content);
        match self.policy {
            DedupPolicy::Exact => matches_last,
            DedupPolicy::Accumulated => matches_last || self.streamed_since_final == content,
            DedupPolicy::Disabled => false,
        }
    }
}

fn tool_name(event: &Event) -> &str {
    event.str_field("tool").unwrap_or("unknown")
}

fn content_of(event: &Event) -> Option<&str> {
    event
        .content_text()
        .or_else(|| event.str_field("raw"))
        .filter(|c| !c.is_empty())
}

fn error_message(event: &Event) -> String {
    event
        .str_field("error")
        .or_else(|| event.str_field("message"))
        .or_else(|| event.str_field("raw"))
        .map_or_else(|| Value::Object(event.payload().clone()).to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, payload: Value) -> Event {
        Event::new(kind, payload).expect("event")
    }

    fn remap_all(remapper: &mut Remapper, events: &[Event]) -> Vec<OutboundEvent> {
        events.iter().filter_map(|e| remapper.remap(e)).collect()
    }

    #[test]
    fn final_echo_of_delta_is_suppressed() {
        let mut remapper = Remapper::new(DedupPolicy::Exact);
        let out = remap_all(
            &mut remapper,
            &[
                event(EventKind::ContentDelta, json!({"content": "X"})),
                event(EventKind::ContentFinal, json!({"output": "X"})),
            ],
        );
        assert_eq!(
            out,
            vec![OutboundEvent::new("message", json!({"content": "X", "partial": true}))]
        );
    }

    #[test]
    fn differing_final_is_emitted() {
        let mut remapper = Remapper::new(DedupPolicy::Exact);
        let out = remap_all(
            &mut remapper,
            &[
                event(EventKind::ContentDelta, json!({"content": "X"})),
                event(EventKind::ContentFinal, json!({"output": "Y"})),
            ],
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data["content"], "X");
        assert_eq!(out[1].data, json!({"content": "Y", "final": true}));
        assert_eq!(remapper.last_emitted_content(), Some("Y"));
    }

    #[test]
    fn accumulated_policy_suppresses_concatenated_deltas() {
        let events = [
            event(EventKind::ContentDelta, json!({"content": "Hel"})),
            event(EventKind::ContentDelta, json!({"content": "lo"})),
            event(EventKind::ContentFinal, json!({"output": "Hello"})),
        ];
        let mut exact = Remapper::new(DedupPolicy::Exact);
        assert_eq!(remap_all(&mut exact, &events).len(), 3);
        let mut accumulated = Remapper::new(DedupPolicy::Accumulated);
        assert_eq!(remap_all(&mut accumulated, &events).len(), 2);
    }

    #[test]
    fn disabled_policy_keeps_echoes() {
        let mut remapper = Remapper::new(DedupPolicy::Disabled);
        let out = remap_all(
            &mut remapper,
            &[
                event(EventKind::ContentDelta, json!({"content": "X"})),
                event(EventKind::ContentFinal, json!({"content": "X"})),
            ],
        );
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn tool_events_get_defaults() {
        let mut remapper = Remapper::default();
        let start = remapper
            .remap(&event(EventKind::ToolStart, json!({})))
            .expect("tool_start");
        assert_eq!(start.name, "tool_start");
        assert_eq!(start.data, json!({"tool": "unknown", "args": {}}));
        let end = remapper
            .remap(&event(
                EventKind::ToolEnd,
                json!({"tool": "get_weather", "result": "sunny", "timestamp": "t"}),
            ))
            .expect("tool_end");
        assert_eq!(end.data, json!({"tool": "get_weather", "result": "sunny"}));
    }

    #[test]
    fn empty_content_is_not_emitted() {
        let mut remapper = Remapper::default();
        assert_eq!(
            remapper.remap(&event(EventKind::ContentDelta, json!({"content": ""}))),
            None
        );
        assert_eq!(remapper.remap(&event(EventKind::ContentFinal, json!({}))), None);
    }

    #[test]
    fn raw_payloads_still_surface_as_content() {
        let mut remapper = Remapper::default();
        let out = remapper
            .remap(&event(EventKind::ContentDelta, json!({"raw": "{broken"})))
            .expect("message");
        assert_eq!(out.data["content"], "{broken");
    }

    #[test]
    fn error_message_prefers_error_then_message() {
        let mut remapper = Remapper::default();
        let a = remapper
            .remap(&event(EventKind::Error, json!({"error": "boom", "type": "ValueError"})))
            .expect("error");
        assert_eq!(a.data, json!({"error": "boom"}));
        let b = remapper
            .remap(&event(EventKind::Error, json!({"message": "throttled"})))
            .expect("error");
        assert_eq!(b.data, json!({"error": "throttled"}));
        let c = remapper
            .remap(&event(EventKind::Error, json!({"code": 7})))
            .expect("error");
        assert_eq!(c.data, json!({"error": "{\"code\":7}"}));
    }

    #[test]
    fn lifecycle_kinds_are_dropped() {
        let mut remapper = Remapper::default();
        assert_eq!(remapper.remap(&event(EventKind::Start, json!({}))), None);
        assert_eq!(remapper.remap(&event(EventKind::Done, json!({}))), None);
    }
}
