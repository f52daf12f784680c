//! Incremental SSE decoding of agent runtime responses.
//!
//! The runtime does not always answer with clean SSE. Bodies seen in practice:
//!
//! - proper `event:`/`data:` frames, split at arbitrary network boundaries;
//! - the whole SSE text re-encoded as one JSON string literal;
//! - frames whose `data:` line is a JSON string wrapping another SSE frame;
//! - a single unstructured blob with no frame delimiter at all.
//!
//! [`SseParser`] turns all of them into the same ordered [`Event`] sequence.

use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use serde_json::Value;
use tracing::debug;

use crate::errors::{MalformedChunk, TransportError};
use crate::event::{Event, EventKind, Payload};
use crate::source::ChunkedSource;

/// Decodes `text` as JSON. Every speculative decode in the parser goes through
/// here so the fallback is an explicit branch.
pub fn try_parse_json(text: &str) -> Result<Value, MalformedChunk> {
    serde_json::from_str(text).map_err(|e| MalformedChunk {
        text: text.to_string(),
        reason: e.to_string(),
    })
}

/// Parses a complete response body.
pub fn parse_body(body: &str) -> Vec<Event> {
    let mut parser = SseParser::new();
    let mut events = parser.push(body);
    events.extend(parser.finish());
    events
}

/// Lazily parses a chunked response. Transport errors are yielded and end the
/// stream; any events already decoded before the error are yielded first.
pub fn parse_stream(
    source: ChunkedSource,
) -> impl futures::Stream<Item = Result<Event, TransportError>> + Send {
    struct State {
        source: ChunkedSource,
        parser: SseParser,
        pending: std::collections::VecDeque<Event>,
        done: bool,
    }

    stream::try_unfold(
        State {
            source,
            parser: SseParser::new(),
            pending: std::collections::VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.done {
                    return Ok(None);
                }
                match state.source.next().await {
                    Some(Ok(chunk)) => state.pending.extend(state.parser.push(&chunk)),
                    Some(Err(err)) => return Err(err),
                    None => {
                        state.pending.extend(state.parser.finish());
                        state.done = true;
                    }
                }
            }
        },
    )
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Mode {
    /// Only whitespace seen so far.
    #[default]
    Undecided,
    /// Plain SSE; frames are emitted as soon as they are delimited.
    Sse,
    /// Body starts with `"`: possibly a JSON string wrapping the SSE text.
    Encoded,
    /// First frame carried no SSE fields; the body is unstructured text.
    Plain,
}

/// Incremental SSE parser. One per session; not restartable.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    /// Bytes before this offset hold no delimiter start.
    scan_from: usize,
    mode: Mode,
    saw_frame: bool,
    saw_delimiter: bool,
    finished: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fragment and returns every event it completed.
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Vec<Event> {
        if self.finished {
            return Vec::new();
        }
        self.buf.extend_from_slice(chunk.as_ref());
        if self.mode == Mode::Undecided {
            match self.buf.iter().find(|b| !b.is_ascii_whitespace()) {
                None => return Vec::new(),
                Some(b'"') => self.mode = Mode::Encoded,
                Some(_) => self.mode = Mode::Sse,
            }
        }
        match self.mode {
            Mode::Sse => self.drain_frames(),
            Mode::Undecided | Mode::Encoded | Mode::Plain => Vec::new(),
        }
    }

    /// Signals end of input and flushes whatever is left in the buffer.
    pub fn finish(&mut self) -> Vec<Event> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        let body = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&body).into_owned();
        match self.mode {
            Mode::Undecided => Vec::new(),
            Mode::Sse => self.flush_residue(text),
            Mode::Plain => vec![final_content(plain_content(text))],
            Mode::Encoded => {
                let content = match try_parse_json(&text) {
                    Ok(Value::String(inner)) => inner,
                    Ok(_) | Err(_) => text,
                };
                self.parse_decoded(content)
            }
        }
    }

    fn parse_decoded(&mut self, content: String) -> Vec<Event> {
        self.mode = Mode::Sse;
        self.buf = content.into_bytes();
        self.scan_from = 0;
        let mut events = self.drain_frames();
        let rest = std::mem::take(&mut self.buf);
        let rest = String::from_utf8_lossy(&rest).into_owned();
        if self.mode == Mode::Plain {
            events.push(final_content(plain_content(rest)));
        } else {
            events.extend(self.flush_residue(rest));
        }
        events
    }

    fn drain_frames(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf, self.scan_from) {
            let text = String::from_utf8_lossy(&self.buf[..idx]).into_owned();
            let parsed = parse_frame(&text, true);
            if !self.saw_frame {
                match parsed {
                    FrameParse::Text => {
                        debug!("response body is not SSE; buffering as plain text");
                        self.mode = Mode::Plain;
                        return events;
                    }
                    FrameParse::Blank => {}
                    _ => self.saw_frame = true,
                }
            }
            self.buf.drain(..idx + delim_len);
            self.scan_from = 0;
            self.saw_delimiter = true;
            match parsed {
                FrameParse::Events(parsed) => events.extend(parsed),
                FrameParse::Partial => debug!(frame = %text, "skipping frame without both event and data"),
                FrameParse::Text => debug!(frame = %text, "skipping non-SSE frame"),
                FrameParse::Blank | FrameParse::Comment => {}
            }
        }
        // A delimiter split across pushes starts at most 3 bytes from the end.
        self.scan_from = self.buf.len().saturating_sub(3);
        events
    }

    fn flush_residue(&self, text: String) -> Vec<Event> {
        match parse_frame(&text, true) {
            FrameParse::Events(events) => events,
            FrameParse::Blank | FrameParse::Comment => Vec::new(),
            FrameParse::Partial | FrameParse::Text => {
                let content = if self.saw_delimiter {
                    text.trim().to_string()
                } else {
                    plain_content(text)
                };
                debug!(bytes = content.len(), "emitting undelimited residue as final content");
                vec![final_content(content)]
            }
        }
    }
}

#[derive(Debug)]
enum FrameParse {
    /// Complete frame. Empty when the event name is unknown.
    Events(Vec<Event>),
    /// Has `event:` or `data:` but not both.
    Partial,
    /// Only comments or other non-payload fields.
    Comment,
    /// No SSE fields at all.
    Text,
    Blank,
}

fn parse_frame(text: &str, unwrap_nested: bool) -> FrameParse {
    if text.trim().is_empty() {
        return FrameParse::Blank;
    }
    let mut event_name: Option<String> = None;
    let mut data_lines: Vec<&str> = Vec::new();
    let mut saw_text = false;
    for raw_line in text.split('\n') {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event_name = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim());
        } else if !(line.starts_with("id:") || line.starts_with("retry:")) {
            saw_text = true;
        }
    }

    match (event_name, data_lines.is_empty()) {
        (Some(name), false) => {
            let payload = decode_payload(&data_lines.join("\n"));
            match EventKind::from_wire_name(&name, &payload) {
                Some(kind) => FrameParse::Events(vec![Event::from_payload(kind, payload)]),
                None => {
                    debug!(event = %name, "skipping unknown upstream event");
                    FrameParse::Events(Vec::new())
                }
            }
        }
        (None, false) => {
            let data = data_lines.join("\n");
            if unwrap_nested && let Ok(Value::String(inner)) = try_parse_json(&data) {
                let events = parse_nested(&inner);
                if !events.is_empty() {
                    return FrameParse::Events(events);
                }
            }
            FrameParse::Partial
        }
        (Some(_), true) => FrameParse::Partial,
        (None, true) if saw_text => FrameParse::Text,
        (None, true) => FrameParse::Comment,
    }
}

/// Parses SSE text carried inside a wrapped `data:` string. One level only.
fn parse_nested(inner: &str) -> Vec<Event> {
    let bytes = inner.as_bytes();
    let mut events = Vec::new();
    let mut start = 0;
    while let Some((idx, delim_len)) = find_frame_delimiter(&bytes[start..], 0) {
        let text = String::from_utf8_lossy(&bytes[start..start + idx]);
        if let FrameParse::Events(parsed) = parse_frame(&text, false) {
            events.extend(parsed);
        }
        start += idx + delim_len;
    }
    let rest = String::from_utf8_lossy(&bytes[start..]);
    if let FrameParse::Events(parsed) = parse_frame(&rest, false) {
        events.extend(parsed);
    }
    events
}

fn decode_payload(data: &str) -> Payload {
    match try_parse_json(data) {
        Ok(Value::Object(map)) => map,
        Ok(Value::String(text)) => raw_payload(text),
        Ok(_) => raw_payload(data.to_string()),
        Err(err) => {
            debug!(reason = %err.reason, "data line is not JSON; wrapping as raw");
            raw_payload(err.text)
        }
    }
}

fn raw_payload(text: String) -> Payload {
    let mut payload = Payload::new();
    payload.insert("raw".into(), Value::String(text));
    payload
}

/// Content for an unstructured body: the `output` field of a JSON object
/// body, otherwise the text verbatim.
fn plain_content(text: String) -> String {
    if let Ok(Value::Object(map)) = try_parse_json(text.trim())
        && let Some(Value::String(output)) = map.get("output")
    {
        return output.clone();
    }
    text
}

fn final_content(content: String) -> Event {
    let mut payload = Payload::new();
    payload.insert("content".into(), Value::String(content));
    Event::from_payload(EventKind::ContentFinal, payload)
}

fn find_frame_delimiter(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if i + 3 < buf.len()
            && buf[i] == b'\r'
            && buf[i + 1] == b'\n'
            && buf[i + 2] == b'\r'
            && buf[i + 3] == b'\n'
        {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

/// Type-erased parsed event stream.
pub type EventStream = Pin<Box<dyn futures::Stream<Item = Result<Event, TransportError>> + Send>>;
