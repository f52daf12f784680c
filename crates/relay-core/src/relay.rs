use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt as _, stream};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::errors::{RelayError, TransportError};
use crate::event::{Event, EventKind, OutboundEvent, Payload};
use crate::parser::{EventStream, SseParser, parse_stream};
use crate::remap::Remapper;
use crate::source::{AgentTransport, InvocationRequest, ResponseBody, WholeBodySource};

/// How the producer finished. Sent exactly once, as the last queue item, on
/// every path except cancellation and consumer disconnect. Both variants end
/// the stream with `done`; a failure has already been relayed as an `error`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(RelayError),
}

#[derive(Debug)]
enum QueueItem {
    Event(Event),
    Sentinel(Outcome),
}

/// Final state of the producer task, observed by [`RelayStream::close`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProducerExit {
    /// Source exhausted, completion sentinel delivered.
    Completed,
    /// Source failed, error event and failure sentinel delivered.
    Failed,
    /// Cancellation was requested before the source finished.
    Cancelled,
    /// Consumer went away while the producer was still sending.
    Disconnected,
    /// Producer task panicked.
    Panicked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Fresh,
    Streaming,
    Finished,
}

/// Consumer half of one relayed invocation.
///
/// Yields `start`, the remapped upstream events in order, and finally `done`.
/// A transport failure arrives as an `error` followed by `done`. When the relay
/// itself gives up (stall past the deadline, producer gone) the last event is
/// an `error` with no `done`. Dropping the stream aborts the producer;
/// [`close`](Self::close) cancels it and waits for it to exit.
pub struct RelayStream {
    session_id: String,
    rx: mpsc::Receiver<QueueItem>,
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<ProducerExit>>,
    remapper: Remapper,
    poll_timeout: std::time::Duration,
    session_timeout: Option<std::time::Duration>,
    deadline: Option<Instant>,
    heartbeat_on_stall: bool,
    phase: Phase,
}

impl RelayStream {
    /// Spawns the producer for `request` and returns the consumer handle.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        transport: Arc<dyn AgentTransport>,
        request: InvocationRequest,
        config: &RelayConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let session_id = request.session_id.clone();
        info!(
            session_id = %session_id,
            transport = transport.name(),
            queue_capacity = config.queue_capacity,
            "starting relay stream"
        );
        let task = tokio::spawn(produce(transport, request, tx, cancel_rx));
        Self {
            session_id,
            rx,
            cancel_tx,
            task: Some(task),
            remapper: Remapper::new(config.dedup),
            poll_timeout: config.poll_timeout,
            session_timeout: config.session_timeout,
            deadline: config.session_timeout.map(|t| Instant::now() + t),
            heartbeat_on_stall: config.heartbeat_on_stall,
            phase: Phase::Fresh,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Waits for the next downstream event. Returns `None` once the stream
    /// has ended.
    pub async fn next_event(&mut self) -> Option<OutboundEvent> {
        match self.phase {
            Phase::Finished => return None,
            Phase::Fresh => {
                self.phase = Phase::Streaming;
                return Some(OutboundEvent::start(&self.session_id));
            }
            Phase::Streaming => {}
        }

        loop {
            match timeout(self.next_wait(), self.rx.recv()).await {
                Ok(Some(QueueItem::Event(event))) => {
                    debug!(session_id = %self.session_id, kind = %event.kind(), "relaying event");
                    if let Some(out) = self.remapper.remap(&event) {
                        return Some(out);
                    }
                }
                Ok(Some(QueueItem::Sentinel(Outcome::Completed))) => {
                    debug!(session_id = %self.session_id, "producer completed");
                    self.phase = Phase::Finished;
                    return Some(OutboundEvent::done());
                }
                Ok(Some(QueueItem::Sentinel(Outcome::Failed(err)))) => {
                    log_failure(&self.session_id, &err);
                    self.phase = Phase::Finished;
                    return Some(OutboundEvent::done());
                }
                Ok(None) => {
                    let err = RelayError::ProducerExited(
                        "producer ended without signalling completion".into(),
                    );
                    log_failure(&self.session_id, &err);
                    self.phase = Phase::Finished;
                    return Some(OutboundEvent::error(err.to_string()));
                }
                Err(_) => {
                    if self.deadline.is_some_and(|d| Instant::now() >= d) {
                        let err = RelayError::StallTimeout {
                            waited: self.session_timeout.unwrap_or_default(),
                        };
                        log_failure(&self.session_id, &err);
                        let _ = self.cancel_tx.send(true);
                        self.phase = Phase::Finished;
                        return Some(OutboundEvent::error(err.to_string()));
                    }
                    debug!(session_id = %self.session_id, "no upstream event within poll timeout");
                    if self.heartbeat_on_stall {
                        return Some(OutboundEvent::heartbeat(Utc::now()));
                    }
                }
            }
        }
    }

    /// Cancels the producer (if still running) and waits for it to exit.
    pub async fn close(mut self) -> ProducerExit {
        let _ = self.cancel_tx.send(true);
        self.rx.close();
        let Some(task) = self.task.take() else {
            return ProducerExit::Cancelled;
        };
        let exit = match task.await {
            Ok(exit) => exit,
            Err(err) if err.is_panic() => ProducerExit::Panicked,
            Err(_) => ProducerExit::Cancelled,
        };
        debug!(session_id = %self.session_id, ?exit, "relay producer exited");
        exit
    }

    /// Adapts the relay into a stream that closes the producer once drained.
    pub fn into_sse(self) -> impl Stream<Item = OutboundEvent> + Send {
        async_stream::stream! {
            let mut relay = self;
            while let Some(event) = relay.next_event().await {
                yield event;
            }
            relay.close().await;
        }
    }

    fn next_wait(&self) -> std::time::Duration {
        match self.deadline {
            Some(deadline) => self
                .poll_timeout
                .min(deadline.saturating_duration_since(Instant::now())),
            None => self.poll_timeout,
        }
    }
}

impl Drop for RelayStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn produce(
    transport: Arc<dyn AgentTransport>,
    request: InvocationRequest,
    tx: mpsc::Sender<QueueItem>,
    mut cancel_rx: watch::Receiver<bool>,
) -> ProducerExit {
    let session_id = request.session_id.clone();
    let body = tokio::select! {
        biased;
        _ = cancelled(&mut cancel_rx) => return ProducerExit::Cancelled,
        body = transport.invoke(request) => body,
    };
    let mut events: EventStream = match body {
        Ok(ResponseBody::Chunked(source)) => Box::pin(parse_stream(source)),
        Ok(ResponseBody::Whole(source)) => whole_body_events(source),
        Err(err) => return fail(&tx, &session_id, err).await,
    };

    loop {
        tokio::select! {
            biased;
            _ = cancelled(&mut cancel_rx) => {
                debug!(session_id = %session_id, "relay producer cancelled");
                return ProducerExit::Cancelled;
            }
            next = events.next() => match next {
                Some(Ok(event)) => {
                    if !send(&tx, QueueItem::Event(event)).await {
                        return ProducerExit::Disconnected;
                    }
                }
                Some(Err(err)) => return fail(&tx, &session_id, err).await,
                None => {
                    return if send(&tx, QueueItem::Sentinel(Outcome::Completed)).await {
                        ProducerExit::Completed
                    } else {
                        ProducerExit::Disconnected
                    };
                }
            }
        }
    }
}

async fn fail(
    tx: &mpsc::Sender<QueueItem>,
    session_id: &str,
    err: TransportError,
) -> ProducerExit {
    debug!(session_id = %session_id, error = %err, "agent transport failed");
    let mut payload = Payload::new();
    payload.insert("error".into(), Value::String(err.to_string()));
    let delivered = send(tx, QueueItem::Event(Event::from_payload(EventKind::Error, payload)))
        .await
        && send(tx, QueueItem::Sentinel(Outcome::Failed(err.into()))).await;
    if delivered {
        ProducerExit::Failed
    } else {
        ProducerExit::Disconnected
    }
}

fn log_failure(session_id: &str, err: &RelayError) {
    match err.failure() {
        Some(failure) => warn!(
            session_id = %session_id,
            kind = failure.kind(),
            %failure,
            "relay stream failed"
        ),
        None => warn!(session_id = %session_id, error = %err, "relay stream failed"),
    }
}

fn whole_body_events(source: WholeBodySource) -> EventStream {
    Box::pin(stream::once(source.read()).flat_map(|result: Result<Bytes, TransportError>| {
        let items: Vec<Result<Event, TransportError>> = match result {
            Ok(bytes) => {
                let mut parser = SseParser::new();
                let mut events = parser.push(&bytes);
                events.extend(parser.finish());
                events.into_iter().map(Ok).collect()
            }
            Err(err) => vec![Err(err)],
        };
        stream::iter(items)
    }))
}

/// Resolves once cancellation is requested or the consumer handle is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|cancel| *cancel).await;
}

async fn send(tx: &mpsc::Sender<QueueItem>, item: QueueItem) -> bool {
    tx.send(item).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DedupPolicy;
    use crate::source::{ChunkedSource, ReplayTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    enum FakeBehavior {
        ImmediateError(TransportError),
        Chunks(Vec<Result<Bytes, TransportError>>),
        Pending,
        /// One message, then hangs holding a guard that flips the flag on drop.
        FirstThenHang(Arc<AtomicBool>),
        Panic,
    }

    struct ReleaseGuard(Arc<AtomicBool>);

    impl Drop for ReleaseGuard {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    struct FakeTransport {
        behavior: FakeBehavior,
    }

    #[async_trait::async_trait]
    impl AgentTransport for FakeTransport {
        fn name(&self) -> &str {
            "fake"
        }

        async fn invoke(&self, _request: InvocationRequest) -> Result<ResponseBody, TransportError> {
            match &self.behavior {
                FakeBehavior::ImmediateError(err) => Err(err.clone()),
                FakeBehavior::Chunks(chunks) => Ok(ResponseBody::Chunked(ChunkedSource::new(
                    stream::iter(chunks.clone()),
                ))),
                FakeBehavior::Pending => Ok(ResponseBody::Chunked(ChunkedSource::new(
                    stream::pending::<Result<Bytes, TransportError>>(),
                ))),
                FakeBehavior::FirstThenHang(released) => {
                    let guard = ReleaseGuard(released.clone());
                    let first = Ok::<_, TransportError>(Bytes::from_static(
                        b"event: LLM_RESPONSE\ndata: {\"content\":\"partial\"}\n\n",
                    ));
                    let body = stream::iter([first])
                        .chain(stream::pending())
                        .map(move |chunk| {
                            let _held = &guard;
                            chunk
                        });
                    Ok(ResponseBody::Chunked(ChunkedSource::new(body)))
                }
                FakeBehavior::Panic => panic!("transport blew up"),
            }
        }
    }

    fn request() -> InvocationRequest {
        InvocationRequest::new("hello", "session-1", "user-1").streaming(true)
    }

    fn spawn(behavior: FakeBehavior, config: &RelayConfig) -> RelayStream {
        RelayStream::spawn(Arc::new(FakeTransport { behavior }), request(), config)
    }

    async fn drain(relay: &mut RelayStream) -> Vec<OutboundEvent> {
        let mut out = Vec::new();
        while let Some(event) = relay.next_event().await {
            out.push(event);
        }
        out
    }

    fn names(events: &[OutboundEvent]) -> Vec<&'static str> {
        events.iter().map(|e| e.name).collect()
    }

    const AGENT_RUN: &str = concat!(
        "event: AGENT_START\ndata: {\"timestamp\":\"t0\"}\n\n",
        "event: TOOL_CALL\ndata: {\"tool\":\"calculator\",\"args\":{\"expression\":\"2+2\"}}\n\n",
        "event: TOOL_RESULT\ndata: {\"tool\":\"calculator\",\"result\":\"4\"}\n\n",
        "event: LLM_RESPONSE\ndata: {\"content\":\"The answer is 4.\"}\n\n",
        "event: AGENT_END\ndata: {\"output\":\"The answer is 4.\"}\n\n",
    );

    #[tokio::test]
    async fn relays_full_run_and_completes() {
        let transport = Arc::new(ReplayTransport::chunked(AGENT_RUN, 7));
        let mut relay = RelayStream::spawn(transport, request(), &RelayConfig::default());
        let events = drain(&mut relay).await;
        assert_eq!(
            names(&events),
            vec!["start", "agent_start", "tool_start", "tool_end", "message", "done"]
        );
        assert_eq!(events[0].data, json!({"session_id": "session-1"}));
        assert_eq!(
            events[4].data,
            json!({"content": "The answer is 4.", "partial": true})
        );
        assert_eq!(relay.close().await, ProducerExit::Completed);
    }

    #[tokio::test]
    async fn whole_body_is_parsed_after_single_read() {
        let transport = Arc::new(ReplayTransport::whole(AGENT_RUN));
        let mut relay = RelayStream::spawn(
            transport,
            request(),
            &RelayConfig::default().dedup(DedupPolicy::Disabled),
        );
        let events = drain(&mut relay).await;
        assert_eq!(names(&events).len(), 7);
        assert_eq!(events[5].data["final"], true);
        assert_eq!(events.last().map(|e| e.name), Some("done"));
    }

    #[tokio::test]
    async fn order_is_preserved_through_small_queue() {
        let body: String = (0..50)
            .map(|i| format!("event: LLM_RESPONSE\ndata: {{\"content\":\"{i}\"}}\n\n"))
            .collect();
        let config = RelayConfig::default().queue_capacity(1);
        let mut relay = RelayStream::spawn(
            Arc::new(ReplayTransport::chunked(body, 13)),
            request(),
            &config,
        );
        let events = drain(&mut relay).await;
        let contents: Vec<String> = events
            .iter()
            .filter(|e| e.name == "message")
            .filter_map(|e| e.data["content"].as_str().map(str::to_string))
            .collect();
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(contents, expected);
    }

    #[tokio::test]
    async fn invoke_failure_yields_error_then_done() {
        let mut relay = spawn(
            FakeBehavior::ImmediateError(TransportError::status(403, "access denied")),
            &RelayConfig::default(),
        );
        let events = drain(&mut relay).await;
        assert_eq!(names(&events), vec!["start", "error", "done"]);
        assert_eq!(events[2].data, json!({"status": "complete"}));
        let message = events[1].data["error"].as_str().unwrap_or_default();
        assert!(message.contains("403"));
        assert!(message.contains("access denied"));
        assert_eq!(relay.close().await, ProducerExit::Failed);
    }

    #[tokio::test]
    async fn read_failure_after_events_keeps_earlier_events() {
        let mut relay = spawn(
            FakeBehavior::Chunks(vec![
                Ok(Bytes::from_static(b"event: LLM_RESPONSE\ndata: {\"content\":\"a\"}\n\n")),
                Err(TransportError::read("connection reset")),
            ]),
            &RelayConfig::default(),
        );
        let events = drain(&mut relay).await;
        assert_eq!(names(&events), vec!["start", "message", "error", "done"]);
        assert!(relay.next_event().await.is_none());
        assert_eq!(relay.close().await, ProducerExit::Failed);
    }

    #[tokio::test]
    async fn upstream_error_event_does_not_end_stream() {
        let body = concat!(
            "event: ERROR\ndata: {\"error\":\"tool failed\",\"type\":\"RuntimeError\"}\n\n",
            "event: AGENT_END\ndata: {\"output\":\"recovered\"}\n\n",
        );
        let mut relay = RelayStream::spawn(
            Arc::new(ReplayTransport::chunked(body, 16)),
            request(),
            &RelayConfig::default(),
        );
        let events = drain(&mut relay).await;
        assert_eq!(names(&events), vec!["start", "error", "message", "done"]);
        assert_eq!(events[1].data, json!({"error": "tool failed"}));
    }

    #[tokio::test]
    async fn producer_panic_surfaces_as_error() {
        let mut relay = spawn(FakeBehavior::Panic, &RelayConfig::default());
        let events = drain(&mut relay).await;
        assert_eq!(names(&events), vec!["start", "error"]);
        assert!(
            events[1].data["error"]
                .as_str()
                .is_some_and(|m| m.contains("producer"))
        );
        assert_eq!(relay.close().await, ProducerExit::Panicked);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_emits_heartbeat_then_times_out() {
        let config = RelayConfig::default()
            .poll_timeout(Duration::from_secs(120))
            .session_timeout(Some(Duration::from_secs(300)));
        let mut relay = spawn(FakeBehavior::Pending, &config);
        assert_eq!(relay.next_event().await.map(|e| e.name), Some("start"));
        assert_eq!(relay.next_event().await.map(|e| e.name), Some("heartbeat"));
        assert_eq!(relay.next_event().await.map(|e| e.name), Some("heartbeat"));
        let last = relay.next_event().await.expect("timeout error");
        assert_eq!(last.name, "error");
        assert!(last.data["error"].as_str().is_some_and(|m| m.contains("stalled")));
        assert!(relay.next_event().await.is_none());
        assert_eq!(relay.close().await, ProducerExit::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_without_heartbeat_keeps_waiting() {
        let config = RelayConfig::default()
            .poll_timeout(Duration::from_secs(10))
            .session_timeout(Some(Duration::from_secs(35)))
            .heartbeat_on_stall(false);
        let mut relay = spawn(FakeBehavior::Pending, &config);
        let events = drain(&mut relay).await;
        assert_eq!(names(&events), vec!["start", "error"]);
    }

    #[tokio::test]
    async fn close_cancels_pending_producer() {
        let mut relay = spawn(FakeBehavior::Pending, &RelayConfig::default());
        assert_eq!(relay.next_event().await.map(|e| e.name), Some("start"));
        assert_eq!(relay.close().await, ProducerExit::Cancelled);
    }

    #[tokio::test]
    async fn dropping_sse_stream_releases_upstream() {
        let released = Arc::new(AtomicBool::new(false));
        let relay = spawn(
            FakeBehavior::FirstThenHang(released.clone()),
            &RelayConfig::default(),
        );
        let mut sse = Box::pin(relay.into_sse());
        assert_eq!(sse.next().await.map(|e| e.name), Some("start"));
        assert_eq!(sse.next().await.map(|e| e.name), Some("message"));
        assert!(!released.load(Ordering::SeqCst));

        drop(sse);
        for _ in 0..100 {
            if released.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn into_sse_yields_all_events() {
        let relay = RelayStream::spawn(
            Arc::new(ReplayTransport::chunked(AGENT_RUN, 32)),
            request(),
            &RelayConfig::default(),
        );
        let events: Vec<_> = relay.into_sse().collect().await;
        assert_eq!(events.first().map(|e| e.name), Some("start"));
        assert_eq!(events.last().map(|e| e.name), Some("done"));
    }
}
