//! Streaming relay between an agent runtime and downstream SSE clients.
//!
//! The runtime answers with SSE that may be split at arbitrary byte
//! boundaries, double-encoded, or not SSE at all. The relay parses whatever
//! arrives into [`Event`]s on a producer task, hands them over a bounded queue,
//! and re-emits them in the downstream vocabulary as they arrive.
//!
//! # Streaming an invocation
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use relay_core::prelude::*;
//! use relay_core::runtime::HttpAgentTransport;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), RelayError> {
//! let client = AgentClient::new(
//!     Arc::new(HttpAgentTransport::from_env()?),
//!     RelayConfig::from_env()?,
//! );
//!
//! let mut stream = client.invoke_stream("What is 2+2?", "session-1", "default")?;
//! while let Some(event) = stream.next_event().await {
//!     print!("{}", event.to_sse());
//! }
//! stream.close().await;
//! # Ok(())
//! # }
//! ```

/// Agent client entry point.
pub mod client;
/// Relay configuration and environment helpers.
pub mod config;
/// Public error types.
pub mod errors;
/// Event model shared by the parser and the relay.
pub mod event;
/// Process-wide tracing setup.
pub mod observability;
pub mod parser;
/// Common imports for typical usage.
pub mod prelude;
/// Producer task, bounded queue and consumer stream.
pub mod relay;
/// Downstream event mapping and content de-duplication.
pub mod remap;
pub mod runtime;
/// Transport contract and response body sources.
pub mod source;

pub use client::{AgentClient, extract_text};
pub use config::{DedupPolicy, RelayConfig};
pub use errors::{EventError, MalformedChunk, RelayError, RelayFailure, TransportError};
pub use event::{Event, EventKind, OutboundEvent, Payload};
pub use parser::{SseParser, parse_body, parse_stream, try_parse_json};
pub use relay::{Outcome, ProducerExit, RelayStream};
pub use remap::Remapper;
pub use source::{
    AgentTransport, ChunkedSource, InvocationRequest, ReplayTransport, ResponseBody,
    WholeBodySource,
};
