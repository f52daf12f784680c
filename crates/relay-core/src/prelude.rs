//! Common imports for application code driving the relay.
pub use crate::{
    AgentClient, AgentTransport, Event, EventKind, InvocationRequest, OutboundEvent, RelayConfig,
    RelayError, RelayStream, ResponseBody,
};
