//! HTTP access to the agent runtime.

mod config;
mod transport;

pub use config::RuntimeConfig;
pub use transport::{HttpAgentTransport, SESSION_HEADER};
