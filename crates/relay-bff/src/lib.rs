//! Backend-for-frontend server that relays agent runtime streams to browsers.
//!
//! Routes:
//! - `GET /health`, `GET /ready`
//! - `POST /v1/chat`: blocking invocation, JSON response
//! - `POST /v1/chat/stream`: SSE response
//! - `GET /v1/ws/chat`: WebSocket, one relayed stream per inbound message

pub mod config;
pub mod routes;
mod ws;

pub use config::BffConfig;
pub use routes::{AppState, ChatRequest, ChatResponse, build_router};

use relay_core::AgentClient;
use tracing::info;

/// Binds `config`'s address and serves until Ctrl-C.
pub async fn serve(config: BffConfig, client: AgentClient) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, transport = client.transport_name(), "BFF listening");
    let router = build_router(AppState::new(client));
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("BFF shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
