use std::sync::Arc;

use relay_bff::BffConfig;
use relay_core::runtime::HttpAgentTransport;
use relay_core::{AgentClient, RelayConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    relay_core::config::load_dotenv();
    relay_core::observability::init_observability();

    let config = BffConfig::from_env()?;
    let transport = HttpAgentTransport::from_env()?;
    tracing::info!(runtime_url = transport.url(), "forwarding to agent runtime");
    let client = AgentClient::new(Arc::new(transport), RelayConfig::from_env()?);
    relay_bff::serve(config, client).await
}
