use std::net::SocketAddr;

use relay_core::RelayError;
use relay_core::config::{env_parse, env_var};

/// Listen address of the BFF server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BffConfig {
    pub host: String,
    pub port: u16,
}

impl Default for BffConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

impl BffConfig {
    /// Reads `HOST` and `PORT`.
    pub fn from_env() -> Result<Self, RelayError> {
        let mut config = Self::default();
        if let Some(host) = env_var("HOST") {
            config.host = host;
        }
        if let Some(port) = env_parse("PORT")? {
            config.port = port;
        }
        Ok(config)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, RelayError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid listen address: {e}")))
    }
}
