use std::time::Duration;

use crate::config::{env_parse, env_var};
use crate::errors::RelayError;

const DEFAULT_REGION: &str = "us-west-2";
const DEFAULT_QUALIFIER: &str = "DEFAULT";

/// Where and how to reach the agent runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Full invocations URL. Takes precedence over `runtime_arn`.
    ///
    /// Useful for a locally running runtime or a test server.
    pub endpoint: Option<String>,
    /// Runtime ARN used to derive the regional invocations URL.
    pub runtime_arn: Option<String>,
    pub region: String,
    /// Runtime endpoint qualifier (`DEFAULT` unless a named endpoint is used).
    pub qualifier: String,
    /// Bearer token sent as `Authorization`, if any.
    pub bearer_token: Option<String>,
    /// Timeout for blocking invocations. Streamed invocations are bounded by
    /// the relay session timeout instead.
    pub timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            runtime_arn: None,
            region: DEFAULT_REGION.to_string(),
            qualifier: DEFAULT_QUALIFIER.to_string(),
            bearer_token: None,
            timeout: Duration::from_secs(300),
        }
    }
}

impl RuntimeConfig {
    /// Targets a runtime by ARN in the default region.
    pub fn for_arn(runtime_arn: impl Into<String>) -> Self {
        Self {
            runtime_arn: Some(runtime_arn.into()),
            ..Self::default()
        }
    }

    /// Targets an explicit invocations URL.
    pub fn for_endpoint(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            ..Self::default()
        }
    }

    /// Builds a config from `AGENT_RUNTIME_URL` / `AGENT_RUNTIME_ARN`,
    /// `AWS_REGION`, `AGENT_RUNTIME_QUALIFIER`, `AGENT_RUNTIME_TOKEN` and
    /// `REQUEST_TIMEOUT` (seconds).
    pub fn from_env() -> Result<Self, RelayError> {
        let mut config = Self {
            endpoint: env_var("AGENT_RUNTIME_URL"),
            runtime_arn: env_var("AGENT_RUNTIME_ARN"),
            bearer_token: env_var("AGENT_RUNTIME_TOKEN"),
            ..Self::default()
        };
        if let Some(region) = env_var("AWS_REGION") {
            config.region = region;
        }
        if let Some(qualifier) = env_var("AGENT_RUNTIME_QUALIFIER") {
            config.qualifier = qualifier;
        }
        if let Some(secs) = env_parse("REQUEST_TIMEOUT")? {
            config.timeout = Duration::from_secs(secs);
        }
        config.invocations_url()?;
        Ok(config)
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    pub fn bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolves the URL invocations are POSTed to.
    pub fn invocations_url(&self) -> Result<String, RelayError> {
        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            return Ok(endpoint.trim().to_string());
        }
        let arn = self
            .runtime_arn
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                RelayError::Config(
                    "either AGENT_RUNTIME_URL or AGENT_RUNTIME_ARN must be set".into(),
                )
            })?;
        if self.region.trim().is_empty() {
            return Err(RelayError::Config("region must not be empty".into()));
        }
        Ok(format!(
            "https://bedrock-agentcore.{}.amazonaws.com/runtimes/{}/invocations?qualifier={}",
            self.region.trim(),
            urlencoding::encode(arn),
            urlencoding::encode(&self.qualifier),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arn_url_is_percent_encoded() {
        let config = RuntimeConfig::for_arn(
            "arn:aws:bedrock-agentcore:us-west-2:123456789012:runtime/agent-abc",
        );
        assert_eq!(
            config.invocations_url().expect("url"),
            "https://bedrock-agentcore.us-west-2.amazonaws.com/runtimes/\
             arn%3Aaws%3Abedrock-agentcore%3Aus-west-2%3A123456789012%3Aruntime%2Fagent-abc\
             /invocations?qualifier=DEFAULT"
        );
    }

    #[test]
    fn endpoint_wins_over_arn() {
        let mut config = RuntimeConfig::for_endpoint("http://localhost:8080/invocations");
        config.runtime_arn = Some("arn:ignored".into());
        assert_eq!(
            config.invocations_url().expect("url"),
            "http://localhost:8080/invocations"
        );
    }

    #[test]
    fn missing_target_is_config_error() {
        let err = RuntimeConfig::default().invocations_url();
        assert!(matches!(err, Err(RelayError::Config(msg)) if msg.contains("AGENT_RUNTIME_ARN")));
    }

    #[test]
    fn region_and_qualifier_are_applied() {
        let url = RuntimeConfig::for_arn("arn")
            .region("eu-central-1")
            .qualifier("prod")
            .invocations_url()
            .expect("url");
        assert_eq!(
            url,
            "https://bedrock-agentcore.eu-central-1.amazonaws.com/runtimes/arn/invocations?qualifier=prod"
        );
    }
}
