//! Session configuration parsed from environment variables.

use std::time::Duration;

pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;
pub const DEFAULT_AUTH_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_PING_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_LLM_PROVIDER: &str = "anthropic";
pub const DEFAULT_CLIENT_TAG: &str = "spider-chat";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must not be empty")]
    Empty { var: &'static str },
}

/// Timing knobs for the protocol engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Fixed delay before reconnecting after an unplanned close.
    pub reconnect_delay: Duration,
    /// Upper bound on waiting for `auth_success` / `auth_error`.
    pub auth_timeout: Duration,
    /// Keepalive interval while Ready; `None` disables pings.
    pub ping_interval: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            auth_timeout: Duration::from_secs(DEFAULT_AUTH_TIMEOUT_SECS),
            ping_interval: Some(Duration::from_secs(DEFAULT_PING_INTERVAL_SECS)),
        }
    }
}

impl EngineConfig {
    /// Build engine config from environment variables.
    ///
    /// Optional:
    /// - `SPIDER_RECONNECT_DELAY_MS`: default 3000
    /// - `SPIDER_AUTH_TIMEOUT_SECS`: default 10
    /// - `SPIDER_PING_INTERVAL_SECS`: default 30, `0` disables keepalive
    #[must_use]
    pub fn from_env() -> Self {
        let ping_secs = env_parse_u64("SPIDER_PING_INTERVAL_SECS", DEFAULT_PING_INTERVAL_SECS);
        Self {
            reconnect_delay: Duration::from_millis(env_parse_u64(
                "SPIDER_RECONNECT_DELAY_MS",
                DEFAULT_RECONNECT_DELAY_MS,
            )),
            auth_timeout: Duration::from_secs(env_parse_u64("SPIDER_AUTH_TIMEOUT_SECS", DEFAULT_AUTH_TIMEOUT_SECS)),
            ping_interval: (ping_secs > 0).then(|| Duration::from_secs(ping_secs)),
        }
    }
}

/// What a new conversation starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub llm_provider: String,
    pub mcp_servers: Vec<String>,
    /// Written into each conversation's metadata as `client`.
    pub client_tag: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            llm_provider: DEFAULT_LLM_PROVIDER.to_owned(),
            mcp_servers: Vec::new(),
            client_tag: DEFAULT_CLIENT_TAG.to_owned(),
        }
    }
}

impl SessionConfig {
    /// Build session config from environment variables.
    ///
    /// Optional:
    /// - `SPIDER_LLM_PROVIDER`: default `anthropic`
    /// - `SPIDER_MCP_SERVERS`: comma separated tool-server ids, default none
    /// - `SPIDER_CLIENT_TAG`: default `spider-chat`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Empty`] when `SPIDER_LLM_PROVIDER` is set but blank.
    pub fn from_env() -> Result<Self, ConfigError> {
        let llm_provider = match std::env::var("SPIDER_LLM_PROVIDER") {
            Ok(raw) if raw.trim().is_empty() => return Err(ConfigError::Empty { var: "SPIDER_LLM_PROVIDER" }),
            Ok(raw) => raw.trim().to_owned(),
            Err(_) => DEFAULT_LLM_PROVIDER.to_owned(),
        };
        let mcp_servers = std::env::var("SPIDER_MCP_SERVERS")
            .map(|raw| parse_list(&raw))
            .unwrap_or_default();
        let client_tag = std::env::var("SPIDER_CLIENT_TAG")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_TAG.to_owned());

        Ok(Self { llm_provider, mcp_servers, client_tag })
    }
}

fn env_parse_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
