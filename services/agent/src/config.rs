//! Configuration for the routing agent daemon.

use std::path::PathBuf;

use anyhow::{Context, Result};
use routekeeper_networking::RTPROT_ROUTEKEEPER;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory holding versioned configuration documents.
    pub config_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// iproute2 binary used for kernel commands and monitoring.
    pub ip_binary: String,

    /// Protocol tag marking routes and addresses owned by the agent.
    pub route_protocol: u8,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            config_dir: PathBuf::from("/etc/routekeeper"),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            ip_binary: "ip".to_string(),
            route_protocol: RTPROT_ROUTEKEEPER,
        }
    }
}

impl AgentConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config_dir = std::env::var("ROUTEKEEPER_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.config_dir);

        let log_level =
            std::env::var("ROUTEKEEPER_LOG_LEVEL").unwrap_or_else(|_| defaults.log_level);

        let log_format = match std::env::var("ROUTEKEEPER_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("text") | Err(_) => LogFormat::Text,
            Ok(other) => anyhow::bail!("unknown log format: {other}"),
        };

        let ip_binary =
            std::env::var("ROUTEKEEPER_IP_BINARY").unwrap_or_else(|_| defaults.ip_binary);

        // Protocol 0 is RTPROT_UNSPEC and would match every route on flush.
        let route_protocol = match std::env::var("ROUTEKEEPER_ROUTE_PROTOCOL") {
            Ok(value) => value
                .parse::<u8>()
                .ok()
                .filter(|p| *p != 0)
                .with_context(|| format!("invalid route protocol: {value}"))?,
            Err(_) => defaults.route_protocol,
        };

        Ok(Self {
            config_dir,
            log_level,
            log_format,
            ip_binary,
            route_protocol,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.config_dir, PathBuf::from("/etc/routekeeper"));
        assert_eq!(config.route_protocol, 52);
        assert_eq!(config.log_format, LogFormat::Text);
    }
}
