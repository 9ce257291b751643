//! Configuration types for hub channels

use crate::reconnect::ReconnectionPolicy;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Configuration for one persistent hub channel
///
/// When `reconnect` is omitted from serialized input the policy is chosen
/// from `name`: [`ReconnectionPolicy::session`] for `"session"`, otherwise
/// [`ReconnectionPolicy::presence`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "RawChannelConfig")]
pub struct ChannelConfig {
    /// Label used in log lines ("session", "presence")
    pub name: String,

    /// Hub endpoint URL (http(s):// or ws(s)://)
    pub url: String,

    /// Transport and negotiation settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Backoff policy for unintentional drops
    pub reconnect: ReconnectionPolicy,

    /// Per-RPC completion timeout in milliseconds (default: 30000)
    pub rpc_timeout_ms: u64,

    /// Handshake reply timeout in milliseconds (default: 15000)
    pub handshake_timeout_ms: u64,

    /// Interval between client pings in milliseconds (default: 15000)
    pub keepalive_interval_ms: u64,

    /// Silence after which the link is considered dead (default: 30000)
    pub server_timeout_ms: u64,
}

/// Serialized form of [`ChannelConfig`] before the reconnect policy is resolved
#[derive(Deserialize)]
struct RawChannelConfig {
    name: String,
    url: String,
    #[serde(default)]
    transport: TransportConfig,
    #[serde(default)]
    reconnect: Option<ReconnectionPolicy>,
    rpc_timeout_ms: u64,
    handshake_timeout_ms: u64,
    keepalive_interval_ms: u64,
    server_timeout_ms: u64,
}

impl From<RawChannelConfig> for ChannelConfig {
    fn from(raw: RawChannelConfig) -> Self {
        let reconnect = raw.reconnect.unwrap_or_else(|| match raw.name.as_str() {
            "session" => ReconnectionPolicy::session(),
            _ => ReconnectionPolicy::presence(),
        });

        Self {
            name: raw.name,
            url: raw.url,
            transport: raw.transport,
            reconnect,
            rpc_timeout_ms: raw.rpc_timeout_ms,
            handshake_timeout_ms: raw.handshake_timeout_ms,
            keepalive_interval_ms: raw.keepalive_interval_ms,
            server_timeout_ms: raw.server_timeout_ms,
        }
    }
}

/// Transport and negotiation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connect the WebSocket directly instead of POSTing /negotiate first
    pub skip_negotiation: bool,

    /// Extra headers sent with the upgrade and negotiate requests
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            skip_negotiation: true,
            headers: HashMap::new(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::presence("ws://localhost:5000/hubs/presence")
    }
}

impl ChannelConfig {
    fn with_policy(name: &str, url: &str, reconnect: ReconnectionPolicy) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            transport: TransportConfig::default(),
            reconnect,
            rpc_timeout_ms: 30000,
            handshake_timeout_ms: 15000,
            keepalive_interval_ms: 15000,
            server_timeout_ms: 30000,
        }
    }

    /// Call signaling channel preset (2s base delay)
    ///
    /// # Example
    ///
    /// ```
    /// use callhub_signaling::config::ChannelConfig;
    ///
    /// let config = ChannelConfig::session("wss://example.org/hubs/call");
    /// assert_eq!(config.reconnect.base_delay_ms, 2000);
    /// assert!(config.validate().is_ok());
    /// ```
    pub fn session(url: &str) -> Self {
        Self::with_policy("session", url, ReconnectionPolicy::session())
    }

    /// Presence channel preset (1s base delay, 60s cap)
    pub fn presence(url: &str) -> Self {
        Self::with_policy("presence", url, ReconnectionPolicy::presence())
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn server_timeout(&self) -> Duration {
        Duration::from_millis(self.server_timeout_ms)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `url` is not an http(s) or ws(s) URL
    /// - any timeout is zero
    /// - `server_timeout_ms` is not larger than `keepalive_interval_ms`
    /// - `reconnect.base_delay_ms` is zero or exceeds `reconnect.cap_delay_ms`
    pub fn validate(&self) -> Result<()> {
        let scheme_ok = ["ws://", "wss://", "http://", "https://"]
            .iter()
            .any(|scheme| self.url.starts_with(scheme));
        if !scheme_ok {
            return Err(Error::InvalidConfig(format!(
                "{} url must start with ws://, wss://, http:// or https://, got {}",
                self.name, self.url
            )));
        }

        if self.rpc_timeout_ms == 0 || self.handshake_timeout_ms == 0 {
            return Err(Error::InvalidConfig(format!(
                "{} timeouts must be greater than zero",
                self.name
            )));
        }

        if self.keepalive_interval_ms == 0 || self.server_timeout_ms <= self.keepalive_interval_ms
        {
            return Err(Error::InvalidConfig(format!(
                "{} server_timeout_ms ({}) must exceed keepalive_interval_ms ({})",
                self.name, self.server_timeout_ms, self.keepalive_interval_ms
            )));
        }

        if self.reconnect.base_delay_ms == 0 {
            return Err(Error::InvalidConfig(format!(
                "{} reconnect base delay must be greater than zero",
                self.name
            )));
        }

        if self.reconnect.base_delay_ms > self.reconnect.cap_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "{} reconnect base delay {}ms exceeds cap {}ms",
                self.name, self.reconnect.base_delay_ms, self.reconnect.cap_delay_ms
            )));
        }

        Ok(())
    }
}

/// Configuration for both channels of a [`crate::RealtimeContext`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    pub session: ChannelConfig,
    pub presence: ChannelConfig,
}

impl ContextConfig {
    /// Both channels served from one origin (`{base}/hubs/call`, `{base}/hubs/presence`)
    pub fn for_origin(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            session: ChannelConfig::session(&format!("{}/hubs/call", base)),
            presence: ChannelConfig::presence(&format!("{}/hubs/presence", base)),
        }
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            Error::InvalidConfig(format!(
                "Failed to parse {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;
        self.presence.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let session = ChannelConfig::session("ws://localhost/hubs/call");
        let presence = ChannelConfig::presence("ws://localhost/hubs/presence");

        assert_eq!(session.name, "session");
        assert_eq!(session.reconnect.base_delay_ms, 2000);
        assert_eq!(presence.reconnect.base_delay_ms, 1000);
        assert_eq!(presence.reconnect.cap_delay_ms, 60000);
        assert!(session.transport.skip_negotiation);
    }

    #[test]
    fn test_validate_rejects_bad_scheme() {
        let config = ChannelConfig::session("ftp://localhost");
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_short_server_timeout() {
        let mut config = ChannelConfig::presence("wss://localhost/hubs/presence");
        config.server_timeout_ms = config.keepalive_interval_ms;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_base_delay() {
        let mut config = ChannelConfig::session("wss://localhost/hubs/call");
        config.reconnect.base_delay_ms = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_missing_reconnect_follows_channel_name() {
        let channel = |name: &str| {
            serde_json::from_value::<ChannelConfig>(serde_json::json!({
                "name": name,
                "url": "wss://example.org/hubs/x",
                "rpc_timeout_ms": 10000,
                "handshake_timeout_ms": 5000,
                "keepalive_interval_ms": 15000,
                "server_timeout_ms": 30000
            }))
            .unwrap()
        };

        assert_eq!(channel("session").reconnect, ReconnectionPolicy::session());
        assert_eq!(channel("presence").reconnect, ReconnectionPolicy::presence());
    }

    #[test]
    fn test_context_for_origin() {
        let config = ContextConfig::for_origin("https://calls.example.org/");
        assert_eq!(config.session.url, "https://calls.example.org/hubs/call");
        assert_eq!(config.presence.url, "https://calls.example.org/hubs/presence");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_context_json_round_trip_defaults() {
        let json = r#"{
            "session": {
                "name": "session",
                "url": "wss://example.org/hubs/call",
                "rpc_timeout_ms": 10000,
                "handshake_timeout_ms": 5000,
                "keepalive_interval_ms": 15000,
                "server_timeout_ms": 30000
            },
            "presence": {
                "name": "presence",
                "url": "wss://example.org/hubs/presence",
                "reconnect": { "max_attempts": 3, "base_delay_ms": 500, "cap_delay_ms": 4000 },
                "rpc_timeout_ms": 10000,
                "handshake_timeout_ms": 5000,
                "keepalive_interval_ms": 15000,
                "server_timeout_ms": 30000
            }
        }"#;

        let config: ContextConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.session.reconnect, ReconnectionPolicy::session());
        assert_eq!(config.presence.reconnect.max_attempts, 3);
        assert!(config.session.transport.skip_negotiation);
    }
}
