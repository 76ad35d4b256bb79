//! Configuration management

use crate::crypto::SharedKey;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener (outside) role configuration
    pub listener: Option<ListenerConfig>,
    /// Dialer (iran) role configuration
    pub dialer: Option<DialerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        Self::parse(&content)
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, crate::Error> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Listener role configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Listen address for tunnel connections
    pub listen: String,
    /// Transport selector
    #[serde(default)]
    pub transport: TransportKind,
    /// Pre-shared key (base64 or passphrase)
    pub key: String,
    /// Maximum concurrent tunnel sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Seconds allowed for the secure channel handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Where streams go once they arrive
    #[serde(default)]
    pub forwarding: ForwardingConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:4000".to_string(),
            transport: TransportKind::Tcp,
            key: String::new(),
            max_connections: default_max_connections(),
            handshake_timeout_secs: default_handshake_timeout(),
            forwarding: ForwardingConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Parse the configured key
    pub fn shared_key(&self) -> Result<SharedKey, crate::Error> {
        parse_key(&self.key)
    }

    /// Handshake timeout as a `Duration`
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

/// Dialer role configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialerConfig {
    /// Address of the listener to dial
    pub connect: String,
    /// Transport selector
    #[serde(default)]
    pub transport: TransportKind,
    /// Pre-shared key (base64 or passphrase)
    pub key: String,
    /// Seconds allowed for the secure channel handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Reconnect delay; without it the first failure is fatal
    #[serde(default)]
    pub retry_delay_secs: Option<u64>,
    /// Where streams go once they arrive
    #[serde(default)]
    pub forwarding: ForwardingConfig,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect: "127.0.0.1:4000".to_string(),
            transport: TransportKind::Tcp,
            key: String::new(),
            handshake_timeout_secs: default_handshake_timeout(),
            retry_delay_secs: None,
            forwarding: ForwardingConfig::default(),
        }
    }
}

impl DialerConfig {
    /// Parse the configured key
    pub fn shared_key(&self) -> Result<SharedKey, crate::Error> {
        parse_key(&self.key)
    }

    /// Handshake timeout as a `Duration`
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Reconnect delay as a `Duration`
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay_secs.map(Duration::from_secs)
    }
}

/// Stream routing for one side of the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    /// Destination for streams opened without a service name
    #[serde(default)]
    pub destination: Option<String>,
    /// Seconds allowed for dialing a local destination
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Named destinations, keyed by service name
    #[serde(default)]
    pub services: HashMap<String, String>,
    /// Local listeners whose connections become new streams
    #[serde(default)]
    pub expose: Vec<ExposeConfig>,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            destination: None,
            connect_timeout_secs: default_connect_timeout(),
            services: HashMap::new(),
            expose: Vec::new(),
        }
    }
}

impl ForwardingConfig {
    /// Local dial timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// A local listener exposed through the tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposeConfig {
    /// Local bind address
    pub bind: String,
    /// Service name requested from the peer (empty for its default)
    #[serde(default)]
    pub service: String,
}

impl std::str::FromStr for ExposeConfig {
    type Err = crate::Error;

    /// Parse `bind` or `bind=service`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bind, service) = match s.split_once('=') {
            Some((bind, service)) => (bind, service),
            None => (s, ""),
        };
        if bind.is_empty() {
            return Err(crate::Error::Config(format!("invalid expose entry: {:?}", s)));
        }
        Ok(Self {
            bind: bind.to_string(),
            service: service.to_string(),
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

fn parse_key(key: &str) -> Result<SharedKey, crate::Error> {
    if key.trim().is_empty() {
        return Err(crate::Error::Config("a pre-shared key is required".to_string()));
    }
    Ok(SharedKey::parse(key)?)
}

fn default_max_connections() -> usize {
    1000
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    10
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    let mut listener = ListenerConfig::default();
    listener.forwarding.destination = Some("127.0.0.1:22".to_string());

    let mut dialer = DialerConfig::default();
    dialer.forwarding.expose.push(ExposeConfig {
        bind: "127.0.0.1:2222".to_string(),
        service: String::new(),
    });

    Config {
        listener: Some(listener),
        dialer: Some(dialer),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listener_config() {
        let config = Config::parse(
            r#"
            [listener]
            listen = "0.0.0.0:4000"
            key = "correct horse battery staple"

            [listener.forwarding]
            destination = "127.0.0.1:22"

            [listener.forwarding.services]
            web = "127.0.0.1:80"
            "#,
        )
        .unwrap();

        let listener = config.listener.unwrap();
        assert_eq!(listener.listen, "0.0.0.0:4000");
        assert_eq!(listener.transport, TransportKind::Tcp);
        assert_eq!(listener.max_connections, 1000);
        assert_eq!(listener.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(listener.forwarding.destination.as_deref(), Some("127.0.0.1:22"));
        assert_eq!(listener.forwarding.services["web"], "127.0.0.1:80");
        assert!(listener.shared_key().is_ok());
        assert!(config.dialer.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_dialer_config() {
        let config = Config::parse(
            r#"
            [dialer]
            connect = "203.0.113.7:4000"
            key = "secret"
            retry_delay_secs = 5

            [[dialer.forwarding.expose]]
            bind = "127.0.0.1:2222"

            [[dialer.forwarding.expose]]
            bind = "127.0.0.1:8080"
            service = "web"

            [logging]
            level = "debug"
            format = "compact"
            "#,
        )
        .unwrap();

        let dialer = config.dialer.unwrap();
        assert_eq!(dialer.retry_delay(), Some(Duration::from_secs(5)));
        assert_eq!(dialer.forwarding.expose.len(), 2);
        assert_eq!(dialer.forwarding.expose[1].service, "web");
        assert_eq!(config.logging.format, "compact");
    }

    #[test]
    fn test_unknown_transport_rejected() {
        let result = Config::parse(
            r#"
            [dialer]
            connect = "127.0.0.1:4000"
            key = "secret"
            transport = "carrier-pigeon"
            "#,
        );
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_empty_key_rejected() {
        let listener = ListenerConfig::default();
        assert!(matches!(listener.shared_key(), Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_expose_from_str() {
        let plain: ExposeConfig = "127.0.0.1:2222".parse().unwrap();
        assert_eq!(plain.bind, "127.0.0.1:2222");
        assert!(plain.service.is_empty());

        let named: ExposeConfig = "127.0.0.1:8080=web".parse().unwrap();
        assert_eq!(named.service, "web");

        assert!("=web".parse::<ExposeConfig>().is_err());
    }

    #[test]
    fn test_example_config_round_trips() {
        let example = generate_example_config();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(
            parsed.dialer.unwrap().forwarding.expose,
            example.dialer.unwrap().forwarding.expose
        );
    }
}
