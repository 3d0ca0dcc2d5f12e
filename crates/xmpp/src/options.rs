use std::time::Duration;

use skua_core::config::{ClientConfig, Config, ReconnectKind};

/// Engine options, the mapping handed to transports and features.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Mechanism names tried before registry order.
    pub preferred_sasl_mechanisms: Vec<String>,
    /// Resource requested at bind time; the server assigns one when `None`.
    pub resource: Option<String>,
    pub stream_management: bool,
    /// Register the account in-band before authenticating.
    pub needs_registration: bool,
    pub reconnect_strategy: ReconnectKind,
    pub reconnect_min_interval: Duration,
    pub reconnect_max_interval: Duration,
    pub ack_timeout: Duration,
    pub iq_timeout: Duration,
    /// Connect to this host instead of the JID's domain.
    pub server: Option<String>,
    pub port: Option<u16>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for ClientOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            preferred_sasl_mechanisms: config.preferred_sasl_mechanisms.clone(),
            resource: config.resource.clone(),
            stream_management: config.stream_management,
            needs_registration: config.needs_registration,
            reconnect_strategy: config.reconnect.strategy,
            reconnect_min_interval: Duration::from_secs(config.reconnect.min_interval_secs),
            reconnect_max_interval: Duration::from_secs(config.reconnect.max_interval_secs),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            iq_timeout: Duration::from_millis(config.iq_timeout_ms),
            server: None,
            port: None,
        }
    }
}

impl From<&Config> for ClientOptions {
    fn from(config: &Config) -> Self {
        Self {
            server: config.account.server.clone(),
            port: config.account.port,
            ..Self::from(&config.client)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_client_config_defaults() {
        let options = ClientOptions::default();
        assert!(options.stream_management);
        assert!(!options.needs_registration);
        assert_eq!(options.reconnect_strategy, ReconnectKind::Temporal);
        assert_eq!(options.reconnect_min_interval, Duration::from_secs(1));
        assert_eq!(options.reconnect_max_interval, Duration::from_secs(60));
        assert_eq!(options.ack_timeout, Duration::from_secs(5));
        assert_eq!(options.iq_timeout, Duration::from_secs(30));
    }

    #[test]
    fn account_connection_overrides_are_carried() {
        let config = skua_core::config::load_config_from_str(
            r#"
[account]
jid = "juliet@capulet.example"
password = "secret"
server = "xmpp.capulet.example"
port = 5223

[client]
resource = "balcony"
iq_timeout_ms = 200
"#,
        )
        .unwrap();

        let options = ClientOptions::from(&config);
        assert_eq!(options.server.as_deref(), Some("xmpp.capulet.example"));
        assert_eq!(options.port, Some(5223));
        assert_eq!(options.resource.as_deref(), Some("balcony"));
        assert_eq!(options.iq_timeout, Duration::from_millis(200));
    }

    #[test]
    fn full_config_maps_onto_options() {
        let raw = skua_test_support::fixtures::config("full-config.toml");
        let config = skua_core::config::load_config_from_str(&raw).unwrap();

        let options = ClientOptions::from(&config);
        assert_eq!(options.preferred_sasl_mechanisms, vec!["SCRAM-SHA-256", "PLAIN"]);
        assert_eq!(options.ack_timeout, Duration::from_secs(2));
        assert_eq!(options.iq_timeout, Duration::from_secs(10));
        assert_eq!(options.port, Some(5222));
        assert_eq!(options.reconnect_strategy, ReconnectKind::NetworkReachability);

        let strategy = crate::ReconnectStrategy::from_config(&config.client.reconnect, "capulet.example");
        assert_eq!(strategy.name(), "network_reachability");
    }
}
