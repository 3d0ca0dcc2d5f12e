use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub jid: String,
    pub password: String,
    pub server: Option<String>,
    pub port: Option<u16>,
}

/// Engine options. Mapped onto `skua_xmpp::ClientOptions`.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Ordered list of SASL mechanism names to try first.
    #[serde(default)]
    pub preferred_sasl_mechanisms: Vec<String>,
    /// Resource requested during bind. The server picks one when absent.
    pub resource: Option<String>,
    #[serde(default = "default_true")]
    pub stream_management: bool,
    #[serde(default)]
    pub needs_registration: bool,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_iq_timeout_ms")]
    pub iq_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            preferred_sasl_mechanisms: Vec::new(),
            resource: None,
            stream_management: true,
            needs_registration: false,
            ack_timeout_ms: default_ack_timeout_ms(),
            iq_timeout_ms: default_iq_timeout_ms(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectKind {
    None,
    Immediate,
    Temporal,
    NetworkReachability,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_kind")]
    pub strategy: ReconnectKind,
    #[serde(default = "default_min_interval_secs")]
    pub min_interval_secs: u64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            strategy: default_reconnect_kind(),
            min_interval_secs: default_min_interval_secs(),
            max_interval_secs: default_max_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    jid: Option<String>,
    password: Option<String>,
    server: Option<String>,
    log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_ack_timeout_ms() -> u64 {
    5_000
}

fn default_iq_timeout_ms() -> u64 {
    30_000
}

fn default_reconnect_kind() -> ReconnectKind {
    ReconnectKind::Temporal
}

fn default_min_interval_secs() -> u64 {
    1
}

fn default_max_interval_secs() -> u64 {
    60
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const DEFAULT_CONFIG_TOML: &str = r#"[account]
jid = ""
password = ""
# server = "xmpp.example.com"
# port = 5222

[client]
# preferred_sasl_mechanisms = ["SCRAM-SHA-256", "SCRAM-SHA-1", "PLAIN"]
# resource = "skua"
stream_management = true
needs_registration = false
ack_timeout_ms = 5000
iq_timeout_ms = 30000

[client.reconnect]
strategy = "temporal"
min_interval_secs = 1
max_interval_secs = 60

[logging]
level = "info"
json = false

[event_bus]
channel_capacity = 1024
"#;

/// Return the resolved platform-appropriate configuration file path.
pub fn config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("org", "skua", "skua") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        PathBuf::from("config.toml")
    }
}

/// Load configuration from the platform config path, merging environment
/// variable overrides.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(config_path())
}

/// Load configuration from a specific path. A missing file is created with
/// the commented default and reported as missing required fields.
pub fn load_config_from(path: PathBuf) -> Result<Config, ConfigError> {
    load_config_from_with_overrides(&path, config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: &Path,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    debug!(path = %path.display(), "loading configuration");
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_default_config(path)?;
            info!(path = %path.display(), "wrote default configuration");
            return Err(ConfigError::MissingRequiredFields {
                fields: vec!["account.jid".to_string(), "account.password".to_string()],
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<Config, ConfigError> {
    let mut config: Config = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        jid: std::env::var("SKUA_JID").ok(),
        password: std::env::var("SKUA_PASSWORD").ok(),
        server: std::env::var("SKUA_SERVER").ok(),
        log_level: std::env::var("SKUA_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut Config, overrides: ConfigOverrides) {
    if let Some(jid) = overrides.jid {
        config.account.jid = jid;
    }
    if let Some(password) = overrides.password {
        config.account.password = password;
    }
    if let Some(server) = overrides.server {
        config.account.server = Some(server);
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    if config.account.jid.is_empty() {
        missing.push("account.jid".to_string());
    }
    // Registration supplies the password through the form.
    if config.account.password.is_empty() && !config.client.needs_registration {
        missing.push("account.password".to_string());
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    let reconnect = &config.client.reconnect;
    if reconnect.min_interval_secs == 0 && reconnect.strategy != ReconnectKind::Immediate {
        return Err(ConfigError::InvalidValue {
            field: "client.reconnect.min_interval_secs".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    if reconnect.max_interval_secs < reconnect.min_interval_secs {
        return Err(ConfigError::InvalidValue {
            field: "client.reconnect.max_interval_secs".to_string(),
            message: "must not be smaller than min_interval_secs".to_string(),
        });
    }

    if config.client.ack_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "client.ack_timeout_ms".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    if config.client.iq_timeout_ms == 0 {
        return Err(ConfigError::InvalidValue {
            field: "client.iq_timeout_ms".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if config.event_bus.channel_capacity == 0 {
        return Err(ConfigError::InvalidValue {
            field: "event_bus.channel_capacity".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    Ok(())
}

fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_CONFIG_TOML)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn parse_without_env(toml_str: &str) -> Result<Config, ConfigError> {
        load_config_from_str_with_overrides(toml_str, ConfigOverrides::default())
    }

    fn minimal_toml() -> &'static str {
        r#"
[account]
jid = "user@example.com"
password = "secret"
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = parse_without_env(minimal_toml()).unwrap();
        assert_eq!(config.account.jid, "user@example.com");
        assert!(config.account.server.is_none());
        assert!(config.client.preferred_sasl_mechanisms.is_empty());
        assert!(config.client.resource.is_none());
        assert!(config.client.stream_management);
        assert!(!config.client.needs_registration);
        assert_eq!(config.client.ack_timeout_ms, 5_000);
        assert_eq!(config.client.iq_timeout_ms, 30_000);
        assert_eq!(config.client.reconnect.strategy, ReconnectKind::Temporal);
        assert_eq!(config.client.reconnect.min_interval_secs, 1);
        assert_eq!(config.client.reconnect.max_interval_secs, 60);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.event_bus.channel_capacity, 1024);
    }

    #[test]
    fn parses_client_section() {
        let toml = r#"
[account]
jid = "juliet@capulet.example"
password = "r0m30"
server = "xmpp.capulet.example"
port = 5223

[client]
preferred_sasl_mechanisms = ["PLAIN"]
resource = "balcony"
stream_management = false
iq_timeout_ms = 200

[client.reconnect]
strategy = "network_reachability"
min_interval_secs = 2
max_interval_secs = 30
"#;
        let config = parse_without_env(toml).unwrap();
        assert_eq!(config.account.port, Some(5223));
        assert_eq!(config.client.preferred_sasl_mechanisms, vec!["PLAIN"]);
        assert_eq!(config.client.resource.as_deref(), Some("balcony"));
        assert!(!config.client.stream_management);
        assert_eq!(config.client.iq_timeout_ms, 200);
        assert_eq!(
            config.client.reconnect.strategy,
            ReconnectKind::NetworkReachability
        );
        assert_eq!(config.client.reconnect.min_interval_secs, 2);
    }

    #[test]
    fn default_config_template_is_valid_toml() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TOML).unwrap();
        assert!(config.account.jid.is_empty());
        assert_eq!(config.client.reconnect.strategy, ReconnectKind::Temporal);
    }

    #[test]
    fn rejects_missing_credentials() {
        let toml = r#"
[account]
jid = ""
password = ""
"#;
        let err = parse_without_env(toml).unwrap_err();
        assert_matches!(err, ConfigError::MissingRequiredFields { fields } => {
            assert_eq!(fields.len(), 2);
            assert!(fields.contains(&"account.jid".to_string()));
            assert!(fields.contains(&"account.password".to_string()));
        });
    }

    #[test]
    fn registration_does_not_require_a_password() {
        let toml = r#"
[account]
jid = "newbie@example.com"
password = ""

[client]
needs_registration = true
"#;
        let config = parse_without_env(toml).unwrap();
        assert!(config.client.needs_registration);
    }

    #[test]
    fn rejects_invalid_log_level() {
        let toml = r#"
[account]
jid = "user@example.com"
password = "secret"

[logging]
level = "verbose"
"#;
        let err = parse_without_env(toml).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { field, .. } if field == "logging.level");
    }

    #[test]
    fn rejects_inverted_reconnect_bounds() {
        let toml = r#"
[account]
jid = "user@example.com"
password = "secret"

[client.reconnect]
min_interval_secs = 10
max_interval_secs = 5
"#;
        let err = parse_without_env(toml).unwrap_err();
        assert_matches!(
            err,
            ConfigError::InvalidValue { field, .. } if field == "client.reconnect.max_interval_secs"
        );
    }

    #[test]
    fn rejects_unknown_reconnect_strategy() {
        let toml = r#"
[account]
jid = "user@example.com"
password = "secret"

[client.reconnect]
strategy = "sometimes"
"#;
        let err = parse_without_env(toml).unwrap_err();
        assert_matches!(err, ConfigError::InvalidToml { .. });
    }

    #[test]
    fn invalid_toml_reports_position() {
        let toml = r#"
[account]
jid = "user@example.com"
password = "secret"
bad_line ===
"#;
        let err = parse_without_env(toml).unwrap_err();
        assert_matches!(err, ConfigError::InvalidToml { line, .. } => {
            assert!(line > 0, "line should be > 0, got {line}");
        });
    }

    #[test]
    fn overrides_replace_file_values() {
        let overrides = ConfigOverrides {
            jid: Some("override@example.com".to_string()),
            password: Some("env_password".to_string()),
            server: Some("env.xmpp.example.com".to_string()),
            log_level: Some("debug".to_string()),
        };
        let config = load_config_from_str_with_overrides(minimal_toml(), overrides).unwrap();
        assert_eq!(config.account.jid, "override@example.com");
        assert_eq!(config.account.password, "env_password");
        assert_eq!(
            config.account.server.as_deref(),
            Some("env.xmpp.example.com")
        );
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn override_cannot_smuggle_invalid_level() {
        let overrides = ConfigOverrides {
            log_level: Some("loud".to_string()),
            ..Default::default()
        };
        let err = load_config_from_str_with_overrides(minimal_toml(), overrides).unwrap_err();
        assert_matches!(err, ConfigError::InvalidValue { .. });
    }

    #[test]
    fn missing_file_creates_default_and_reports_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let err = load_config_from_with_overrides(&path, ConfigOverrides::default()).unwrap_err();
        assert_matches!(err, ConfigError::MissingRequiredFields { .. });
        assert!(path.exists());

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("[client.reconnect]"));
    }

    #[test]
    fn loads_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, minimal_toml()).unwrap();

        let config = load_config_from_with_overrides(&path, ConfigOverrides::default()).unwrap();
        assert_eq!(config.account.password, "secret");
    }
}
