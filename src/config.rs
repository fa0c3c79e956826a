//! Configuration loading and validation.
//!
//! Settings come from two layers: an optional TOML config file and the
//! command line. Explicit flags override file values, which override the
//! built-in defaults. Validation runs once, before any network attempt, and
//! a [`ConfigError`] is the only error in the system that terminates the
//! process.

use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default MQTT-over-TLS port.
pub const DEFAULT_PORT: u16 = 8883;

/// Default client identifier when neither file nor flags provide one.
pub const DEFAULT_CLIENT_ID: &str = "mqtt-listener";

/// Connection parameters for one broker session.
///
/// The client id is used verbatim. Brokers evict the older session when two
/// concurrent connections share an id, so operators must keep ids unique per
/// running listener.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub root_ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Quality of service requested for the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscribeQos {
    AtMostOnce,
    AtLeastOnce,
}

/// The topic filter and QoS this listener subscribes with.
///
/// Fixed for the process lifetime and re-applied verbatim after every
/// reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    pub topic_filter: String,
    pub qos: SubscribeQos,
}

/// Fully resolved listener configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub transport: TransportConfig,
    pub subscription: SubscriptionSpec,
    /// Shell command to run per message. `None` means log-only.
    pub command: Option<String>,
    pub debug: bool,
}

/// Raw file-level settings. Every field is optional so that the file and the
/// command line can each fill in any subset.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub mqtt_endpoint: Option<String>,
    pub mqtt_topic: Option<String>,
    pub client_id: Option<String>,
    pub qos: Option<SubscribeQos>,
    pub ssl_root_ca: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub command: Option<String>,
    pub debug: Option<bool>,
}

/// Command-line overrides, mirroring [`FileConfig`] field for field.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub mqtt_endpoint: Option<String>,
    pub mqtt_topic: Option<String>,
    pub client_id: Option<String>,
    pub qos: Option<SubscribeQos>,
    pub ssl_root_ca: Option<PathBuf>,
    pub ssl_cert: Option<PathBuf>,
    pub ssl_key: Option<PathBuf>,
    pub command: Option<String>,
    pub debug: bool,
}

/// Configuration errors. Fatal: reported once, process exits non-zero.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    MissingSetting(&'static str),
    #[error("invalid MQTT endpoint '{0}': expected HOST or HOST:PORT")]
    InvalidEndpoint(String),
    #[error("credential file {role} ({path}) is not a readable file")]
    UnreadableCredential { role: &'static str, path: PathBuf },
}

impl FileConfig {
    /// Load settings from a TOML file. A missing file at the *default* path
    /// is not an error; callers decide whether absence is acceptable.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Split `HOST[:PORT]` into host and port, defaulting to [`DEFAULT_PORT`].
///
/// A trailing colon with no port is tolerated and falls back to the default.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), ConfigError> {
    let (host, port_str) = match endpoint.split_once(':') {
        Some((host, port)) => (host, port),
        None => (endpoint, ""),
    };

    if host.is_empty() || port_str.contains(':') {
        return Err(ConfigError::InvalidEndpoint(endpoint.to_string()));
    }

    let port = if port_str.is_empty() {
        DEFAULT_PORT
    } else {
        port_str
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidEndpoint(endpoint.to_string()))?
    };

    Ok((host.to_string(), port))
}

/// Merge file settings and CLI overrides into a resolved [`ListenerConfig`].
///
/// Precedence: CLI flag, then file value, then default. Endpoint, topic, and
/// the three credential paths are mandatory after the merge.
pub fn resolve(file: FileConfig, cli: CliOverrides) -> Result<ListenerConfig, ConfigError> {
    let endpoint = cli
        .mqtt_endpoint
        .or(file.mqtt_endpoint)
        .ok_or(ConfigError::MissingSetting("mqtt_endpoint"))?;
    let (host, port) = parse_endpoint(&endpoint)?;

    let topic_filter = cli
        .mqtt_topic
        .or(file.mqtt_topic)
        .ok_or(ConfigError::MissingSetting("mqtt_topic"))?;

    let transport = TransportConfig {
        client_id: cli
            .client_id
            .or(file.client_id)
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
        host,
        port,
        root_ca: cli
            .ssl_root_ca
            .or(file.ssl_root_ca)
            .ok_or(ConfigError::MissingSetting("ssl_root_ca"))?,
        cert: cli
            .ssl_cert
            .or(file.ssl_cert)
            .ok_or(ConfigError::MissingSetting("ssl_cert"))?,
        key: cli
            .ssl_key
            .or(file.ssl_key)
            .ok_or(ConfigError::MissingSetting("ssl_key"))?,
    };

    Ok(ListenerConfig {
        transport,
        subscription: SubscriptionSpec {
            topic_filter,
            qos: cli.qos.or(file.qos).unwrap_or(SubscribeQos::AtLeastOnce),
        },
        command: cli.command.or(file.command),
        debug: cli.debug || file.debug.unwrap_or(false),
    })
}

impl ListenerConfig {
    /// Check that all three credential paths reference readable files.
    ///
    /// Absence is a fatal configuration error, not a retryable one, so this
    /// must run before the first connect attempt.
    pub fn validate_credentials(&self) -> Result<(), ConfigError> {
        for (role, path) in [
            ("ssl_root_ca", &self.transport.root_ca),
            ("ssl_cert", &self.transport.cert),
            ("ssl_key", &self.transport.key),
        ] {
            let readable = path.is_file() && File::open(path).is_ok();
            if !readable {
                return Err(ConfigError::UnreadableCredential {
                    role,
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cli_with_credentials(ca: &Path, cert: &Path, key: &Path) -> CliOverrides {
        CliOverrides {
            mqtt_endpoint: Some("broker.example.com".to_string()),
            mqtt_topic: Some("iotbutton/#".to_string()),
            ssl_root_ca: Some(ca.to_path_buf()),
            ssl_cert: Some(cert.to_path_buf()),
            ssl_key: Some(key.to_path_buf()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_endpoint_host_only() {
        let (host, port) = parse_endpoint("broker.example.com").unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_endpoint_with_port() {
        let (host, port) = parse_endpoint("broker.example.com:1883").unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_endpoint_trailing_colon_uses_default() {
        let (host, port) = parse_endpoint("broker.example.com:").unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_endpoint_rejects_garbage() {
        assert!(matches!(
            parse_endpoint(""),
            Err(ConfigError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            parse_endpoint(":8883"),
            Err(ConfigError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            parse_endpoint("host:notaport"),
            Err(ConfigError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            parse_endpoint("host:88:83"),
            Err(ConfigError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_file_config_parses_full_toml() {
        let toml_content = r#"
mqtt_endpoint = "broker.example.com:8883"
mqtt_topic = "devices/+/event"
client_id = "listener-7"
qos = "at-most-once"
ssl_root_ca = "certs/root.pem"
ssl_cert = "certs/device.pem.crt"
ssl_key = "certs/private.pem.key"
command = "echo $MQTT_TOPIC"
debug = true
"#;

        let config: FileConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(
            config.mqtt_endpoint.as_deref(),
            Some("broker.example.com:8883")
        );
        assert_eq!(config.qos, Some(SubscribeQos::AtMostOnce));
        assert_eq!(config.debug, Some(true));
    }

    #[test]
    fn test_file_config_rejects_unknown_fields() {
        let result: Result<FileConfig, _> = toml::from_str("mqtt_endpoitn = \"typo\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_cli_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
mqtt_endpoint = "file-broker:1883"
mqtt_topic = "file/topic"
client_id = "file-id"
ssl_root_ca = "ca.pem"
ssl_cert = "cert.pem"
ssl_key = "key.pem"
command = "file-command"
"#,
        )
        .unwrap();

        let cli = CliOverrides {
            mqtt_endpoint: Some("cli-broker".to_string()),
            command: Some("cli-command".to_string()),
            ..Default::default()
        };

        let config = resolve(file, cli).unwrap();
        assert_eq!(config.transport.host, "cli-broker");
        assert_eq!(config.transport.port, DEFAULT_PORT);
        assert_eq!(config.transport.client_id, "file-id");
        assert_eq!(config.command.as_deref(), Some("cli-command"));
        assert_eq!(config.subscription.topic_filter, "file/topic");
    }

    #[test]
    fn test_resolve_defaults() {
        let file: FileConfig = toml::from_str(
            r#"
mqtt_endpoint = "broker"
mqtt_topic = "t/#"
ssl_root_ca = "ca.pem"
ssl_cert = "cert.pem"
ssl_key = "key.pem"
"#,
        )
        .unwrap();

        let config = resolve(file, CliOverrides::default()).unwrap();
        assert_eq!(config.transport.client_id, DEFAULT_CLIENT_ID);
        assert_eq!(config.subscription.qos, SubscribeQos::AtLeastOnce);
        assert!(config.command.is_none());
        assert!(!config.debug);
    }

    #[test]
    fn test_resolve_missing_endpoint_fails() {
        let file: FileConfig = toml::from_str("mqtt_topic = \"t\"").unwrap();
        let result = resolve(file, CliOverrides::default());
        assert!(matches!(
            result,
            Err(ConfigError::MissingSetting("mqtt_endpoint"))
        ));
    }

    #[test]
    fn test_resolve_missing_credential_path_fails() {
        let file: FileConfig = toml::from_str(
            r#"
mqtt_endpoint = "broker"
mqtt_topic = "t"
ssl_root_ca = "ca.pem"
ssl_cert = "cert.pem"
"#,
        )
        .unwrap();
        let result = resolve(file, CliOverrides::default());
        assert!(matches!(result, Err(ConfigError::MissingSetting("ssl_key"))));
    }

    #[test]
    fn test_validate_credentials_all_readable() {
        let mut ca = NamedTempFile::new().unwrap();
        ca.write_all(b"ca").unwrap();
        let mut cert = NamedTempFile::new().unwrap();
        cert.write_all(b"cert").unwrap();
        let mut key = NamedTempFile::new().unwrap();
        key.write_all(b"key").unwrap();

        let cli = cli_with_credentials(ca.path(), cert.path(), key.path());
        let config = resolve(FileConfig::default(), cli).unwrap();
        assert!(config.validate_credentials().is_ok());
    }

    #[test]
    fn test_validate_credentials_missing_file_is_fatal() {
        let ca = NamedTempFile::new().unwrap();
        let cert = NamedTempFile::new().unwrap();

        let cli = cli_with_credentials(
            ca.path(),
            cert.path(),
            Path::new("/nonexistent/private.pem.key"),
        );
        let config = resolve(FileConfig::default(), cli).unwrap();

        let err = config.validate_credentials().unwrap_err();
        match err {
            ConfigError::UnreadableCredential { role, .. } => assert_eq!(role, "ssl_key"),
            other => panic!("expected UnreadableCredential, got {other:?}"),
        }
    }
}
