//! Relay client configuration
//!
//! [`ClientConfig`] is built exactly once at startup (see [`crate::cli`]) and is
//! never mutated afterwards. Certificate and key files are read fully into
//! memory as NUL-terminated [`PemBuffer`]s.
//!
//! Values that have no command-line flag live in an optional TOML file and are
//! collected in [`TuningConfig`]. Every default matches the built-in constants
//! below, so running without a file behaves exactly like the bare CLI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Broker dialed when `--url` is not given
pub const DEFAULT_URL: &str = "mqtt-tcp://127.0.0.1:1883";
/// Number of concurrent work items when `--parallel` is absent or zero
pub const DEFAULT_PARALLEL: usize = 32;
/// CONNECT keep-alive in seconds
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;
/// CONNECT carries keep-alive as a u16
pub const MAX_KEEP_ALIVE_SECS: u64 = u16::MAX as u64;
/// rumqttc rejects shorter MQTT 5 keep-alives
pub const MIN_KEEP_ALIVE_SECS_V5: u64 = 5;

pub const SUB_TOPIC1: &str = "/nanomq/msg/1";
pub const SUB_TOPIC2: &str = "/nanomq/msg/2";
/// Every received message is republished here
pub const RELAY_TOPIC: &str = "/nanomq/msg/transfer";

pub const DEFAULT_PERSISTENCE_DIR: &str = "/tmp/";
pub const DEFAULT_DB_NAME: &str = "mqtt_client.db";
pub const DEFAULT_MAX_ROWS: usize = 500;
pub const DEFAULT_FLUSH_THRESHOLD: usize = 50;

/// MQTT protocol revision spoken on the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProtocolVersion {
    /// MQTT 3.1.1 (protocol level 4)
    #[default]
    V311,
    /// MQTT 5.0 (protocol level 5)
    V5,
}

impl ProtocolVersion {
    pub const V311_CODE: u8 = 4;
    pub const V5_CODE: u8 = 5;

    /// Map a numeric protocol level to a version. Zero selects the default.
    pub fn from_code(code: u8) -> Result<Self, ConfigError> {
        match code {
            0 | Self::V311_CODE => Ok(ProtocolVersion::V311),
            Self::V5_CODE => Ok(ProtocolVersion::V5),
            other => Err(ConfigError::UnsupportedVersion(other)),
        }
    }

    /// Numeric protocol level carried in CONNECT
    pub fn code(self) -> u8 {
        match self {
            ProtocolVersion::V311 => Self::V311_CODE,
            ProtocolVersion::V5 => Self::V5_CODE,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = ConfigError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(version: ProtocolVersion) -> Self {
        version.code()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::V311 => write!(f, "3.1.1"),
            ProtocolVersion::V5 => write!(f, "5.0"),
        }
    }
}

/// File contents held in memory with a trailing NUL byte.
///
/// [`PemBuffer::len`] excludes the terminator; [`PemBuffer::as_bytes`] returns
/// the exact file contents.
#[derive(Clone, PartialEq, Eq)]
pub struct PemBuffer {
    data: Vec<u8>,
}

impl PemBuffer {
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        bytes.push(0);
        Self { data: bytes }
    }

    pub fn len(&self) -> usize {
        self.data.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len()]
    }

    pub fn as_bytes_with_nul(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for PemBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PemBuffer").field("len", &self.len()).finish()
    }
}

/// Private key passphrase; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPassphrase(String);

impl KeyPassphrase {
    pub fn new<S: Into<String>>(pass: S) -> Self {
        Self(pass.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeyPassphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyPassphrase(***)")
    }
}

/// Read a whole file into memory. The path `-` reads standard input.
pub fn load_file(path: &str) -> Result<PemBuffer, ConfigError> {
    if path == "-" {
        let stdin = io::stdin();
        let mut handle = stdin.lock();
        return load_from_reader(&mut handle, path);
    }

    let mut file = File::open(path).map_err(|source| ConfigError::FileOpen {
        path: path.to_string(),
        source,
    })?;
    load_from_reader(&mut file, path)
}

/// Drain `reader` into a [`PemBuffer`]; `origin` names the source in errors
pub fn load_from_reader<R: Read + ?Sized>(
    reader: &mut R,
    origin: &str,
) -> Result<PemBuffer, ConfigError> {
    let mut data = Vec::new();
    reader
        .read_to_end(&mut data)
        .map_err(|source| ConfigError::FileRead {
            path: origin.to_string(),
            source,
        })?;
    Ok(PemBuffer::from_bytes(data))
}

/// One entry of the SUBSCRIBE request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicQos {
    pub topic: String,
    pub qos: u8,
}

impl TopicQos {
    pub fn new<S: Into<String>>(topic: S, qos: u8) -> Self {
        Self {
            topic: topic.into(),
            qos,
        }
    }
}

/// `[mqtt]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttTuning {
    pub keep_alive_secs: u64,
    /// Capacity of the rumqttc request channel
    pub request_capacity: usize,
}

impl MqttTuning {
    /// Keep-alive range accepted for `version`: 0..=65535 for 3.1.1,
    /// 5..=65535 for 5
    pub fn validate_keep_alive(&self, version: ProtocolVersion) -> Result<(), ConfigError> {
        let secs = self.keep_alive_secs;
        let min = match version {
            ProtocolVersion::V311 => 0,
            ProtocolVersion::V5 => MIN_KEEP_ALIVE_SECS_V5,
        };
        if secs < min || secs > MAX_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs {} out of range {}..={} for MQTT {}",
                secs, min, MAX_KEEP_ALIVE_SECS, version
            )));
        }
        Ok(())
    }
}

impl Default for MqttTuning {
    fn default() -> Self {
        Self {
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            request_capacity: 64,
        }
    }
}

/// `[relay]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayTuning {
    pub relay_topic: String,
    pub relay_qos: u8,
    pub subscriptions: Vec<TopicQos>,
    /// Pause between receive and republish; zero only yields to the scheduler
    pub process_delay_ms: u64,
    /// Zero keeps send failures fatal
    pub send_retries: u32,
}

impl Default for RelayTuning {
    fn default() -> Self {
        Self {
            relay_topic: RELAY_TOPIC.to_string(),
            relay_qos: 0,
            subscriptions: vec![TopicQos::new(SUB_TOPIC1, 1), TopicQos::new(SUB_TOPIC2, 2)],
            process_delay_ms: 0,
            send_retries: 0,
        }
    }
}

/// `[persistence]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceTuning {
    pub dir: PathBuf,
    pub db_name: String,
    pub max_rows: usize,
    pub flush_threshold: usize,
}

impl Default for PersistenceTuning {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_PERSISTENCE_DIR),
            db_name: DEFAULT_DB_NAME.to_string(),
            max_rows: DEFAULT_MAX_ROWS,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

/// `[reconnect]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectTuning {
    pub backoff_ms: Vec<u64>,
    pub sustained_delay_ms: u64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectTuning {
    fn default() -> Self {
        Self {
            backoff_ms: vec![25, 50, 100, 250],
            sustained_delay_ms: 250,
            max_attempts: None,
        }
    }
}

/// Values loaded from the optional `--config` TOML file
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    pub mqtt: MqttTuning,
    pub relay: RelayTuning,
    pub persistence: PersistenceTuning,
    pub reconnect: ReconnectTuning,
}

impl TuningConfig {
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: display,
            source,
        })?;
        let tuning: TuningConfig = toml::from_str(&content)?;
        tuning.validate()?;
        Ok(tuning)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay.relay_topic.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "relay_topic must not be empty".to_string(),
            ));
        }
        if self.relay.relay_qos > 2 {
            return Err(ConfigError::InvalidConfig(format!(
                "relay_qos {} is not a valid QoS level",
                self.relay.relay_qos
            )));
        }
        if self.relay.subscriptions.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one subscription is required".to_string(),
            ));
        }
        for sub in &self.relay.subscriptions {
            if sub.topic.is_empty() || sub.qos > 2 {
                return Err(ConfigError::InvalidConfig(format!(
                    "invalid subscription '{}' with QoS {}",
                    sub.topic, sub.qos
                )));
            }
        }
        if self.mqtt.keep_alive_secs > MAX_KEEP_ALIVE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs {} exceeds {}",
                self.mqtt.keep_alive_secs, MAX_KEEP_ALIVE_SECS
            )));
        }
        if self.mqtt.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "request_capacity must be at least 1".to_string(),
            ));
        }
        if self.persistence.max_rows == 0 || self.persistence.flush_threshold == 0 {
            return Err(ConfigError::InvalidConfig(
                "persistence max_rows and flush_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fully resolved client configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub url: String,
    pub version: ProtocolVersion,
    pub parallel: usize,
    pub enable_tls: bool,
    pub cacert: Option<PemBuffer>,
    pub cert: Option<PemBuffer>,
    pub key: Option<PemBuffer>,
    pub keypass: Option<KeyPassphrase>,
    pub enable_persistence: bool,
    pub tuning: TuningConfig,
}

impl ClientConfig {
    /// Tuning checks plus the ones that depend on the protocol version
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tuning.validate()?;
        self.tuning.mqtt.validate_keep_alive(self.version)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            version: ProtocolVersion::default(),
            parallel: DEFAULT_PARALLEL,
            enable_tls: false,
            cacert: None,
            cert: None,
            key: None,
            keypass: None,
            enable_persistence: false,
            tuning: TuningConfig::default(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot open file {path}: {source}")]
    FileOpen {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Read from {path} failed: {source}")]
    FileRead {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Unsupported MQTT protocol version {0} (expected 4 or 5)")]
    UnsupportedVersion(u8),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_protocol_version_codes() {
        assert_eq!(ProtocolVersion::from_code(0).unwrap(), ProtocolVersion::V311);
        assert_eq!(ProtocolVersion::from_code(4).unwrap(), ProtocolVersion::V311);
        assert_eq!(ProtocolVersion::from_code(5).unwrap(), ProtocolVersion::V5);
        assert!(matches!(
            ProtocolVersion::from_code(3),
            Err(ConfigError::UnsupportedVersion(3))
        ));
        assert_eq!(ProtocolVersion::V5.code(), 5);
        assert_eq!(u8::from(ProtocolVersion::V311), 4);
    }

    #[test]
    fn test_pem_buffer_is_nul_terminated() {
        let buf = PemBuffer::from_bytes(b"-----BEGIN-----".to_vec());
        assert_eq!(buf.len(), 15);
        assert_eq!(buf.as_bytes(), b"-----BEGIN-----");
        assert_eq!(buf.as_bytes_with_nul().last(), Some(&0u8));
        assert_eq!(buf.as_bytes_with_nul().len(), 16);
    }

    #[test]
    fn test_load_file_exact_contents() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let contents: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        file.write_all(&contents).unwrap();

        let buf = load_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(buf.len(), contents.len());
        assert_eq!(buf.as_bytes(), &contents[..]);
    }

    #[test]
    fn test_load_file_missing_path() {
        let result = load_file("/definitely/not/here/ca.pem");
        match result {
            Err(ConfigError::FileOpen { path, .. }) => {
                assert_eq!(path, "/definitely/not/here/ca.pem")
            }
            other => panic!("expected FileOpen error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_reader_empty() {
        let mut reader = Cursor::new(Vec::<u8>::new());
        let buf = load_from_reader(&mut reader, "-").unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.as_bytes_with_nul(), &[0u8]);
    }

    #[test]
    fn test_keypass_debug_is_redacted() {
        let pass = KeyPassphrase::new("hunter2");
        assert!(!format!("{pass:?}").contains("hunter2"));
        assert_eq!(pass.expose(), "hunter2");
    }

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.url, "mqtt-tcp://127.0.0.1:1883");
        assert_eq!(config.version, ProtocolVersion::V311);
        assert_eq!(config.parallel, 32);
        assert!(!config.enable_tls);
        assert!(!config.enable_persistence);
        assert_eq!(config.tuning.mqtt.keep_alive_secs, 60);
        assert_eq!(config.tuning.relay.relay_topic, "/nanomq/msg/transfer");
        assert_eq!(
            config.tuning.relay.subscriptions,
            vec![
                TopicQos::new("/nanomq/msg/1", 1),
                TopicQos::new("/nanomq/msg/2", 2)
            ]
        );
    }

    #[test]
    fn test_tuning_file_partial_override() {
        let toml_content = r#"
[mqtt]
keep_alive_secs = 30

[relay]
relay_topic = "/bridge/out"
send_retries = 3

[[relay.subscriptions]]
topic = "sensors/#"
qos = 1

[persistence]
dir = "/var/lib/relay"
max_rows = 1000
"#;
        let tuning: TuningConfig = toml::from_str(toml_content).unwrap();
        tuning.validate().unwrap();

        assert_eq!(tuning.mqtt.keep_alive_secs, 30);
        assert_eq!(tuning.mqtt.request_capacity, 64);
        assert_eq!(tuning.relay.relay_topic, "/bridge/out");
        assert_eq!(tuning.relay.send_retries, 3);
        assert_eq!(tuning.relay.subscriptions.len(), 1);
        assert_eq!(tuning.persistence.dir, PathBuf::from("/var/lib/relay"));
        assert_eq!(tuning.persistence.max_rows, 1000);
        assert_eq!(tuning.persistence.flush_threshold, 50);
        assert_eq!(tuning.reconnect.backoff_ms, vec![25, 50, 100, 250]);
    }

    #[test]
    fn test_tuning_validation_rejects_bad_qos() {
        let mut tuning = TuningConfig::default();
        tuning.relay.subscriptions = vec![TopicQos::new("a/b", 3)];
        assert!(matches!(
            tuning.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        let mut tuning = TuningConfig::default();
        tuning.relay.relay_qos = 7;
        assert!(tuning.validate().is_err());
    }

    #[test]
    fn test_keep_alive_above_u16_rejected() {
        let mut tuning = TuningConfig::default();
        tuning.mqtt.keep_alive_secs = 70_000;
        assert!(matches!(
            tuning.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_keep_alive_range_depends_on_version() {
        let mut config = ClientConfig::default();
        config.tuning.mqtt.keep_alive_secs = 2;
        assert!(config.validate().is_ok());

        config.version = ProtocolVersion::V5;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        config.tuning.mqtt.keep_alive_secs = 5;
        assert!(config.validate().is_ok());

        config.version = ProtocolVersion::V311;
        config.tuning.mqtt.keep_alive_secs = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tuning_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay]\nprocess_delay_ms = 5").unwrap();

        let tuning = TuningConfig::load_from_file(file.path()).unwrap();
        assert_eq!(tuning.relay.process_delay_ms, 5);
    }

    #[test]
    fn test_tuning_load_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[relay\nbroken").unwrap();

        let result = TuningConfig::load_from_file(file.path());
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }
}
