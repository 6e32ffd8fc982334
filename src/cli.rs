//! Command-line option parser
//!
//! Turns argv into a [`ClientConfig`]. Parsing either yields a complete
//! configuration or an error; a partially populated config never escapes.
//! `-h/--help` is reported as [`CliError`] with exit code 0 so the caller can
//! print usage and leave, every other failure maps to exit code 1.

use crate::config::{
    load_file, ClientConfig, ConfigError, KeyPassphrase, ProtocolVersion, TuningConfig,
    DEFAULT_PARALLEL, DEFAULT_URL,
};
use clap::error::ErrorKind;
use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;
use thiserror::Error;

/// Asynchronous MQTT relay client
///
/// Subscribes to the configured topics and republishes every message it
/// receives, payload unchanged, to a single relay topic.
#[derive(Parser, Debug)]
#[command(name = "mqtt-async")]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// Number of concurrent work items (0 selects the default of 32)
    #[arg(short = 'n', long = "parallel", value_name = "N", overrides_with = "parallel")]
    pub parallel: Option<usize>,

    /// MQTT protocol version code: 4 for v3.1.1, 5 for v5 [default: 4]
    #[arg(short = 'V', long = "version", value_name = "CODE", overrides_with = "version")]
    pub version: Option<u8>,

    /// Broker URL: 'mqtt-tcp://host:port' or 'tls+mqtt-tcp://host:port'
    /// [default: mqtt-tcp://127.0.0.1:1883]
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,

    /// Buffer outbound messages on disk while the broker is unreachable
    #[arg(long, overrides_with = "sqlite")]
    pub sqlite: bool,

    /// Enable TLS
    #[arg(short = 's', long, overrides_with = "secure")]
    pub secure: bool,

    /// CA certificate file ('-' reads standard input)
    #[arg(long, value_name = "PATH")]
    pub cacert: Option<String>,

    /// Client certificate file ('-' reads standard input)
    #[arg(short = 'E', long, value_name = "PATH")]
    pub cert: Option<String>,

    /// Client private key file ('-' reads standard input)
    #[arg(long, value_name = "PATH")]
    pub key: Option<String>,

    /// Private key passphrase
    #[arg(long, value_name = "PASSPHRASE")]
    pub keypass: Option<String>,

    /// Retry a failed relay publish N times before giving up (0 = fail immediately)
    #[arg(long, value_name = "N")]
    pub send_retries: Option<u32>,

    /// TOML file with tuning values (keep-alive, topics, persistence limits)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// Option parsing failures
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Args(#[from] clap::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CliError {
    /// True when the user asked for `--help`
    pub fn is_help(&self) -> bool {
        matches!(self, CliError::Args(e) if e.kind() == ErrorKind::DisplayHelp)
    }

    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        if self.is_help() {
            0
        } else {
            1
        }
    }
}

/// Parse a full argv (program name first) into a [`ClientConfig`]
pub fn parse_options<I, T>(args: I) -> Result<ClientConfig, CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::try_parse_from(args)?;
    Ok(cli.into_config()?)
}

impl Cli {
    /// Resolve defaults, load file-valued options and apply the tuning file
    pub fn into_config(self) -> Result<ClientConfig, ConfigError> {
        let mut tuning = match &self.config {
            Some(path) => TuningConfig::load_from_file(path)?,
            None => TuningConfig::default(),
        };
        if let Some(retries) = self.send_retries {
            tuning.relay.send_retries = retries;
        }

        let version = ProtocolVersion::from_code(self.version.unwrap_or(0))?;
        let parallel = match self.parallel {
            None | Some(0) => DEFAULT_PARALLEL,
            Some(n) => n,
        };

        let cacert = self.cacert.as_deref().map(load_file).transpose()?;
        let cert = self.cert.as_deref().map(load_file).transpose()?;
        let key = self.key.as_deref().map(load_file).transpose()?;

        let config = ClientConfig {
            url: self.url.unwrap_or_else(|| DEFAULT_URL.to_string()),
            version,
            parallel,
            enable_tls: self.secure,
            cacert,
            cert,
            key,
            keypass: self.keypass.map(KeyPassphrase::new),
            enable_persistence: self.sqlite,
            tuning,
        };
        config.validate()?;
        Ok(config)
    }
}
