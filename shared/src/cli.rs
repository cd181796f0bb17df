//! Command-line arguments shared by the robot and coordinator binaries

use crate::broker::{BrokerConfig, BrokerError, TlsFiles};
use crate::timing;
use clap::{Args, ValueEnum};
use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use uuid::Uuid;

/// Log verbosity accepted by `--verbosity`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Verbosity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Off,
}

impl Verbosity {
    /// Level filter to seed the log filter with
    pub fn level_filter(&self) -> LevelFilter {
        match self {
            Verbosity::Trace => LevelFilter::TRACE,
            Verbosity::Debug => LevelFilter::DEBUG,
            Verbosity::Info => LevelFilter::INFO,
            Verbosity::Warn => LevelFilter::WARN,
            Verbosity::Error => LevelFilter::ERROR,
            Verbosity::Off => LevelFilter::OFF,
        }
    }
}

/// Broker connection arguments
#[derive(Debug, Clone, Args)]
pub struct ConnectionArgs {
    /// Broker endpoint host name, not including a port
    #[arg(long)]
    pub endpoint: String,

    /// Broker port
    #[arg(long, default_value_t = timing::DEFAULT_PORT)]
    pub port: u16,

    /// File path to the client certificate, in PEM format
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// File path to the private key, in PEM format
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// File path to the root certificate authority, in PEM format
    #[arg(long)]
    pub root_ca: Option<PathBuf>,

    /// Client ID for the MQTT connection
    #[arg(long, default_value_t = default_client_id())]
    pub client_id: String,

    /// Logging level
    #[arg(long, value_enum, default_value_t = Verbosity::Info)]
    pub verbosity: Verbosity,
}

fn default_client_id() -> String {
    format!("test-{}", Uuid::new_v4())
}

impl ConnectionArgs {
    /// Build the broker configuration; TLS is used whenever a root CA is given
    pub fn broker_config(&self) -> Result<BrokerConfig, BrokerError> {
        let tls = match (&self.root_ca, &self.cert, &self.key) {
            (Some(root_ca), cert, key) => Some(TlsFiles {
                root_ca: root_ca.clone(),
                cert: cert.clone(),
                key: key.clone(),
            }),
            (None, None, None) => None,
            (None, _, _) => {
                return Err(BrokerError::Tls(
                    "--root-ca is required with --cert/--key".into(),
                ))
            }
        };

        Ok(BrokerConfig {
            endpoint: self.endpoint.clone(),
            port: self.port,
            client_id: self.client_id.clone(),
            tls,
            ..Default::default()
        })
    }
}
