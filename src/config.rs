//! Proxy configuration files.
//!
//! A [`ProxyConfig`] is (de)serialised to/from TOML:
//!
//! ```toml
//! auth_token = "secret"
//! server_addr = "127.0.0.1:8080"
//! forward_bind_addr = "127.0.0.1:3128"
//! proxy_bind_addr = "0.0.0.0:4433"
//! connect_timeout_ms = 5000
//!
//! [tls]
//! key_path = "node.key"
//! cert_path = "node.chain.pem"
//! ```

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{ensure, Backtrace, ResultExt, Snafu};
use tracing::debug;

use crate::{
    connection::ConnectionConfig,
    proxy::ProxyBuilder,
    tls::{TlsConfig, TlsConfigError},
};

/// Configuration of a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// The token local clients present in their `Proxy-Authorization` header.
    pub auth_token: String,
    /// The backend service reverse tunnels are spliced onto.
    pub server_addr: SocketAddr,
    /// The socket address of the HTTP `CONNECT` listener.
    ///
    /// Defaults to a random localhost port.
    #[serde(default = "cfg_defaults::bind_addr")]
    pub forward_bind_addr: SocketAddr,
    /// The socket address of the UDP socket peers connect to.
    ///
    /// Defaults to a random localhost port.
    #[serde(default = "cfg_defaults::bind_addr")]
    pub proxy_bind_addr: SocketAddr,
    /// Bound on establishing a connection, in milliseconds.
    ///
    /// Defaults to `2000`, at most `20000`.
    #[serde(default = "cfg_defaults::connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// A connection which hears nothing from its peer for this long stops, in milliseconds.
    ///
    /// Defaults to `20000`.
    #[serde(default = "cfg_defaults::keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,
    /// Interval of keep-alive pings, in milliseconds.
    ///
    /// Defaults to `1000`.
    #[serde(default = "cfg_defaults::keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    /// Interval of hole punching pings, in milliseconds.
    ///
    /// Defaults to `1000`.
    #[serde(default = "cfg_defaults::punch_interval_ms")]
    pub punch_interval_ms: u64,
    /// Bound on the graceful end of a tunnel, in milliseconds.
    ///
    /// Defaults to `1000`.
    #[serde(default = "cfg_defaults::end_timeout_ms")]
    pub end_timeout_ms: u64,
    /// The key and certificate chain to present.
    pub tls: TlsPaths,
}

/// Where to find the PEM encoded TLS key and certificate chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPaths {
    /// The PKCS#8 private key.
    pub key_path: PathBuf,
    /// The certificate chain, leaf first.
    pub cert_path: PathBuf,
}

impl ProxyConfig {
    /// Reads the configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        ensure!(path.is_file(), NotAFileSnafu { path });
        let config = tokio::fs::read_to_string(path)
            .await
            .context(ReadSnafu { path })?;
        debug!(path = %path.display(), "loaded config");
        Self::from_str(&config)
    }

    /// Parses the configuration from TOML.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(config: &str) -> Result<Self, ConfigError> {
        toml::from_str(config).context(ParseSnafu)
    }

    /// The connection timing parameters.
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            keep_alive_timeout: Duration::from_millis(self.keep_alive_timeout_ms),
            keep_alive_interval: Duration::from_millis(self.keep_alive_interval_ms),
            punch_interval: Duration::from_millis(self.punch_interval_ms),
            end_timeout: Duration::from_millis(self.end_timeout_ms),
        }
    }

    /// Reads the TLS files and creates a builder for the configured proxy.
    pub async fn into_builder(self) -> Result<ProxyBuilder, ConfigError> {
        let tls_config = self.tls.load().await?;
        let connection_config = self.connection_config();
        Ok(ProxyBuilder::new(tls_config, self.auth_token, self.server_addr)
            .forward_addr(self.forward_bind_addr)
            .proxy_addr(self.proxy_bind_addr)
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .connection_config(connection_config))
    }
}

impl TlsPaths {
    async fn load(&self) -> Result<TlsConfig, ConfigError> {
        let key = tokio::fs::read(&self.key_path).await.context(ReadSnafu {
            path: &self.key_path,
        })?;
        let chain = tokio::fs::read(&self.cert_path).await.context(ReadSnafu {
            path: &self.cert_path,
        })?;
        TlsConfig::from_pem(&key, &chain).context(TlsSnafu)
    }
}

mod cfg_defaults {
    use super::*;
    use crate::defaults::timeouts::*;

    pub(crate) fn bind_addr() -> SocketAddr {
        (Ipv4Addr::LOCALHOST, 0).into()
    }

    pub(crate) fn connect_timeout_ms() -> u64 {
        DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
    }

    pub(crate) fn keep_alive_timeout_ms() -> u64 {
        DEFAULT_KEEP_ALIVE_TIMEOUT.as_millis() as u64
    }

    pub(crate) fn keep_alive_interval_ms() -> u64 {
        DEFAULT_KEEP_ALIVE_INTERVAL.as_millis() as u64
    }

    pub(crate) fn punch_interval_ms() -> u64 {
        DEFAULT_PUNCH_INTERVAL.as_millis() as u64
    }

    pub(crate) fn end_timeout_ms() -> u64 {
        DEFAULT_END_TIMEOUT.as_millis() as u64
    }
}

/// Errors loading a configuration.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ConfigError {
    #[snafu(display("config path {} must be a file", path.display()))]
    NotAFile { path: PathBuf },
    #[snafu(display("unable to read {}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("config must be valid toml"))]
    Parse { source: toml::de::Error },
    #[snafu(display("invalid TLS key or certificate chain"))]
    Tls { source: TlsConfigError },
}
