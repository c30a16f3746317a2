use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("HEADROOM_TLS_CERT and HEADROOM_TLS_KEY must be set together")]
    TlsPair,
    #[error("reading {path}: {source}")]
    TlsFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("TLS setup: {0}")]
    Tls(String),
}

/// Server settings, read once at startup from `HEADROOM_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger the next one.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Tenant to fill with demo data at startup if it is empty.
    pub seed_tenant: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "headroom".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            seed_tenant: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables take
    /// their default; set but unparsable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            port: parse_var(&get, "HEADROOM_PORT")?.unwrap_or(defaults.port),
            bind: get("HEADROOM_BIND").unwrap_or(defaults.bind),
            data_dir: get("HEADROOM_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            password: get("HEADROOM_PASSWORD").unwrap_or(defaults.password),
            max_connections: parse_var(&get, "HEADROOM_MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            compact_threshold: parse_var(&get, "HEADROOM_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            metrics_port: parse_var(&get, "HEADROOM_METRICS_PORT")?,
            tls_cert: get("HEADROOM_TLS_CERT").map(PathBuf::from),
            tls_key: get("HEADROOM_TLS_KEY").map(PathBuf::from),
            seed_tenant: get("HEADROOM_SEED_TENANT"),
        };

        if config.max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "HEADROOM_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if config.tls_cert.is_some() != config.tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    /// Build the TLS acceptor when a certificate and key are configured.
    pub fn tls_acceptor(&self) -> Result<Option<TlsAcceptor>, ConfigError> {
        let (Some(cert_path), Some(key_path)) = (&self.tls_cert, &self.tls_key) else {
            return Ok(None);
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut open(cert_path)?)
            .collect::<Result<_, _>>()
            .map_err(|source| ConfigError::TlsFile {
                path: cert_path.clone(),
                source,
            })?;
        let key = rustls_pemfile::private_key(&mut open(key_path)?)
            .map_err(|source| ConfigError::TlsFile {
                path: key_path.clone(),
                source,
            })?
            .ok_or_else(|| ConfigError::NoPrivateKey(key_path.clone()))?;

        let mut server = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ConfigError::Tls(e.to_string()))?;
        server.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(server))))
    }
}

fn parse_var<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(var)
        .map(|value| {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                var,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ConfigError::TlsFile {
            path: path.to_path_buf(),
            source,
        })
}
