use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::tls::certificate::CERT_FILE;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Address to listen on
    /// Default: 0.0.0.0
    #[serde(default = "default_listen")]
    pub listen: IpAddr,
    /// Port to listen on
    /// Default: 443 with TLS enabled, 80 without
    #[serde(default)]
    pub port: Option<u16>,
    /// Already-listening TCP socket inherited from the service
    /// manager, as a raw file descriptor.  When set, the gateway
    /// adopts this socket instead of binding listen/port.
    #[serde(default)]
    pub listen_fd: Option<i32>,
    /// TLS termination configuration
    #[serde(default)]
    pub tls: TlsSettings,
    /// HTTP limits
    #[serde(default)]
    pub http: HttpSettings,
    /// Path of the persistent-state JSON document
    #[serde(default = "default_persistence")]
    pub persistence: PathBuf,
    /// Seconds to wait for live connections on shutdown
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
    /// Local account table used by the credential checker when no
    /// platform account service is wired in
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    /// Statically registered web-asset routes.  A nonempty list means
    /// a web UI is installed.
    #[serde(default)]
    pub webroutes: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: None,
            listen_fd: None,
            tls: TlsSettings::default(),
            http: HttpSettings::default(),
            persistence: default_persistence(),
            shutdown_secs: default_shutdown_secs(),
            credentials: HashMap::new(),
            webroutes: Vec::new(),
        }
    }
}

impl Config {
    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.tls.enabled { 443 } else { 80 })
    }

    /// Hard request-body cap in bytes.
    pub fn body_limit(&self) -> usize {
        (self.http.body_limit_mb as usize) * 1024 * 1024
    }

    /// Hostname used as the certificate subject CN: the configured
    /// value, else the system hostname, else a fixed placeholder.
    pub fn hostname(&self) -> String {
        if let Some(hostname) = &self.tls.hostname {
            return hostname.clone();
        }
        if let Ok(hostname) = std::fs::read_to_string("/etc/hostname") {
            let hostname = hostname.trim();
            if !hostname.is_empty() {
                return hostname.to_owned();
            }
        }
        "testhost".to_owned()
    }
}

/// TLS termination configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TlsSettings {
    /// Serve HTTPS (default) or plain HTTP
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Combined private key + certificate PEM file.  Regenerated in
    /// place when missing or invalid.
    #[serde(default = "default_cert_path")]
    pub cert_path: PathBuf,
    /// Directory of CA certificates trusted for client authentication
    #[serde(default = "default_trust_store")]
    pub trust_store: PathBuf,
    /// Subject CN for generated certificates
    /// Default: the system hostname
    #[serde(default)]
    pub hostname: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            cert_path: default_cert_path(),
            trust_store: default_trust_store(),
            hostname: None,
        }
    }
}

/// HTTP limits
#[derive(Debug, Deserialize, Clone)]
pub struct HttpSettings {
    /// Hard request-body cap in MiB
    #[serde(default = "default_body_limit_mb")]
    pub body_limit_mb: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self { body_limit_mb: default_body_limit_mb() }
    }
}

fn default_listen() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
}

fn default_true() -> bool {
    true
}

fn default_cert_path() -> PathBuf {
    PathBuf::from(CERT_FILE)
}

fn default_trust_store() -> PathBuf {
    PathBuf::from("/etc/ssl/certs/authority")
}

fn default_persistence() -> PathBuf {
    PathBuf::from("bmcgate_persistent_data.json")
}

fn default_shutdown_secs() -> u64 {
    10
}

fn default_body_limit_mb() -> u64 {
    1
}
