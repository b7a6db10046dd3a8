use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PogoError, Result};

/// Dispatcher process configuration, loadable from a YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Stable identity for the liveness record and job ownership claims.
    pub dispatcher_id: String,
    /// HTTP API bind address.
    pub bind: SocketAddr,
    /// Optional listener for inbound worker sessions.
    pub worker_bind: Option<SocketAddr>,
    /// Worker addresses the dispatcher dials and keeps connected.
    pub workers: Vec<String>,
    /// Reconnect grace window after a worker session drop, seconds.
    pub grace_window_secs: u64,
    /// Logical server name presented when dialing workers over TLS.
    pub tls_server_name: String,
    pub tls: TlsConfig,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dispatcher_id: format!("dispatcher-{}", uuid::Uuid::new_v4().simple()),
            bind: "127.0.0.1:4080".parse().expect("valid default bind"),
            worker_bind: None,
            workers: Vec::new(),
            grace_window_secs: 30,
            tls_server_name: "pogo-worker".to_string(),
            tls: TlsConfig::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PogoError::InvalidSpec(format!("cannot read config {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&raw)
            .map_err(|e| PogoError::InvalidSpec(format!("config {}: {}", path.display(), e)))
    }

    pub fn grace_window(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.grace_window_secs)
    }
}

/// TLS material locations for worker sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub ca_cert_path: Option<PathBuf>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Allowed worker certificate SHA-256 fingerprints; empty disables
    /// pinning.
    pub pinned_fingerprints: Vec<String>,
}

impl TlsConfig {
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = DispatcherConfig::default();
        assert_eq!(config.grace_window_secs, 30);
        assert!(config.workers.is_empty());
        assert!(!config.tls.enabled);
        assert!(config.dispatcher_id.starts_with("dispatcher-"));
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let config: DispatcherConfig =
            serde_yaml::from_str("bind: \"0.0.0.0:9000\"\nworkers: [\"w1:7000\"]\n").unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.workers, vec!["w1:7000".to_string()]);
        assert_eq!(config.grace_window_secs, 30);
    }
}
