use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use libvmproxy::EngineConfig;
use libvmproxy::config::{
    DEFAULT_CLIENT_QUEUE_DEPTH, DEFAULT_PROCESS_WAIT_TIMEOUT, DEFAULT_SHIM_WAIT_TIMEOUT,
};
use serde::Deserialize;
use vmproxy_protocol::paths;

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    pub log_level: String,
    /// Stream each VM's console into the debug log.
    pub enable_vm_console: bool,
    pub shim_wait_timeout_secs: u64,
    pub process_wait_timeout_secs: u64,
    pub client_queue_depth: usize,
}

impl ServerConfig {
    /// Read `path`, or the default config file when `path` is `None`. A
    /// missing default file yields the defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (paths::config_path(), false),
        };
        if !required && !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            shim_wait_timeout: Duration::from_secs(self.shim_wait_timeout_secs),
            process_wait_timeout: Duration::from_secs(self.process_wait_timeout_secs),
            client_queue_depth: self.client_queue_depth.max(1),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: paths::default_socket_path(),
            log_level: "warn".to_string(),
            enable_vm_console: false,
            shim_wait_timeout_secs: DEFAULT_SHIM_WAIT_TIMEOUT.as_secs(),
            process_wait_timeout_secs: DEFAULT_PROCESS_WAIT_TIMEOUT.as_secs(),
            client_queue_depth: DEFAULT_CLIENT_QUEUE_DEPTH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            socket_path = "/run/vmproxy/proxy.sock"
            enable_vm_console = true
            shim_wait_timeout_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/vmproxy/proxy.sock"));
        assert!(config.enable_vm_console);
        assert_eq!(config.log_level, "warn");

        let engine = config.engine();
        assert_eq!(engine.shim_wait_timeout, Duration::from_secs(5));
        assert_eq!(engine.process_wait_timeout, DEFAULT_PROCESS_WAIT_TIMEOUT);
        assert_eq!(engine.client_queue_depth, DEFAULT_CLIENT_QUEUE_DEPTH);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(ServerConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn explicit_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "log_level = \"debug\"\nclient_queue_depth = 0\n").unwrap();
        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.engine().client_queue_depth, 1);
    }
}
