//! Agent configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sideload::{Entrypoints, Launchers};
use thiserror::Error;

/// Port the deployed agent listens on.
pub const DEFAULT_PORT: u16 = 8123;

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        /// Config file path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// The config file is not valid JSON for [`AgentConfig`]
    #[error("failed to parse config {}: {source}", .path.display())]
    Parse {
        /// Config file path
        path: PathBuf,
        /// Underlying parse error
        #[source]
        source: serde_json::Error,
    },
}

/// Everything the agent needs to know at start-up.
///
/// Missing fields in a config file fall back to [`AgentConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Address the secure listener binds to
    pub listen_addr: SocketAddr,
    /// Sandbox root for synchronized files
    pub sideload_dir: PathBuf,
    /// Default install directory, searched for entrypoints after the sandbox
    pub default_app_dir: PathBuf,
    /// PEM certificate chain presented to clients
    pub server_cert: PathBuf,
    /// PEM private key for `server_cert`
    pub server_key: PathBuf,
    /// PEM trust roots used to verify client certificates
    pub client_ca: PathBuf,
    /// Launcher for `.sh` entrypoints
    pub shell: PathBuf,
    /// Interpreter for `.py` entrypoints
    pub python: PathBuf,
    /// Largest accepted upload body in bytes
    pub max_upload_bytes: usize,
    /// Stop the managed application when the agent shuts down
    pub stop_app_on_shutdown: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let launchers = Launchers::default();
        Self {
            listen_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            sideload_dir: PathBuf::from("./sideloaded"),
            default_app_dir: PathBuf::from("/panorama"),
            server_cert: PathBuf::from("./certs_keys/server.pem.cert"),
            server_key: PathBuf::from("./certs_keys/server.pem.key"),
            client_ca: PathBuf::from("./certs_keys/client.pem.cert"),
            shell: launchers.shell,
            python: launchers.python,
            max_upload_bytes: 1024 * 1024 * 1024, // 1 GiB
            stop_app_on_shutdown: true,
        }
    }
}

impl AgentConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Entrypoint candidates in priority order.
    pub fn entrypoints(&self) -> Entrypoints {
        Entrypoints::new(&self.sideload_dir, &self.default_app_dir)
    }

    /// Launch programs for entrypoint scripts.
    pub fn launchers(&self) -> Launchers {
        Launchers {
            shell: self.shell.clone(),
            python: self.python.clone(),
        }
    }
}
