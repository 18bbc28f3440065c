//! Service configuration and socket provisioning.
//!
//! The service configuration is a small JSON document shared by the client
//! tools and the service they talk to:
//!
//! ```json
//! { "port": 11000 }
//! ```
//!
//! Optional `send_buffer` / `recv_buffer` fields set the socket buffer sizes
//! in bytes.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::{Endpoint, UdpSocket};
use crate::trace::debug;

/// Configuration file read when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "service.cfg";

/// Host clients connect to when none is given.
pub const DEFAULT_HOST: &str = "localhost";

/// Errors loading configuration or provisioning a socket from it.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The file is not valid configuration JSON.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    /// The service host could not be resolved.
    #[error("failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    /// The socket could not be bound, connected or configured.
    #[error("socket setup failed: {0}")]
    Socket(#[from] io::Error),
}

/// Contents of the service configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// UDP port of the service.
    pub port: u16,
    /// Socket send buffer size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_buffer: Option<usize>,
    /// Socket receive buffer size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recv_buffer: Option<usize>,
}

impl ServiceConfig {
    /// Configuration for `port` with default buffers.
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self {
            port,
            send_buffer: None,
            recv_buffer: None,
        }
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&text)?;
        debug!(path = %path.display(), port = config.port, "loaded service config");
        Ok(config)
    }

    /// Parses configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed JSON or missing fields.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    fn apply_buffers(&self, socket: &UdpSocket) -> io::Result<()> {
        if let Some(size) = self.send_buffer {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(())
    }
}

/// Opens a client socket connected to `host` on the configured port.
///
/// # Errors
///
/// [`ConfigError::Resolve`] if `host` does not resolve, otherwise
/// [`ConfigError::Socket`].
pub fn open_socket(config: &ServiceConfig, host: &str) -> Result<UdpSocket, ConfigError> {
    let peer = Endpoint::resolve(host, config.port).map_err(|source| ConfigError::Resolve {
        host: host.to_owned(),
        port: config.port,
        source,
    })?;
    let socket = UdpSocket::connect(peer)?;
    config.apply_buffers(&socket)?;
    debug!(%peer, "opened client socket");
    Ok(socket)
}

/// Binds a server socket to `localhost` on the configured port.
///
/// Returns the socket with its bound endpoint (which carries the actual port
/// when the configured port is 0).
///
/// # Errors
///
/// [`ConfigError::Socket`] if binding fails.
pub fn bind_socket(config: &ServiceConfig) -> Result<(UdpSocket, Endpoint), ConfigError> {
    let socket = UdpSocket::bind(Endpoint::localhost(config.port))?;
    config.apply_buffers(&socket)?;
    let local = socket.local_addr()?;
    debug!(%local, "bound server socket");
    Ok((socket, local))
}
