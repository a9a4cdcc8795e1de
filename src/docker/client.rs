use bollard::{Docker, API_DEFAULT_VERSION};
use tracing::info;

use crate::error::{Result, SandboxError};

/// Connection bootstrap for the Docker daemon. The handshake runs once at
/// startup; the underlying client is cheap to clone and share afterwards.
pub struct DockerClient {
    pub(super) docker: Docker,
}

impl DockerClient {
    pub async fn connect(endpoint: Option<&str>) -> Result<Self> {
        let docker = match endpoint {
            Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http") => {
                Docker::connect_with_http(addr, 120, API_DEFAULT_VERSION)
            }
            Some(socket) => {
                let socket = socket.strip_prefix("unix://").unwrap_or(socket);
                Docker::connect_with_socket(socket, 120, API_DEFAULT_VERSION)
            }
            None => Docker::connect_with_socket_defaults(),
        }
        .map_err(|e| SandboxError::runtime_unavailable(e.to_string()))?;

        // Test connection
        let version = docker
            .version()
            .await
            .map_err(|e| SandboxError::runtime_unavailable(format!("version handshake: {e}")))?;

        info!(
            "Connected to Docker daemon version: {}",
            version.version.unwrap_or_default()
        );

        Ok(Self { docker })
    }
}
