//! Container teardown against the Docker Engine
use crate::config::EngineEndpoint;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bollard::container::{KillContainerOptions, RemoveContainerOptions};
use bollard::errors::Error as DockerError;
use bollard::Docker;

/// Seconds before an Engine request made during cleanup is abandoned
const ENGINE_TIMEOUT: u64 = 30;

/// Kills and removes containers when a session ends.
///
/// Implementations report an already absent container as success.
#[async_trait]
pub trait ContainerCleaner: Send + Sync {
  /// Stop a running container
  async fn kill(&self, container_id: &str) -> Result<()>;
  /// Remove a container, forcing it if it still runs
  async fn remove(&self, container_id: &str) -> Result<()>;
}

/// `ContainerCleaner` backed by the real Engine
pub struct DockerEngine {
  docker: Docker,
}

impl DockerEngine {
  /// Connect to the Engine at `endpoint`.
  ///
  /// This only prepares the client; no request is made until cleanup runs.
  pub fn connect(endpoint: &EngineEndpoint) -> Result<Self> {
    let docker = match endpoint {
      #[cfg(unix)]
      EngineEndpoint::Unix(path) => Docker::connect_with_unix(
        &path.to_string_lossy(),
        ENGINE_TIMEOUT,
        bollard::API_DEFAULT_VERSION,
      )?,
      #[cfg(not(unix))]
      EngineEndpoint::Unix(path) => {
        return Err(crate::error::Error::config_error(format!(
          "unix socket {} is not supported on this platform",
          path.display()
        )))
      }
      EngineEndpoint::Tcp(addr) => Docker::connect_with_http(
        &format!("http://{}", addr),
        ENGINE_TIMEOUT,
        bollard::API_DEFAULT_VERSION,
      )?,
    };
    Ok(Self { docker })
  }
}

#[async_trait]
impl ContainerCleaner for DockerEngine {
  async fn kill(&self, container_id: &str) -> Result<()> {
    match self
      .docker
      .kill_container(container_id, None::<KillContainerOptions<String>>)
      .await
    {
      Ok(()) => {
        tracing::debug!("Killed container {}", container_id);
        Ok(())
      }
      // not running
      Err(DockerError::DockerResponseServerError {
        status_code: 409, ..
      }) => Ok(()),
      // already gone
      Err(DockerError::DockerResponseServerError {
        status_code: 404, ..
      }) => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  async fn remove(&self, container_id: &str) -> Result<()> {
    let options = RemoveContainerOptions {
      force: true,
      ..Default::default()
    };
    match self.docker.remove_container(container_id, Some(options)).await {
      Ok(()) => Ok(()),
      Err(e) => {
        let error = Error::from(e);
        if error.is_not_found() {
          Ok(())
        } else {
          Err(error)
        }
      }
    }
  }
}
