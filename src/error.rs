//! Error types for the interception engine

use std::io;
use thiserror::Error;

/// Result type for interception operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for interception operations
///
/// Most of the engine fails open and never surfaces these to a Docker client.
/// They are returned from session control (`start`) and used internally to
/// decide when to fall back to unmodified forwarding.
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// CA certificate or key material could not be used
  #[error("Certificate error: {0}")]
  CertificateError(String),

  /// Docker Engine client error
  #[error("Docker error: {0}")]
  DockerError(bollard::errors::Error),

  /// Malformed HTTP traffic on the API proxy
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// API proxy error
  #[error("Proxy error: {0}")]
  ProxyError(String),

  /// Invalid configuration value
  #[error("Config error: {0}")]
  ConfigError(String),

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::CertificateError(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("Invalid request: {}", error);
    error
  }

  /// Create a proxy error and log it
  pub fn proxy_error(msg: impl Into<String>) -> Self {
    let error = Error::ProxyError(msg.into());
    tracing::error!("Proxy error: {}", error);
    error
  }

  /// Create a config error and log it
  pub fn config_error(msg: impl Into<String>) -> Self {
    let error = Error::ConfigError(msg.into());
    tracing::error!("Config error: {}", error);
    error
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("Other error: {}", error);
    error
  }

  /// Whether the Engine reported that the target object does not exist
  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      Error::DockerError(bollard::errors::Error::DockerResponseServerError {
        status_code: 404,
        ..
      })
    )
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("IO error: {}", error);
    error
  }
}

impl From<bollard::errors::Error> for Error {
  fn from(value: bollard::errors::Error) -> Self {
    let error = Error::DockerError(value);
    tracing::debug!("Docker error: {}", error);
    error
  }
}
