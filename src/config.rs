//! Interception configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default Docker Engine socket on unix hosts
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";
/// Default Engine TCP port when `DOCKER_HOST` omits one
const DEFAULT_DOCKER_TCP_PORT: u16 = 2375;

/// Where the real Docker Engine listens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EngineEndpoint {
  /// Unix domain socket path
  Unix(PathBuf),
  /// Plain TCP `host:port`
  Tcp(String),
}

impl EngineEndpoint {
  /// Parse a `DOCKER_HOST` style address.
  ///
  /// Supported schemes: `unix://`, `tcp://` and `http://`.
  pub fn parse(value: &str) -> Result<Self> {
    let value = value.trim();
    if let Some(path) = value.strip_prefix("unix://") {
      if path.is_empty() {
        return Err(Error::config_error("empty unix socket path"));
      }
      return Ok(EngineEndpoint::Unix(PathBuf::from(path)));
    }
    let rest = value
      .strip_prefix("tcp://")
      .or_else(|| value.strip_prefix("http://"))
      .ok_or_else(|| Error::config_error(format!("unsupported docker host: {}", value)))?;
    let authority = rest.trim_end_matches('/');
    let authority = http::uri::Authority::from_str(authority)
      .map_err(|e| Error::config_error(format!("invalid docker host {}: {}", value, e)))?;
    let port = authority.port_u16().unwrap_or(DEFAULT_DOCKER_TCP_PORT);
    Ok(EngineEndpoint::Tcp(format!("{}:{}", authority.host(), port)))
  }

  /// Resolve the Engine from `DOCKER_HOST`, falling back to the default socket.
  pub fn from_env() -> Self {
    match std::env::var("DOCKER_HOST") {
      Ok(host) if !host.trim().is_empty() => match Self::parse(&host) {
        Ok(endpoint) => endpoint,
        Err(e) => {
          tracing::warn!("Ignoring DOCKER_HOST {:?}: {}", host, e);
          Self::default()
        }
      },
      _ => Self::default(),
    }
  }
}

impl Default for EngineEndpoint {
  fn default() -> Self {
    EngineEndpoint::Unix(PathBuf::from(DEFAULT_DOCKER_SOCKET))
  }
}

impl fmt::Display for EngineEndpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EngineEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
      EngineEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
    }
  }
}

impl TryFrom<String> for EngineEndpoint {
  type Error = Error;

  fn try_from(value: String) -> Result<Self> {
    Self::parse(&value)
  }
}

impl From<EngineEndpoint> for String {
  fn from(value: EngineEndpoint) -> Self {
    value.to_string()
  }
}

/// Configuration for the interception engine
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
  /// The real Docker Engine every request is forwarded to
  pub engine: EngineEndpoint,
  /// Address the per-session Docker API proxy binds to
  pub listen_addr: String,
  /// Directory the CA certificate is written to for bind mounts
  pub cert_storage_path: PathBuf,
  /// Hostname containers use to reach the intercepting proxy
  pub container_proxy_host: String,
  /// Path of the injected certificate inside the build context
  pub context_cert_path: String,
  /// Path of the certificate inside images and containers
  pub container_cert_path: String,
}

impl Default for InterceptConfig {
  fn default() -> Self {
    Self {
      engine: EngineEndpoint::default(),
      listen_addr: "127.0.0.1:0".to_string(),
      cert_storage_path: std::env::temp_dir().join("docker-intercept"),
      container_proxy_host: "host.docker.internal".to_string(),
      context_cert_path: ".docker-intercept/ca.pem".to_string(),
      container_cert_path: "/.docker-intercept/ca.pem".to_string(),
    }
  }
}

impl InterceptConfig {
  /// Default configuration with the Engine taken from `DOCKER_HOST`.
  pub fn from_env() -> Self {
    Self {
      engine: EngineEndpoint::from_env(),
      ..Default::default()
    }
  }

  /// Load a configuration from a JSON document, unset fields take defaults.
  pub fn from_json(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| Error::config_error(format!("invalid config: {}", e)))
  }
}
