//! Trust and proxy context of one interception session

use crate::config::InterceptConfig;
use crate::env::container_env;
use crate::error::{Error, Result};
use bytes::Bytes;
use std::fmt;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// CA material handed over by the intercepting proxy server.
#[derive(Clone)]
pub struct TrustContext {
  /// CA certificate, PEM encoded
  pub ca_cert: Bytes,
  /// CA private key, PEM encoded. Kept proxy-side, never injected.
  pub ca_key: Bytes,
}

impl TrustContext {
  /// Create a trust context from PEM encoded certificate and key
  pub fn new(ca_cert: impl Into<Bytes>, ca_key: impl Into<Bytes>) -> Self {
    Self {
      ca_cert: ca_cert.into(),
      ca_key: ca_key.into(),
    }
  }

  /// Check that the certificate and key are parseable PEM.
  pub fn validate(&self) -> Result<()> {
    let mut reader = self.ca_cert.as_ref();
    rustls_pemfile::certs(&mut reader)
      .next()
      .ok_or_else(|| Error::certificate_error("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA cert: {}", e)))?;
    let mut reader = self.ca_key.as_ref();
    rustls_pemfile::private_key(&mut reader)
      .map_err(|e| Error::certificate_error(format!("Failed to parse CA key: {}", e)))?
      .ok_or_else(|| Error::certificate_error("No private key found in PEM"))?;
    Ok(())
  }
}

impl fmt::Debug for TrustContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TrustContext")
      .field("ca_cert", &format_args!("{} bytes", self.ca_cert.len()))
      .field("ca_key", &"<redacted>")
      .finish()
  }
}

/// Opaque identifier of an interception session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
  /// Generate a fresh session id
  pub fn new() -> Self {
    SessionId(Uuid::new_v4())
  }
}

impl Default for SessionId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for SessionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    self.0.fmt(f)
  }
}

/// One running interception session. Immutable once created.
#[derive(Clone, Debug)]
pub struct InterceptionSession {
  session_id: SessionId,
  proxy_port: u16,
  trust: TrustContext,
  /// Certificate file on the host, bind mounted into containers
  host_cert_path: PathBuf,
  container_proxy_host: String,
  context_cert_path: String,
  container_cert_path: String,
}

impl InterceptionSession {
  /// Create a session for the proxy listening on `proxy_port`
  pub fn new(
    proxy_port: u16,
    trust: TrustContext,
    config: &InterceptConfig,
    host_cert_path: impl AsRef<Path>,
  ) -> Self {
    Self {
      session_id: SessionId::new(),
      proxy_port,
      trust,
      host_cert_path: host_cert_path.as_ref().to_path_buf(),
      container_proxy_host: config.container_proxy_host.clone(),
      context_cert_path: config.context_cert_path.clone(),
      container_cert_path: config.container_cert_path.clone(),
    }
  }

  /// The session id
  pub fn id(&self) -> SessionId {
    self.session_id
  }

  /// Port of the intercepting HTTP(S) proxy
  pub fn proxy_port(&self) -> u16 {
    self.proxy_port
  }

  /// The CA certificate, PEM encoded
  pub fn ca_cert(&self) -> &Bytes {
    &self.trust.ca_cert
  }

  /// Host path of the certificate file
  pub fn host_cert_path(&self) -> &Path {
    &self.host_cert_path
  }

  /// Hostname containers reach the proxy by
  pub fn container_proxy_host(&self) -> &str {
    &self.container_proxy_host
  }

  /// Certificate path inside a build context
  pub fn context_cert_path(&self) -> &str {
    &self.context_cert_path
  }

  /// Certificate path inside images and containers
  pub fn container_cert_path(&self) -> &str {
    &self.container_cert_path
  }

  /// Proxy URL as seen from inside a container
  pub fn container_proxy_url(&self) -> String {
    format!("http://{}:{}", self.container_proxy_host, self.proxy_port)
  }

  /// The owned environment variables every intercepted container receives
  pub fn container_env(&self) -> Vec<(&'static str, String)> {
    container_env(&self.container_proxy_url(), &self.container_cert_path)
  }
}
