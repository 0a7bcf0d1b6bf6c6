//! Session control: start and stop interception per proxy port
use crate::api_proxy::DockerApiProxy;
use crate::config::InterceptConfig;
use crate::engine::{ContainerCleaner, DockerEngine};
use crate::env::{compute_overrides, EnvPatch, FeatureFlags, OverrideContext};
use crate::error::{Error, Result};
use crate::registry::InterceptionRegistry;
use crate::session::{InterceptionSession, SessionId, TrustContext};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

/// Where a started session can be reached
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEndpoint {
  /// Id of the session
  pub session_id: SessionId,
  /// Port of the intercepting HTTP(S) proxy this session belongs to
  pub proxy_port: u16,
  /// `DOCKER_HOST` value for CLI invocations
  pub docker_host: String,
  /// CA certificate written on the host
  pub ca_cert_path: PathBuf,
}

struct RunningSession {
  session: Arc<InterceptionSession>,
  proxy: DockerApiProxy,
  endpoint: SessionEndpoint,
}

type Slot = Arc<tokio::sync::Mutex<Option<RunningSession>>>;

/// Owns every interception session of the process.
///
/// Start and stop of one port are serialized; different ports do not wait
/// on each other.
pub struct InterceptionManager {
  config: InterceptConfig,
  registry: Arc<InterceptionRegistry>,
  cleaner: Arc<dyn ContainerCleaner>,
  slots: parking_lot::Mutex<HashMap<u16, Slot>>,
}

impl InterceptionManager {
  /// Create a manager that cleans up through the configured Engine
  pub fn new(config: InterceptConfig) -> Result<Self> {
    let cleaner = Arc::new(DockerEngine::connect(&config.engine)?);
    Ok(Self::with_cleaner(config, cleaner))
  }

  /// Create a manager with a custom cleanup backend
  pub fn with_cleaner(config: InterceptConfig, cleaner: Arc<dyn ContainerCleaner>) -> Self {
    Self {
      config,
      registry: Arc::new(InterceptionRegistry::new()),
      cleaner,
      slots: parking_lot::Mutex::new(HashMap::new()),
    }
  }

  /// The configuration in use
  pub fn config(&self) -> &InterceptConfig {
    &self.config
  }

  /// The container registry shared by all sessions
  pub fn registry(&self) -> &Arc<InterceptionRegistry> {
    &self.registry
  }

  fn slot(&self, proxy_port: u16) -> Slot {
    self.slots.lock().entry(proxy_port).or_default().clone()
  }

  fn cert_path(&self, proxy_port: u16) -> PathBuf {
    self
      .config
      .cert_storage_path
      .join(proxy_port.to_string())
      .join("ca.pem")
  }

  /// Start interception for the proxy on `proxy_port`.
  ///
  /// Starting a port that is already running returns its current endpoint.
  pub async fn start(&self, proxy_port: u16, trust: TrustContext) -> Result<SessionEndpoint> {
    let slot = self.slot(proxy_port);
    let mut running = slot.lock().await;
    if let Some(running) = running.as_ref() {
      return Ok(running.endpoint.clone());
    }

    trust.validate()?;
    let cert_path = self.cert_path(proxy_port);
    if let Some(dir) = cert_path.parent() {
      fs::create_dir_all(dir).await?;
    }
    fs::write(&cert_path, &trust.ca_cert).await.map_err(|e| {
      Error::certificate_error(format!(
        "Failed to write CA certificate to {}: {}",
        cert_path.display(),
        e
      ))
    })?;

    let session = Arc::new(InterceptionSession::new(
      proxy_port,
      trust,
      &self.config,
      &cert_path,
    ));
    self.registry.open(session.id());
    let proxy = match DockerApiProxy::bind(
      &self.config.listen_addr,
      self.config.engine.clone(),
      session.clone(),
      self.registry.clone(),
    )
    .await
    {
      Ok(proxy) => proxy,
      Err(e) => {
        self.registry.clear(session.id());
        return Err(e);
      }
    };
    let endpoint = SessionEndpoint {
      session_id: session.id(),
      proxy_port,
      docker_host: proxy.docker_host(),
      ca_cert_path: cert_path,
    };
    tracing::info!(
      "[{}] Docker interception started for proxy port {} at {}",
      session.id(),
      proxy_port,
      endpoint.docker_host
    );
    *running = Some(RunningSession {
      session,
      proxy,
      endpoint: endpoint.clone(),
    });
    Ok(endpoint)
  }

  /// Stop interception for `proxy_port` and tear down its containers.
  ///
  /// Unknown or already stopped ports are a no-op. Containers that are
  /// already gone count as cleaned up; other failures are logged and the
  /// remaining containers are still processed.
  pub async fn stop(&self, proxy_port: u16) -> Result<()> {
    let slot = self.slot(proxy_port);
    let mut running = slot.lock().await;
    let Some(mut stopping) = running.take() else {
      return Ok(());
    };
    let session_id = stopping.session.id();
    // returns once creates already sent to the Engine are registered
    stopping.proxy.shutdown().await;

    let containers = self.registry.clear(session_id);
    for container in &containers {
      if let Err(e) = self.cleaner.kill(container).await {
        tracing::warn!("[{}] Failed to kill container {}: {}", session_id, container, e);
      }
      match self.cleaner.remove(container).await {
        Ok(()) => tracing::debug!("[{}] Removed container {}", session_id, container),
        Err(e) => tracing::warn!("[{}] Failed to remove container {}: {}", session_id, container, e),
      }
    }
    if let Err(e) = fs::remove_file(&stopping.endpoint.ca_cert_path).await {
      tracing::debug!(
        "[{}] Could not remove {}: {}",
        session_id,
        stopping.endpoint.ca_cert_path.display(),
        e
      );
    }
    tracing::info!(
      "[{}] Docker interception stopped for proxy port {}, {} container(s) cleaned up",
      session_id,
      proxy_port,
      containers.len()
    );
    Ok(())
  }

  /// The running session for `proxy_port`
  pub async fn session(&self, proxy_port: u16) -> Option<Arc<InterceptionSession>> {
    let slot = self.slot(proxy_port);
    let running = slot.lock().await;
    running.as_ref().map(|running| running.session.clone())
  }

  /// Where the session for `proxy_port` is reachable
  pub async fn endpoint(&self, proxy_port: u16) -> Option<SessionEndpoint> {
    let slot = self.slot(proxy_port);
    let running = slot.lock().await;
    running.as_ref().map(|running| running.endpoint.clone())
  }

  /// Containers currently tracked for `proxy_port`
  pub async fn tracked(&self, proxy_port: u16) -> HashSet<String> {
    match self.session(proxy_port).await {
      Some(session) => self.registry.list_tracked(session.id()),
      None => HashSet::new(),
    }
  }

  /// Environment changes for a Docker CLI run under the session on
  /// `proxy_port`, or `None` if it is not running.
  pub async fn env_overrides(
    &self,
    proxy_port: u16,
    base_env: &HashMap<String, String>,
    flags: FeatureFlags,
  ) -> Option<EnvPatch> {
    let endpoint = self.endpoint(proxy_port).await?;
    let ctx = OverrideContext {
      ca_cert_path: &endpoint.ca_cert_path,
      docker_host: Some(&endpoint.docker_host),
    };
    Some(compute_overrides(&ctx, base_env, flags))
  }
}
