//! Docker Engine API proxy
//!
//! Sits between the Docker CLI and the real Engine. Build and container
//! creation requests are rewritten for the active interception session,
//! everything else is relayed byte for byte.
use crate::config::EngineEndpoint;
use crate::context::{transform_build_context, BuildInjection};
use crate::create::intercept_create;
use crate::error::{Error, Result};
use crate::outcome::{PassThroughReason, Transformed};
use crate::registry::InterceptionRegistry;
use crate::session::InterceptionSession;
use crate::upstream::EngineStream;
use crate::wire::{self, BodyFraming, MessageHead};
use bytes::Bytes;
use http::header::{CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING};
use http::Method;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

/// Characters escaped in query values written by the proxy
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
  .remove(b'.')
  .remove(b'-')
  .remove(b'_')
  .remove(b'~');

/// Docker's multiplexed and raw stream media types, used by attach and exec
const HIJACK_CONTENT_TYPES: [&str; 2] = [
  "application/vnd.docker.raw-stream",
  "application/vnd.docker.multiplexed-stream",
];

/// What the proxy does with an Engine API request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiOperation {
  /// `POST /build`: the build context gets the CA and proxy settings
  Build,
  /// `POST /containers/create`: the container config gets them
  CreateContainer,
  /// `DELETE /containers/{id}`: forwarded, and the container is no longer tracked
  RemoveContainer(String),
  /// Anything else, relayed untouched
  Passthrough,
}

impl ApiOperation {
  /// Classify a request by method and request target.
  ///
  /// Both unversioned paths and `/vX.Y/...` paths are recognised; the query
  /// string is ignored.
  pub fn classify(method: &Method, target: &str) -> Self {
    let path = target.split(['?', '#']).next().unwrap_or_default();
    let path = strip_api_version(path);
    if *method == Method::POST {
      match path {
        "/build" => return ApiOperation::Build,
        "/containers/create" => return ApiOperation::CreateContainer,
        _ => {}
      }
    }
    if *method == Method::DELETE {
      if let Some(id) = path.strip_prefix("/containers/") {
        if !id.is_empty() && !id.contains('/') {
          let id = percent_decode_str(id).decode_utf8_lossy().into_owned();
          return ApiOperation::RemoveContainer(id);
        }
      }
    }
    ApiOperation::Passthrough
  }
}

fn strip_api_version(path: &str) -> &str {
  let Some(rest) = path.strip_prefix("/v") else {
    return path;
  };
  let end = rest.find('/').unwrap_or(rest.len());
  let version = &rest[..end];
  let numeric = !version.is_empty()
    && version.chars().all(|c| c.is_ascii_digit() || c == '.')
    && version.starts_with(|c: char| c.is_ascii_digit());
  if numeric {
    &rest[end..]
  } else {
    path
  }
}

/// Query parameters of `target` as decoded `(key, value)` pairs
fn query_pairs(target: &str) -> Vec<(String, String)> {
  let Some((_, query)) = target.split_once('?') else {
    return Vec::new();
  };
  let decode = |s: &str| {
    let s = s.replace('+', " ");
    percent_decode_str(&s).decode_utf8_lossy().into_owned()
  };
  query
    .split('&')
    .filter(|pair| !pair.is_empty())
    .map(|pair| match pair.split_once('=') {
      Some((k, v)) => (decode(k), decode(v)),
      None => (decode(pair), String::new()),
    })
    .collect()
}

/// Append `extrahosts=<host>:host-gateway` to a build target, unless the
/// host is an address or already mapped.
fn with_build_extra_host(target: &str, host: &str) -> String {
  if host.parse::<IpAddr>().is_ok() {
    return target.to_string();
  }
  let prefix = format!("{}:", host);
  let mapped = query_pairs(target)
    .iter()
    .any(|(k, v)| k == "extrahosts" && v.starts_with(&prefix));
  if mapped {
    return target.to_string();
  }
  let value = utf8_percent_encode(&format!("{}host-gateway", prefix), QUERY_VALUE).to_string();
  let separator = match target.split_once('?') {
    None => "?",
    Some((_, "")) => "",
    Some(_) => "&",
  };
  format!("{}{}extrahosts={}", target, separator, value)
}

/// Parsed request line
struct RequestLine {
  method: Method,
  target: String,
  version: String,
}

impl RequestLine {
  fn parse(line: &str) -> Result<Self> {
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
      return Err(Error::invalid_request(format!("Invalid request line: {}", line)));
    };
    let method = Method::from_bytes(method.as_bytes())
      .map_err(|_| Error::invalid_request(format!("Invalid method: {}", method)))?;
    Ok(Self {
      method,
      target: target.to_string(),
      version: version.to_string(),
    })
  }

  fn to_line(&self, target: &str) -> String {
    format!("{} {} {}", self.method, target, self.version)
  }
}

fn status_of(head: &MessageHead) -> Result<u16> {
  head
    .start_line
    .split_whitespace()
    .nth(1)
    .and_then(|code| code.parse().ok())
    .ok_or_else(|| Error::proxy_error(format!("Invalid status line: {}", head.start_line)))
}

fn expects_continue(head: &MessageHead) -> bool {
  head
    .headers
    .get(EXPECT)
    .and_then(|v| v.to_str().ok())
    .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
}

/// What happens to the connection after one exchange
#[derive(Debug, PartialEq, Eq)]
enum Exchange {
  KeepAlive,
  Close,
}

#[derive(Deserialize)]
struct CreatedContainer {
  #[serde(rename = "Id")]
  id: String,
}

/// State shared by every connection of one proxy
struct ProxyShared {
  engine: EngineEndpoint,
  session: Arc<InterceptionSession>,
  injection: BuildInjection,
  registry: Arc<InterceptionRegistry>,
  /// Cleared when shutdown begins; later requests are relayed unmodified
  intercepting: AtomicBool,
  /// Flips to `true` on shutdown, waking the accept loop and idle connections
  closing: watch::Sender<bool>,
  /// Container creates whose response has not been registered yet
  in_flight: AtomicUsize,
  drained: Notify,
}

/// Marks one container create as in flight until dropped
struct InFlight<'a> {
  shared: &'a ProxyShared,
}

impl Drop for InFlight<'_> {
  fn drop(&mut self) {
    if self.shared.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
      self.shared.drained.notify_waiters();
    }
  }
}

type ClientConn = BufReader<TcpStream>;
type EngineConn = BufReader<EngineStream>;

impl ProxyShared {
  fn session(&self) -> Option<&InterceptionSession> {
    if self.intercepting.load(Ordering::SeqCst) {
      Some(&self.session)
    } else {
      None
    }
  }

  /// Claim an in-flight slot for a create, unless shutdown has begun.
  ///
  /// The count is raised before the flag is read, so `drain` either sees
  /// this create or the create sees the cleared flag.
  fn begin_create(&self) -> Option<InFlight<'_>> {
    self.in_flight.fetch_add(1, Ordering::SeqCst);
    let guard = InFlight { shared: self };
    self.intercepting.load(Ordering::SeqCst).then_some(guard)
  }

  /// Wait until no create is between forwarding and registration
  async fn drain(&self) {
    loop {
      let drained = self.drained.notified();
      let pending = self.in_flight.load(Ordering::SeqCst);
      if pending == 0 {
        return;
      }
      tracing::debug!("[{}] Waiting for {} container create(s)", self.session.id(), pending);
      drained.await;
    }
  }

  fn is_closing(&self) -> bool {
    *self.closing.borrow()
  }

  /// Serve one CLI connection until either side closes
  async fn serve(&self, client: TcpStream, peer_addr: SocketAddr) -> Result<()> {
    // Unreachable Engine: drop the client, exactly as a dead socket would look
    let upstream = match EngineStream::connect(&self.engine).await {
      Ok(upstream) => upstream,
      Err(e) => {
        tracing::warn!("Docker Engine at {} unreachable for {}: {}", self.engine, peer_addr, e);
        return Ok(());
      }
    };
    let mut client = BufReader::new(client);
    let mut upstream = BufReader::new(upstream);
    let mut closing = self.closing.subscribe();
    loop {
      let head = tokio::select! {
        biased;
        _ = closed(&mut closing) => None,
        head = wire::read_head(&mut client) => head?,
      };
      let Some(head) = head.filter(|_| !self.is_closing()) else {
        // idle keep-alive connections do not outlive the session
        let _ = client.get_mut().shutdown().await;
        return Ok(());
      };
      let request = RequestLine::parse(&head.start_line)?;
      let operation = ApiOperation::classify(&request.method, &request.target);
      tracing::debug!(
        "[{}] {} {} -> {:?}",
        self.session.id(),
        request.method,
        request.target,
        operation
      );
      let exchange = match operation {
        ApiOperation::Build => {
          self
            .handle_build(&request, &head, &mut client, &mut upstream)
            .await?
        }
        ApiOperation::CreateContainer => {
          self
            .handle_create(&request, &head, &mut client, &mut upstream)
            .await?
        }
        ApiOperation::RemoveContainer(id) => {
          self
            .handle_passthrough(&request, &head, &mut client, &mut upstream, Some(id.as_str()))
            .await?
        }
        ApiOperation::Passthrough => {
          self
            .handle_passthrough(&request, &head, &mut client, &mut upstream, None)
            .await?
        }
      };
      if exchange == Exchange::Close
        || head.wants_close()
        || request.version.eq_ignore_ascii_case("HTTP/1.0")
      {
        let _ = client.get_mut().shutdown().await;
        return Ok(());
      }
    }
  }

  /// Answer `Expect: 100-continue` locally, so buffered bodies arrive
  async fn acknowledge_continue(head: &MessageHead, client: &mut ClientConn) -> Result<()> {
    if expects_continue(head) {
      client.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
      client.flush().await?;
    }
    Ok(())
  }

  /// Forward a request whose body has been rewritten in memory
  async fn send_rewritten(
    request: &RequestLine,
    target: &str,
    head: &MessageHead,
    body: &[u8],
    upstream: &mut EngineConn,
  ) -> Result<()> {
    let mut out = head.encode(
      &request.to_line(target),
      &[CONTENT_LENGTH, TRANSFER_ENCODING, EXPECT],
      &[(CONTENT_LENGTH, body.len().to_string())],
    );
    out.extend_from_slice(body);
    upstream.write_all(&out).await?;
    upstream.flush().await?;
    Ok(())
  }

  async fn handle_build(
    &self,
    request: &RequestLine,
    head: &MessageHead,
    client: &mut ClientConn,
    upstream: &mut EngineConn,
  ) -> Result<Exchange> {
    let framing = wire::request_framing(&head.headers);
    let Some(session) = self.session() else {
      return self
        .handle_passthrough(request, head, client, upstream, None)
        .await;
    };
    if framing == BodyFraming::Empty {
      // remote context or BuildKit session; nothing to rewrite
      return self
        .handle_passthrough(request, head, client, upstream, None)
        .await;
    }
    Self::acknowledge_continue(head, client).await?;
    let body = Bytes::from(wire::read_body(client, framing, None).await?);
    let dockerfile = query_pairs(&request.target)
      .into_iter()
      .rev()
      .find(|(k, _)| k == "dockerfile")
      .map(|(_, v)| v)
      .filter(|v| !v.is_empty())
      .unwrap_or_else(|| "Dockerfile".to_string());

    // archive work is CPU bound, keep it off the reactor threads
    let context = body.clone();
    let name = dockerfile.clone();
    let injection = self.injection.clone();
    let transformed = match tokio::task::spawn_blocking(move || {
      transform_build_context(&context, &name, &injection)
    })
    .await
    {
      Ok(transformed) => transformed,
      Err(e) => {
        tracing::warn!("[{}] Build context transform aborted: {}", session.id(), e);
        Transformed::pass(body, PassThroughReason::Unparseable(e.to_string()))
      }
    };
    let target = if transformed.is_modified() {
      tracing::debug!("[{}] Build context rewritten for {}", session.id(), dockerfile);
      with_build_extra_host(&request.target, session.container_proxy_host())
    } else {
      request.target.clone()
    };
    let body = transformed.into_inner();
    Self::send_rewritten(request, &target, head, &body, upstream).await?;
    self.relay_response(&request.method, client, upstream, None).await
  }

  async fn handle_create(
    &self,
    request: &RequestLine,
    head: &MessageHead,
    client: &mut ClientConn,
    upstream: &mut EngineConn,
  ) -> Result<Exchange> {
    // held until the created container is registered
    let Some(_in_flight) = self.begin_create() else {
      return self
        .handle_passthrough(request, head, client, upstream, None)
        .await;
    };
    let session = &*self.session;
    Self::acknowledge_continue(head, client).await?;
    let framing = wire::request_framing(&head.headers);
    let body = Bytes::from(wire::read_body(client, framing, None).await?);
    let body = intercept_create(&body, Some(session)).into_inner();
    Self::send_rewritten(request, &request.target, head, &body, upstream).await?;

    let Some((response, status)) = Self::read_final_head(client, upstream).await? else {
      return Ok(Exchange::Close);
    };
    let framing = wire::response_framing(&request.method, status, &response.headers);
    let mut raw = Vec::new();
    let body = wire::read_body(upstream, framing, Some(&mut raw)).await?;
    let mut out = response.to_bytes();
    out.extend_from_slice(&raw);
    client.write_all(&out).await?;
    client.flush().await?;

    if (200..300).contains(&status) {
      match serde_json::from_slice::<CreatedContainer>(&body) {
        Ok(created) => {
          if self.registry.register(session.id(), created.id.clone()) {
            tracing::info!("[{}] Tracking container {}", session.id(), created.id);
          } else {
            tracing::warn!(
              "[{}] Container {} created after the session closed",
              session.id(),
              created.id
            );
          }
        }
        Err(e) => tracing::warn!("[{}] Unreadable create response: {}", session.id(), e),
      }
    }
    Ok(match framing {
      BodyFraming::UntilClose => Exchange::Close,
      _ if response.wants_close() => Exchange::Close,
      _ => Exchange::KeepAlive,
    })
  }

  async fn handle_passthrough(
    &self,
    request: &RequestLine,
    head: &MessageHead,
    client: &mut ClientConn,
    upstream: &mut EngineConn,
    removed: Option<&str>,
  ) -> Result<Exchange> {
    upstream.write_all(&head.to_bytes()).await?;
    upstream.flush().await?;
    let framing = wire::request_framing(&head.headers);
    wire::copy_body(client, upstream, framing).await?;
    self
      .relay_response(&request.method, client, upstream, removed)
      .await
  }

  /// Read the next response head, relaying interim `1xx` responses
  async fn read_final_head(
    client: &mut ClientConn,
    upstream: &mut EngineConn,
  ) -> Result<Option<(MessageHead, u16)>> {
    loop {
      let Some(head) = wire::read_head(upstream).await? else {
        return Ok(None);
      };
      let status = status_of(&head)?;
      if (100..200).contains(&status) && status != 101 {
        client.write_all(&head.to_bytes()).await?;
        client.flush().await?;
        continue;
      }
      return Ok(Some((head, status)));
    }
  }

  /// Stream the Engine's response back to the CLI
  async fn relay_response(
    &self,
    method: &Method,
    client: &mut ClientConn,
    upstream: &mut EngineConn,
    removed: Option<&str>,
  ) -> Result<Exchange> {
    let Some((response, status)) = Self::read_final_head(client, upstream).await? else {
      return Ok(Exchange::Close);
    };
    if let Some(container) = removed {
      if (200..300).contains(&status) {
        if self.registry.forget(self.session.id(), container) {
          tracing::debug!("[{}] Container {} removed", self.session.id(), container);
        }
      }
    }
    let framing = wire::response_framing(method, status, &response.headers);
    client.write_all(&response.to_bytes()).await?;
    client.flush().await?;

    let raw_stream = response
      .content_type()
      .is_some_and(|ct| HIJACK_CONTENT_TYPES.iter().any(|t| ct.starts_with(t)));
    if status == 101 || (raw_stream && framing == BodyFraming::UntilClose) {
      tracing::debug!("[{}] Connection hijacked", self.session.id());
      hijack(client, upstream).await;
      return Ok(Exchange::Close);
    }

    wire::copy_body(upstream, client, framing).await?;
    Ok(match framing {
      BodyFraming::UntilClose => Exchange::Close,
      _ if response.wants_close() => Exchange::Close,
      _ => Exchange::KeepAlive,
    })
  }
}

/// Resolves once shutdown has begun
async fn closed(closing: &mut watch::Receiver<bool>) {
  while !*closing.borrow_and_update() {
    if closing.changed().await.is_err() {
      return;
    }
  }
}

/// Copy bytes both ways until either side is done
async fn hijack<A, B>(client: &mut A, upstream: &mut B)
where
  A: tokio::io::AsyncRead + AsyncWrite + Unpin,
  B: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
  if let Err(e) = tokio::io::copy_bidirectional(client, upstream).await {
    tracing::debug!("Hijacked stream ended: {}", e);
  }
}

/// Per-session proxy in front of the Docker Engine
pub struct DockerApiProxy {
  local_addr: SocketAddr,
  shared: Arc<ProxyShared>,
  accept_task: Option<JoinHandle<()>>,
}

impl DockerApiProxy {
  /// Bind `listen_addr` and start accepting CLI connections for `session`.
  pub async fn bind(
    listen_addr: &str,
    engine: EngineEndpoint,
    session: Arc<InterceptionSession>,
    registry: Arc<InterceptionRegistry>,
  ) -> Result<Self> {
    let listener = TcpListener::bind(listen_addr)
      .await
      .map_err(|e| Error::proxy_error(format!("Failed to bind to {}: {}", listen_addr, e)))?;
    let local_addr = listener.local_addr()?;
    let (closing, _) = watch::channel(false);
    let shared = Arc::new(ProxyShared {
      engine,
      injection: BuildInjection::for_session(&session),
      session,
      registry,
      intercepting: AtomicBool::new(true),
      closing,
      in_flight: AtomicUsize::new(0),
      drained: Notify::new(),
    });
    let accept_shared = shared.clone();
    let mut closing = shared.closing.subscribe();
    let accept_task = tokio::spawn(async move {
      loop {
        tokio::select! {
          biased;
          _ = closed(&mut closing) => break,
          accepted = listener.accept() => match accepted {
            Ok((stream, peer_addr)) => {
              let _ = stream.set_nodelay(true);
              let shared = accept_shared.clone();
              tokio::spawn(async move {
                if let Err(e) = shared.serve(stream, peer_addr).await {
                  tracing::debug!("[{}] Connection from {} ended: {}", shared.session.id(), peer_addr, e);
                }
              });
            }
            Err(e) => {
              tracing::error!("[{}] Failed to accept connection: {}", accept_shared.session.id(), e);
            }
          }
        }
      }
    });
    tracing::info!(
      "[{}] Docker API proxy listening on {} for {}",
      shared.session.id(),
      local_addr,
      shared.engine
    );
    Ok(Self {
      local_addr,
      shared,
      accept_task: Some(accept_task),
    })
  }

  /// Address the proxy listens on
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// `DOCKER_HOST` value pointing at this proxy
  pub fn docker_host(&self) -> String {
    format!("tcp://{}", self.local_addr)
  }

  /// Session served by this proxy
  pub fn session(&self) -> &Arc<InterceptionSession> {
    &self.shared.session
  }

  /// Stop accepting connections and wait until the listener is released.
  ///
  /// Exchanges already in progress finish unmodified, idle connections are
  /// closed, and container creates already forwarded are registered before
  /// this returns.
  pub async fn shutdown(&mut self) {
    self.shared.intercepting.store(false, Ordering::SeqCst);
    self.shared.closing.send_replace(true);
    if let Some(task) = self.accept_task.take() {
      if let Err(e) = task.await {
        tracing::error!("[{}] Accept loop failed: {}", self.shared.session.id(), e);
      }
    }
    self.shared.drain().await;
  }
}

impl Drop for DockerApiProxy {
  fn drop(&mut self) {
    self.shared.intercepting.store(false, Ordering::SeqCst);
    self.shared.closing.send_replace(true);
    if let Some(task) = self.accept_task.take() {
      task.abort();
    }
  }
}
