//! Integration tests for docker-intercept, run against an in-process fake Engine

use async_trait::async_trait;
use docker_intercept::{
  ContainerCleaner, EngineEndpoint, Error, FeatureFlags, InterceptConfig, InterceptionManager,
  Result, TrustContext,
};
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use std::collections::HashMap;
use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

const CONTAINER_ID: &str = "4f66ad21a3fce0f3ee2e7a9b2a7c3e7e5d1f2b3c4d5e6f708192a3b4c5d6e7f8";

/// A request as received by the fake Engine
#[derive(Clone, Debug)]
struct Recorded {
  method: String,
  target: String,
  headers: String,
  body: Vec<u8>,
}

struct EngineState {
  requests: Mutex<Vec<Recorded>>,
  create_delay: Duration,
}

/// Minimal Docker Engine speaking keep-alive HTTP/1.1
struct FakeEngine {
  addr: SocketAddr,
  state: Arc<EngineState>,
}

impl FakeEngine {
  async fn start() -> Self {
    Self::with_create_delay(Duration::ZERO).await
  }

  /// Engine that answers container creates only after `create_delay`
  async fn with_create_delay(create_delay: Duration) -> Self {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(EngineState {
      requests: Mutex::new(Vec::new()),
      create_delay,
    });
    let shared = state.clone();
    tokio::spawn(async move {
      while let Ok((stream, _)) = listener.accept().await {
        let state = shared.clone();
        tokio::spawn(async move {
          let _ = Self::serve(stream, state).await;
        });
      }
    });
    Self { addr, state }
  }

  async fn read_chunked(reader: &mut BufReader<TcpStream>) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
      let mut size = String::new();
      reader.read_line(&mut size).await?;
      let size = usize::from_str_radix(size.trim().split(';').next().unwrap_or("0"), 16).unwrap_or(0);
      if size == 0 {
        let mut trailer = String::new();
        while reader.read_line(&mut trailer).await? > 0 && trailer != "\r\n" {
          trailer.clear();
        }
        return Ok(body);
      }
      let mut chunk = vec![0u8; size + 2];
      reader.read_exact(&mut chunk).await?;
      body.extend_from_slice(&chunk[..size]);
    }
  }

  async fn serve(stream: TcpStream, state: Arc<EngineState>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
      let mut line = String::new();
      if reader.read_line(&mut line).await? == 0 {
        return Ok(());
      }
      let mut parts = line.split_whitespace();
      let method = parts.next().unwrap_or_default().to_string();
      let target = parts.next().unwrap_or_default().to_string();
      let mut headers = String::new();
      let mut content_length = 0usize;
      let mut chunked = false;
      let mut close = false;
      loop {
        let mut header = String::new();
        reader.read_line(&mut header).await?;
        if header == "\r\n" || header.is_empty() {
          break;
        }
        if let Some((name, value)) = header.split_once(':') {
          let value = value.trim();
          if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().unwrap_or(0);
          } else if name.eq_ignore_ascii_case("transfer-encoding") {
            chunked = value.eq_ignore_ascii_case("chunked");
          } else if name.eq_ignore_ascii_case("connection") {
            close = value.eq_ignore_ascii_case("close");
          }
        }
        headers.push_str(&header);
      }
      let body = if chunked {
        Self::read_chunked(&mut reader).await?
      } else {
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        body
      };
      state.requests.lock().push(Recorded {
        method: method.clone(),
        target: target.clone(),
        headers,
        body,
      });

      let path = target.split('?').next().unwrap_or_default().to_string();
      if path.ends_with("/attach") {
        reader
          .get_mut()
          .write_all(b"HTTP/1.1 101 UPGRADED\r\nContent-Type: application/vnd.docker.raw-stream\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n")
          .await?;
        // echo whatever the client writes until it hangs up
        let mut buf = [0u8; 1024];
        loop {
          let n = reader.read(&mut buf).await?;
          if n == 0 {
            return Ok(());
          }
          reader.get_mut().write_all(&buf[..n]).await?;
        }
      }

      let connection = if close { "Connection: close\r\n" } else { "" };
      let response = if path.ends_with("/build") {
        let chunk = r#"{"stream":"Successfully built 0123456789ab\n"}"#;
        format!(
          "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
          connection,
          chunk.len(),
          chunk
        )
      } else if path.ends_with("/containers/create") {
        if !state.create_delay.is_zero() {
          tokio::time::sleep(state.create_delay).await;
        }
        let body = format!(r#"{{"Id":"{}","Warnings":[]}}"#, CONTAINER_ID);
        format!(
          "HTTP/1.1 201 Created\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{}\r\n{}",
          body.len(),
          connection,
          body
        )
      } else if method == "DELETE" {
        format!("HTTP/1.1 204 No Content\r\n{}\r\n", connection)
      } else {
        format!(
          "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 2\r\n{}\r\nOK",
          connection
        )
      };
      reader.get_mut().write_all(response.as_bytes()).await?;
      if close {
        return reader.get_mut().shutdown().await;
      }
    }
  }

  fn endpoint(&self) -> EngineEndpoint {
    EngineEndpoint::Tcp(self.addr.to_string())
  }

  fn requests(&self) -> Vec<Recorded> {
    self.state.requests.lock().clone()
  }
}

/// Cleanup backend that records calls instead of talking to an Engine
#[derive(Default)]
struct RecordingCleaner {
  calls: Mutex<Vec<String>>,
}

#[async_trait]
impl ContainerCleaner for RecordingCleaner {
  async fn kill(&self, container_id: &str) -> Result<()> {
    self.calls.lock().push(format!("kill {}", container_id));
    if container_id == "broken" {
      return Err(Error::other("container is wedged"));
    }
    Ok(())
  }

  async fn remove(&self, container_id: &str) -> Result<()> {
    self.calls.lock().push(format!("remove {}", container_id));
    if container_id == "broken" {
      return Err(Error::other("engine refused"));
    }
    Ok(())
  }
}

fn generate_ca() -> TrustContext {
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "docker-intercept test CA");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  let key_pair = KeyPair::generate().unwrap();
  let cert = params.self_signed(&key_pair).unwrap();
  TrustContext::new(cert.pem(), key_pair.serialize_pem())
}

fn test_config(name: &str, engine: EngineEndpoint) -> InterceptConfig {
  let storage = std::env::temp_dir().join(name);
  if storage.exists() {
    std::fs::remove_dir_all(&storage).ok();
  }
  InterceptConfig {
    engine,
    cert_storage_path: storage,
    ..Default::default()
  }
}

/// Send one request with `Connection: close` and return status and raw body
async fn send(docker_host: &str, method: &str, target: &str, body: &[u8]) -> (u16, Vec<u8>) {
  let addr = docker_host.trim_start_matches("tcp://");
  let mut stream = TcpStream::connect(addr).await.unwrap();
  let head = format!(
    "{} {} HTTP/1.1\r\nHost: docker\r\nUser-Agent: Docker-Client/27.0.3 (linux)\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
    method,
    target,
    body.len()
  );
  stream.write_all(head.as_bytes()).await.unwrap();
  stream.write_all(body).await.unwrap();
  let mut response = Vec::new();
  stream.read_to_end(&mut response).await.unwrap();
  let split = response
    .windows(4)
    .position(|w| w == b"\r\n\r\n")
    .expect("response head");
  let status_line = String::from_utf8_lossy(&response[..split]).to_string();
  let status = status_line
    .split_whitespace()
    .nth(1)
    .and_then(|s| s.parse().ok())
    .expect("status code");
  (status, response[split + 4..].to_vec())
}

/// A CLI connection that is kept open across requests
struct ApiConnection {
  stream: BufReader<TcpStream>,
}

impl ApiConnection {
  async fn open(docker_host: &str) -> Self {
    let stream = TcpStream::connect(docker_host.trim_start_matches("tcp://"))
      .await
      .unwrap();
    Self {
      stream: BufReader::new(stream),
    }
  }

  async fn write(&mut self, bytes: &[u8]) {
    let _ = self.stream.get_mut().write_all(bytes).await;
  }

  /// Send a request with a `Content-Length` body, keeping the connection open
  async fn request(&mut self, method: &str, target: &str, body: &[u8]) {
    let head = format!(
      "{} {} HTTP/1.1\r\nHost: docker\r\nContent-Length: {}\r\n\r\n",
      method,
      target,
      body.len()
    );
    self.write(head.as_bytes()).await;
    self.write(body).await;
  }

  /// Next response as status and decoded body, `None` once the proxy hung up
  async fn response(&mut self) -> Option<(u16, Vec<u8>)> {
    let mut line = String::new();
    match self.stream.read_line(&mut line).await {
      Ok(0) | Err(_) => return None,
      Ok(_) => {}
    }
    let status: u16 = line.split_whitespace().nth(1)?.parse().ok()?;
    let mut content_length = None;
    let mut chunked = false;
    loop {
      let mut header = String::new();
      self.stream.read_line(&mut header).await.ok()?;
      if header == "\r\n" || header.is_empty() {
        break;
      }
      if let Some((name, value)) = header.split_once(':') {
        if name.eq_ignore_ascii_case("content-length") {
          content_length = value.trim().parse::<usize>().ok();
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
          chunked = value.trim().eq_ignore_ascii_case("chunked");
        }
      }
    }
    if (100..200).contains(&status) || status == 204 {
      return Some((status, Vec::new()));
    }
    let mut body = Vec::new();
    if chunked {
      loop {
        let mut size = String::new();
        self.stream.read_line(&mut size).await.ok()?;
        let size = usize::from_str_radix(size.trim(), 16).ok()?;
        let mut chunk = vec![0u8; size + 2];
        self.stream.read_exact(&mut chunk).await.ok()?;
        if size == 0 {
          break;
        }
        body.extend_from_slice(&chunk[..size]);
      }
    } else if let Some(length) = content_length {
      body.resize(length, 0);
      self.stream.read_exact(&mut body).await.ok()?;
    } else {
      self.stream.read_to_end(&mut body).await.ok()?;
    }
    Some((status, body))
  }
}

fn build_context(dockerfile: &str) -> Vec<u8> {
  let mut builder = tar::Builder::new(Vec::new());
  for (path, data) in [
    ("Dockerfile", dockerfile.as_bytes()),
    ("src/main.go", b"package main\nfunc main() {}\n".as_slice()),
  ] {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(1_700_000_000);
    builder.append_data(&mut header, path, data).unwrap();
  }
  builder.into_inner().unwrap()
}

fn read_entries(archive: &[u8]) -> HashMap<String, Vec<u8>> {
  let mut archive = tar::Archive::new(archive);
  let mut entries = HashMap::new();
  for entry in archive.entries().unwrap() {
    let mut entry = entry.unwrap();
    let path = entry.path().unwrap().to_string_lossy().to_string();
    let mut data = Vec::new();
    entry.read_to_end(&mut data).unwrap();
    entries.insert(path, data);
  }
  entries
}

#[tokio::test]
async fn test_multi_stage_build_is_injected() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-build", engine.endpoint());
  let manager = InterceptionManager::with_cleaner(config, Arc::new(RecordingCleaner::default()));
  let trust = generate_ca();
  let ca_cert = trust.ca_cert.clone();
  let endpoint = manager.start(9101, trust).await.unwrap();

  let dockerfile = "FROM golang:1.22 AS build\nRUN go build ./...\n\nFROM alpine:3.20 AS certs\nRUN apk add ca-certificates\n\nFROM scratch\nCOPY --from=build /app /app\n";
  let context = build_context(dockerfile);
  let (status, body) = send(
    &endpoint.docker_host,
    "POST",
    "/v1.43/build?t=app%3Alatest&dockerfile=Dockerfile",
    &context,
  )
  .await;
  assert_eq!(status, 200);
  assert!(
    String::from_utf8_lossy(&body).contains("Successfully built"),
    "Build output not relayed"
  );

  let requests = engine.requests();
  assert_eq!(requests.len(), 1);
  let forwarded = &requests[0];
  assert_eq!(forwarded.method, "POST");
  assert!(
    forwarded
      .target
      .ends_with("&extrahosts=host.docker.internal%3Ahost-gateway"),
    "Build host alias missing: {}",
    forwarded.target
  );

  let entries = read_entries(&forwarded.body);
  assert_eq!(
    entries.get(".docker-intercept/ca.pem"),
    Some(&ca_cert.to_vec()),
    "CA certificate not added to the context"
  );
  assert_eq!(
    entries.get("src/main.go").map(Vec::as_slice),
    Some(b"package main\nfunc main() {}\n".as_slice())
  );
  let rewritten = String::from_utf8(entries["Dockerfile"].clone()).unwrap();
  assert_eq!(
    rewritten
      .matches("COPY .docker-intercept/ca.pem /.docker-intercept/ca.pem")
      .count(),
    3,
    "Every stage needs its own injected block:\n{}",
    rewritten
  );
  assert_eq!(
    rewritten.matches("HTTPS_PROXY=\"http://host.docker.internal:9101\"").count(),
    3
  );
  assert!(rewritten.contains("COPY --from=build /app /app"));

  manager.stop(9101).await.unwrap();
}

#[tokio::test]
async fn test_created_containers_are_cleaned_on_stop() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-create", engine.endpoint());
  let cleaner = Arc::new(RecordingCleaner::default());
  let manager = InterceptionManager::with_cleaner(config, cleaner.clone());
  let endpoint = manager.start(9102, generate_ca()).await.unwrap();

  let create = br#"{"Image":"alpine","Env":["FOO=bar","HTTP_PROXY=http://corp:3128"],"HostConfig":{"Binds":["/data:/data"]}}"#;
  let (status, body) = send(
    &endpoint.docker_host,
    "POST",
    "/v1.43/containers/create?name=web",
    create,
  )
  .await;
  assert_eq!(status, 201);
  let created: serde_json::Value = serde_json::from_slice(&body).unwrap();
  assert_eq!(created["Id"], CONTAINER_ID);

  let forwarded = engine.requests().pop().unwrap();
  let config: serde_json::Value = serde_json::from_slice(&forwarded.body).unwrap();
  let env: Vec<&str> = config["Env"]
    .as_array()
    .unwrap()
    .iter()
    .filter_map(|v| v.as_str())
    .collect();
  assert_eq!(env[0], "FOO=bar");
  assert_eq!(env[1], "HTTP_PROXY=http://host.docker.internal:9102");
  assert!(env.contains(&"SSL_CERT_FILE=/.docker-intercept/ca.pem"));
  let binds = config["HostConfig"]["Binds"].as_array().unwrap();
  assert_eq!(binds.len(), 2);
  assert!(binds[1]
    .as_str()
    .unwrap()
    .ends_with("ca.pem:/.docker-intercept/ca.pem:ro"));

  assert!(manager.tracked(9102).await.contains(CONTAINER_ID));
  manager.stop(9102).await.unwrap();
  assert_eq!(
    *cleaner.calls.lock(),
    vec![format!("kill {}", CONTAINER_ID), format!("remove {}", CONTAINER_ID)]
  );
  assert!(manager.tracked(9102).await.is_empty());

  // second stop is a no-op
  manager.stop(9102).await.unwrap();
  assert_eq!(cleaner.calls.lock().len(), 2);
}

#[tokio::test]
async fn test_unrelated_and_removed_containers_are_left_alone() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-unrelated", engine.endpoint());
  let cleaner = Arc::new(RecordingCleaner::default());
  let manager = InterceptionManager::with_cleaner(config, cleaner.clone());
  let endpoint = manager.start(9103, generate_ca()).await.unwrap();

  // plain API calls are relayed untouched and create nothing to clean up
  let (status, body) = send(&endpoint.docker_host, "GET", "/_ping", b"").await;
  assert_eq!(status, 200);
  assert_eq!(body, b"OK");

  // a container created through the session, then removed by the user
  let (status, _) = send(
    &endpoint.docker_host,
    "POST",
    "/containers/create",
    br#"{"Image":"alpine"}"#,
  )
  .await;
  assert_eq!(status, 201);
  assert_eq!(manager.tracked(9103).await.len(), 1);
  let (status, _) = send(
    &endpoint.docker_host,
    "DELETE",
    &format!("/v1.43/containers/{}?force=1", CONTAINER_ID),
    b"",
  )
  .await;
  assert_eq!(status, 204);
  assert!(manager.tracked(9103).await.is_empty());

  manager.stop(9103).await.unwrap();
  assert!(cleaner.calls.lock().is_empty(), "Nothing should be cleaned up");
}

#[tokio::test]
async fn test_sessions_are_isolated() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-isolation", engine.endpoint());
  let cleaner = Arc::new(RecordingCleaner::default());
  let manager = Arc::new(InterceptionManager::with_cleaner(config, cleaner.clone()));

  let (a, b) = tokio::join!(
    manager.start(9104, generate_ca()),
    manager.start(9105, generate_ca())
  );
  let (a, b) = (a.unwrap(), b.unwrap());
  assert_ne!(a.session_id, b.session_id);
  assert_ne!(a.docker_host, b.docker_host);

  let (status, _) = send(&a.docker_host, "POST", "/containers/create", br#"{"Image":"alpine"}"#).await;
  assert_eq!(status, 201);
  assert_eq!(manager.tracked(9104).await.len(), 1);
  assert!(manager.tracked(9105).await.is_empty());

  // stopping B touches nothing created through A
  manager.stop(9105).await.unwrap();
  assert!(cleaner.calls.lock().is_empty());
  assert_eq!(manager.tracked(9104).await.len(), 1);

  manager.stop(9104).await.unwrap();
  assert_eq!(cleaner.calls.lock().len(), 2);
}

#[tokio::test]
async fn test_start_is_idempotent_and_stop_releases_listener() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-lifecycle", engine.endpoint());
  let manager = InterceptionManager::with_cleaner(config, Arc::new(RecordingCleaner::default()));

  let first = manager.start(9106, generate_ca()).await.unwrap();
  let again = manager.start(9106, generate_ca()).await.unwrap();
  assert_eq!(first, again, "Second start must reuse the running session");
  assert!(first.ca_cert_path.exists(), "CA certificate not written");

  let base_env: HashMap<String, String> = HashMap::new();
  let patch = manager
    .env_overrides(9106, &base_env, FeatureFlags { docker_enabled: true })
    .await
    .unwrap();
  assert_eq!(patch.get("DOCKER_HOST"), Some(Some(first.docker_host.as_str())));
  assert_eq!(patch.get("DOCKER_BUILDKIT"), Some(Some("0")));

  manager.stop(9106).await.unwrap();
  let addr = first.docker_host.trim_start_matches("tcp://");
  assert!(
    TcpStream::connect(addr).await.is_err(),
    "Proxy still accepting after stop"
  );
  assert!(manager.endpoint(9106).await.is_none());
  assert!(manager
    .env_overrides(9106, &base_env, FeatureFlags { docker_enabled: true })
    .await
    .is_none());
}

#[tokio::test]
async fn test_cleanup_failures_do_not_abort_stop() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-cleanup", engine.endpoint());
  let cleaner = Arc::new(RecordingCleaner::default());
  let manager = InterceptionManager::with_cleaner(config, cleaner.clone());
  let endpoint = manager.start(9107, generate_ca()).await.unwrap();

  for id in ["gone", "broken", "healthy"] {
    assert!(manager.registry().register(endpoint.session_id, id));
  }
  manager.stop(9107).await.unwrap();
  let calls = cleaner.calls.lock().clone();
  assert_eq!(calls.len(), 6);
  for id in ["gone", "broken", "healthy"] {
    assert!(calls.contains(&format!("kill {}", id)));
    assert!(calls.contains(&format!("remove {}", id)));
  }
}

#[tokio::test]
async fn test_unreachable_engine_closes_connection() {
  // grab a free port and release it so nothing listens there
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead = listener.local_addr().unwrap();
  drop(listener);

  let config = test_config(
    "docker-intercept-test-unreachable",
    EngineEndpoint::Tcp(dead.to_string()),
  );
  let manager = InterceptionManager::with_cleaner(config, Arc::new(RecordingCleaner::default()));
  let endpoint = manager.start(9108, generate_ca()).await.unwrap();

  let mut stream = TcpStream::connect(endpoint.docker_host.trim_start_matches("tcp://"))
    .await
    .unwrap();
  let _ = stream
    .write_all(b"GET /_ping HTTP/1.1\r\nHost: docker\r\n\r\n")
    .await;
  let mut response = Vec::new();
  let _ = stream.read_to_end(&mut response).await;
  assert!(response.is_empty(), "No HTTP response expected, got {:?}", response);

  manager.stop(9108).await.unwrap();
}

#[tokio::test]
async fn test_invalid_trust_material_is_rejected() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-invalid", engine.endpoint());
  let storage: PathBuf = config.cert_storage_path.clone();
  let manager = InterceptionManager::with_cleaner(config, Arc::new(RecordingCleaner::default()));
  let result = manager
    .start(9109, TrustContext::new("not a pem", "not a key"))
    .await;
  assert!(matches!(result, Err(Error::CertificateError(_))));
  assert!(manager.endpoint(9109).await.is_none());
  assert!(!storage.join("9109").join("ca.pem").exists());
}

#[tokio::test]
async fn test_chunked_build_with_expect_continue() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-chunked", engine.endpoint());
  let manager = InterceptionManager::with_cleaner(config, Arc::new(RecordingCleaner::default()));
  let endpoint = manager.start(9110, generate_ca()).await.unwrap();

  let context = build_context("FROM alpine AS a\nRUN echo $((1<<2))\nFROM debian\nRUN true\n");
  let mut conn = ApiConnection::open(&endpoint.docker_host).await;
  conn
    .write(b"POST /v1.43/build?t=app HTTP/1.1\r\nHost: docker\r\nContent-Type: application/x-tar\r\nTransfer-Encoding: chunked\r\nExpect: 100-continue\r\nConnection: close\r\n\r\n")
    .await;
  let (status, _) = conn.response().await.expect("interim response");
  assert_eq!(status, 100, "Body must only be sent after 100 Continue");

  let (first, second) = context.split_at(context.len() / 2);
  for chunk in [first, second] {
    conn.write(format!("{:x}\r\n", chunk.len()).as_bytes()).await;
    conn.write(chunk).await;
    conn.write(b"\r\n").await;
  }
  conn.write(b"0\r\n\r\n").await;
  let (status, body) = conn.response().await.expect("build response");
  assert_eq!(status, 200);
  assert!(String::from_utf8_lossy(&body).contains("Successfully built"));

  let requests = engine.requests();
  assert_eq!(requests.len(), 1);
  assert!(
    !requests[0].headers.to_ascii_lowercase().contains("expect"),
    "Expect must not reach the Engine:\n{}",
    requests[0].headers
  );
  let entries = read_entries(&requests[0].body);
  assert!(entries.contains_key(".docker-intercept/ca.pem"));
  let rewritten = String::from_utf8(entries["Dockerfile"].clone()).unwrap();
  assert_eq!(
    rewritten
      .matches("COPY .docker-intercept/ca.pem /.docker-intercept/ca.pem")
      .count(),
    2,
    "Shell arithmetic must not hide the second stage:\n{}",
    rewritten
  );

  manager.stop(9110).await.unwrap();
}

#[tokio::test]
async fn test_keep_alive_connection_serves_several_requests() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-keepalive", engine.endpoint());
  let manager = InterceptionManager::with_cleaner(config, Arc::new(RecordingCleaner::default()));
  let endpoint = manager.start(9111, generate_ca()).await.unwrap();

  let mut conn = ApiConnection::open(&endpoint.docker_host).await;
  conn.request("GET", "/_ping", b"").await;
  assert_eq!(conn.response().await, Some((200, b"OK".to_vec())));
  conn
    .request("POST", "/v1.43/containers/create", br#"{"Image":"alpine"}"#)
    .await;
  let (status, _) = conn.response().await.expect("create response");
  assert_eq!(status, 201);
  conn.request("GET", "/_ping", b"").await;
  assert_eq!(conn.response().await, Some((200, b"OK".to_vec())));

  let requests = engine.requests();
  assert_eq!(requests.len(), 3);
  let config: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
  assert!(config["Env"]
    .as_array()
    .unwrap()
    .iter()
    .any(|v| v == "SSL_CERT_FILE=/.docker-intercept/ca.pem"));
  assert!(manager.tracked(9111).await.contains(CONTAINER_ID));

  manager.stop(9111).await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_idle_keep_alive_connections() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-idle", engine.endpoint());
  let cleaner = Arc::new(RecordingCleaner::default());
  let manager = InterceptionManager::with_cleaner(config, cleaner.clone());
  let endpoint = manager.start(9112, generate_ca()).await.unwrap();

  let mut conn = ApiConnection::open(&endpoint.docker_host).await;
  conn
    .request("POST", "/containers/create", br#"{"Image":"alpine"}"#)
    .await;
  assert_eq!(conn.response().await.map(|(status, _)| status), Some(201));

  manager.stop(9112).await.unwrap();
  assert_eq!(cleaner.calls.lock().len(), 2);

  // the same connection must not create containers nobody will clean up
  conn
    .request("POST", "/containers/create", br#"{"Image":"alpine"}"#)
    .await;
  assert_eq!(conn.response().await, None, "Connection should be closed after stop");
  let creates = engine
    .requests()
    .iter()
    .filter(|r| r.target.ends_with("/containers/create"))
    .count();
  assert_eq!(creates, 1);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_create() {
  let engine = FakeEngine::with_create_delay(Duration::from_millis(500)).await;
  let config = test_config("docker-intercept-test-inflight", engine.endpoint());
  let cleaner = Arc::new(RecordingCleaner::default());
  let manager = InterceptionManager::with_cleaner(config, cleaner.clone());
  let endpoint = manager.start(9114, generate_ca()).await.unwrap();

  let docker_host = endpoint.docker_host.clone();
  let create = tokio::spawn(async move {
    send(&docker_host, "POST", "/containers/create", br#"{"Image":"alpine"}"#).await
  });
  // let the create reach the Engine before stopping
  tokio::time::sleep(Duration::from_millis(100)).await;
  assert_eq!(engine.requests().len(), 1);

  manager.stop(9114).await.unwrap();
  assert_eq!(
    *cleaner.calls.lock(),
    vec![format!("kill {}", CONTAINER_ID), format!("remove {}", CONTAINER_ID)],
    "Container created during stop must still be cleaned up"
  );
  let (status, _) = create.await.unwrap();
  assert_eq!(status, 201);
}

#[tokio::test]
async fn test_attach_stream_is_hijacked() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-attach", engine.endpoint());
  let manager = InterceptionManager::with_cleaner(config, Arc::new(RecordingCleaner::default()));
  let endpoint = manager.start(9113, generate_ca()).await.unwrap();

  let mut conn = ApiConnection::open(&endpoint.docker_host).await;
  conn
    .write(b"POST /v1.43/containers/abc/attach?stream=1&stdin=1&stdout=1 HTTP/1.1\r\nHost: docker\r\nContent-Length: 0\r\nConnection: Upgrade\r\nUpgrade: tcp\r\n\r\n")
    .await;
  assert_eq!(conn.response().await, Some((101, Vec::new())));

  conn.write(b"ls -la\n").await;
  let mut echoed = [0u8; 7];
  conn.stream.read_exact(&mut echoed).await.unwrap();
  assert_eq!(&echoed, b"ls -la\n");

  manager.stop(9113).await.unwrap();
}

#[tokio::test]
async fn test_removal_by_name_keeps_container_tracked() {
  let engine = FakeEngine::start().await;
  let config = test_config("docker-intercept-test-remove-name", engine.endpoint());
  let cleaner = Arc::new(RecordingCleaner::default());
  let manager = InterceptionManager::with_cleaner(config, cleaner.clone());
  let endpoint = manager.start(9115, generate_ca()).await.unwrap();

  let (status, _) = send(
    &endpoint.docker_host,
    "POST",
    "/containers/create?name=web",
    br#"{"Image":"alpine"}"#,
  )
  .await;
  assert_eq!(status, 201);

  // "4f66" could be a name of an unrelated container as well as an id prefix
  for container in ["web", "4f66"] {
    let (status, _) = send(
      &endpoint.docker_host,
      "DELETE",
      &format!("/v1.43/containers/{}", container),
      b"",
    )
    .await;
    assert_eq!(status, 204);
    assert!(manager.tracked(9115).await.contains(CONTAINER_ID));
  }

  manager.stop(9115).await.unwrap();
  assert_eq!(
    *cleaner.calls.lock(),
    vec![format!("kill {}", CONTAINER_ID), format!("remove {}", CONTAINER_ID)]
  );
}
