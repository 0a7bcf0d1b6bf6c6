//! Container creation request rewriting

use crate::env::is_owned_env_key;
use crate::outcome::{PassThroughReason, Transformed};
use crate::session::InterceptionSession;
use bytes::Bytes;
use serde_json::{Map, Value};
use std::net::IpAddr;

/// Docker's magic value resolving to the host's gateway address
const HOST_GATEWAY: &str = "host-gateway";

fn unparseable(why: impl Into<String>) -> PassThroughReason {
  PassThroughReason::Unparseable(why.into())
}

/// Borrow `object[key]` as an array, creating it when missing or null.
fn array_field<'a>(
  object: &'a mut Map<String, Value>,
  key: &str,
) -> Result<&'a mut Vec<Value>, PassThroughReason> {
  let slot = object.entry(key).or_insert(Value::Null);
  if slot.is_null() {
    *slot = Value::Array(Vec::new());
  }
  slot
    .as_array_mut()
    .ok_or_else(|| unparseable(format!("{} is not an array", key)))
}

fn merge_env(env: &mut Vec<Value>, owned: &[(&'static str, String)]) -> Result<(), PassThroughReason> {
  let mut seen = vec![false; owned.len()];
  for entry in env.iter_mut() {
    let raw = entry
      .as_str()
      .ok_or_else(|| unparseable("Env entry is not a string"))?;
    let key = raw.split_once('=').map(|(k, _)| k).unwrap_or(raw);
    if !is_owned_env_key(key) {
      continue;
    }
    if let Some(index) = owned.iter().position(|(k, _)| *k == key) {
      *entry = Value::String(format!("{}={}", key, owned[index].1));
      seen[index] = true;
    }
  }
  for ((key, value), seen) in owned.iter().zip(seen) {
    if !seen {
      env.push(Value::String(format!("{}={}", key, value)));
    }
  }
  Ok(())
}

fn add_cert_bind(host_config: &mut Map<String, Value>, session: &InterceptionSession) -> Result<(), PassThroughReason> {
  let container_path = session.container_cert_path();
  let binds = array_field(host_config, "Binds")?;
  let present = binds.iter().filter_map(Value::as_str).any(|bind| {
    let mut parts = bind.split(':');
    parts.next();
    parts.next() == Some(container_path)
  });
  if !present {
    binds.push(Value::String(format!(
      "{}:{}:ro",
      session.host_cert_path().display(),
      container_path
    )));
  }
  Ok(())
}

fn add_proxy_host(host_config: &mut Map<String, Value>, session: &InterceptionSession) -> Result<(), PassThroughReason> {
  let host = session.container_proxy_host();
  if host.parse::<IpAddr>().is_ok() {
    return Ok(());
  }
  let shares_network = host_config
    .get("NetworkMode")
    .and_then(Value::as_str)
    .is_some_and(|mode| mode.starts_with("container:"));
  if shares_network {
    // the container inherits the other container's /etc/hosts
    return Ok(());
  }
  let prefix = format!("{}:", host);
  let extra_hosts = array_field(host_config, "ExtraHosts")?;
  let present = extra_hosts
    .iter()
    .filter_map(Value::as_str)
    .any(|entry| entry.starts_with(&prefix));
  if !present {
    extra_hosts.push(Value::String(format!("{}{}", prefix, HOST_GATEWAY)));
  }
  Ok(())
}

fn rewrite(body: &[u8], session: &InterceptionSession) -> Result<Vec<u8>, PassThroughReason> {
  let mut doc: Value =
    serde_json::from_slice(body).map_err(|e| unparseable(format!("invalid create body: {}", e)))?;
  let object = doc
    .as_object_mut()
    .ok_or_else(|| unparseable("create body is not an object"))?;

  let owned = session.container_env();
  merge_env(array_field(object, "Env")?, &owned)?;

  let host_config = object
    .entry("HostConfig")
    .or_insert(Value::Null);
  if host_config.is_null() {
    *host_config = Value::Object(Map::new());
  }
  let host_config = host_config
    .as_object_mut()
    .ok_or_else(|| unparseable("HostConfig is not an object"))?;
  add_cert_bind(host_config, session)?;
  add_proxy_host(host_config, session)?;

  serde_json::to_vec(&doc).map_err(|e| unparseable(e.to_string()))
}

/// Rewrite a `POST /containers/create` body for the given session.
///
/// The owned proxy and trust variables replace caller values for the same
/// keys; the certificate is bind mounted read-only and the proxy host alias
/// is added. Every other field is left as sent. Without a session, or for a
/// body that is not a JSON object, the body is returned unchanged.
pub fn intercept_create(body: &Bytes, session: Option<&InterceptionSession>) -> Transformed<Bytes> {
  let Some(session) = session else {
    return Transformed::pass(body.clone(), PassThroughReason::NoSession);
  };
  match rewrite(body, session) {
    Ok(rewritten) => Transformed::Modified(Bytes::from(rewritten)),
    Err(reason) => {
      tracing::warn!("Forwarding container create unmodified: {}", reason);
      Transformed::pass(body.clone(), reason)
    }
  }
}
