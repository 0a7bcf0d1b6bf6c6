//! Environment overrides for intercepted Docker invocations
//!
//! Two related key sets live here: the host-side patch that redirects the
//! Docker CLI to the API proxy, and the container-side variables that make
//! processes inside images and containers use the intercepting proxy and
//! trust its CA.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Proxy variables owned by the interception inside containers
pub const PROXY_ENV_KEYS: [&str; 4] = ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

/// Trust-store variables owned by the interception inside containers
pub const TRUST_ENV_KEYS: [&str; 8] = [
  "SSL_CERT_FILE",
  "NODE_EXTRA_CA_CERTS",
  "REQUESTS_CA_BUNDLE",
  "CURL_CA_BUNDLE",
  "GIT_SSL_CAINFO",
  "CARGO_HTTP_CAINFO",
  "PERL_LWP_SSL_CA_FILE",
  "DENO_CERT",
];

/// Host-side variable redirecting the Docker CLI
pub const DOCKER_HOST_KEY: &str = "DOCKER_HOST";
/// Host-side trust-store variable honoured by the Docker CLI
pub const HOST_TRUST_KEY: &str = "SSL_CERT_FILE";

/// Variables forcing the classic builder, which sends the context as a tar body
const CLASSIC_BUILDER_KEYS: [&str; 2] = ["DOCKER_BUILDKIT", "COMPOSE_DOCKER_CLI_BUILD"];
/// TLS settings that would make the CLI speak TLS to the plain-HTTP API proxy
const DOCKER_TLS_KEYS: [&str; 2] = ["DOCKER_TLS_VERIFY", "DOCKER_CERT_PATH"];

/// Whether `key` is one the interception force-overrides inside containers
pub fn is_owned_env_key(key: &str) -> bool {
  PROXY_ENV_KEYS.contains(&key) || TRUST_ENV_KEYS.contains(&key)
}

/// The owned container variables, proxy keys first, in a fixed order.
pub fn container_env(proxy_url: &str, cert_path: &str) -> Vec<(&'static str, String)> {
  PROXY_ENV_KEYS
    .iter()
    .map(|key| (*key, proxy_url.to_string()))
    .chain(TRUST_ENV_KEYS.iter().map(|key| (*key, cert_path.to_string())))
    .collect()
}

/// Feature switches for override computation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FeatureFlags {
  /// Redirect Docker CLI traffic through the API proxy
  pub docker_enabled: bool,
}

/// Inputs to [`compute_overrides`]
#[derive(Clone, Copy, Debug)]
pub struct OverrideContext<'a> {
  /// CA certificate file on the host
  pub ca_cert_path: &'a Path,
  /// Endpoint of the session's Docker API proxy, e.g. `tcp://127.0.0.1:41234`
  pub docker_host: Option<&'a str>,
}

/// A set of environment changes. `None` values remove the key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvPatch {
  entries: BTreeMap<String, Option<String>>,
}

impl EnvPatch {
  /// An empty patch
  pub fn new() -> Self {
    Self::default()
  }

  /// Set `key` to `value`
  pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.entries.insert(key.into(), Some(value.into()));
  }

  /// Remove `key`
  pub fn unset(&mut self, key: impl Into<String>) {
    self.entries.insert(key.into(), None);
  }

  /// The change for `key`: `Some(Some(v))` sets, `Some(None)` removes.
  pub fn get(&self, key: &str) -> Option<Option<&str>> {
    self.entries.get(key).map(|v| v.as_deref())
  }

  /// Whether the patch touches `key`
  pub fn contains_key(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  /// Number of touched keys
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Whether the patch changes nothing
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Iterate the changes in key order
  pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
  }

  /// Merge the patch into `env`
  pub fn apply(&self, env: &mut HashMap<String, String>) {
    for (key, value) in &self.entries {
      match value {
        Some(value) => {
          env.insert(key.clone(), value.clone());
        }
        None => {
          env.remove(key);
        }
      }
    }
  }
}

/// Compute the environment changes for an intercepted Docker invocation.
///
/// Only keys whose value differs from `base_env` are returned, so the patch
/// of an already patched environment is empty.
pub fn compute_overrides(
  ctx: &OverrideContext<'_>,
  base_env: &HashMap<String, String>,
  flags: FeatureFlags,
) -> EnvPatch {
  let mut patch = EnvPatch::new();
  let set = |patch: &mut EnvPatch, key: &str, value: String| {
    if base_env.get(key) != Some(&value) {
      patch.set(key, value);
    }
  };

  set(
    &mut patch,
    HOST_TRUST_KEY,
    ctx.ca_cert_path.display().to_string(),
  );

  if flags.docker_enabled {
    if let Some(docker_host) = ctx.docker_host {
      set(&mut patch, DOCKER_HOST_KEY, docker_host.to_string());
      for key in CLASSIC_BUILDER_KEYS {
        set(&mut patch, key, "0".to_string());
      }
      for key in DOCKER_TLS_KEYS {
        if base_env.contains_key(key) {
          patch.unset(key);
        }
      }
    }
  }
  patch
}
