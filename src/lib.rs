#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]
//! Docker interception engine
//!
//! Makes Docker builds, containers and compose stacks route their HTTP(S)
//! traffic through an intercepting proxy and trust its CA, without touching
//! the user's Dockerfiles or compose files.
//!
//! A per-session Docker API proxy is put in front of the real Engine and the
//! Docker CLI is pointed at it through `DOCKER_HOST`:
//!
//! - `POST /build`: every `FROM` stage of the Dockerfile gets the CA copied in
//!   and the proxy and trust variables set
//! - `POST /containers/create`: the CA is bind mounted and the same
//!   variables are merged into the container environment
//! - containers created during a session are killed and removed when the
//!   session stops
//!
//! Rewriting is fail-open. Anything that cannot be parsed is forwarded
//! exactly as it was received.
//!
//! # Example
//!
//! ```no_run
//! use docker_intercept::{FeatureFlags, InterceptConfig, InterceptionManager, TrustContext};
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = InterceptionManager::new(InterceptConfig::from_env())?;
//!     let trust = TrustContext::new(std::fs::read("ca.pem")?, std::fs::read("ca.key")?);
//!     let endpoint = manager.start(8080, trust).await?;
//!     println!("DOCKER_HOST={}", endpoint.docker_host);
//!
//!     let base_env: HashMap<String, String> = std::env::vars().collect();
//!     let flags = FeatureFlags { docker_enabled: true };
//!     if let Some(patch) = manager.env_overrides(8080, &base_env, flags).await {
//!         for (key, value) in patch.iter() {
//!             println!("{} = {:?}", key, value);
//!         }
//!     }
//!
//!     manager.stop(8080).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Optional Features
//!
//! - **gzip** *(enabled by default)*: accept gzip compressed build contexts.

mod api_proxy;
mod config;
mod context;
mod create;
mod dockerfile;
mod engine;
mod env;
mod error;
mod manager;
mod outcome;
mod registry;
mod session;
mod upstream;
mod wire;

pub use api_proxy::{ApiOperation, DockerApiProxy};
pub use config::{EngineEndpoint, InterceptConfig, DEFAULT_DOCKER_SOCKET};
pub use context::{transform_build_context, BuildInjection};
pub use create::intercept_create;
pub use dockerfile::{parse_stages, rewrite_dockerfile, DockerfileStage, InjectedBlock};
pub use engine::{ContainerCleaner, DockerEngine};
pub use env::{
  compute_overrides, container_env, is_owned_env_key, EnvPatch, FeatureFlags, OverrideContext,
  DOCKER_HOST_KEY, HOST_TRUST_KEY, PROXY_ENV_KEYS, TRUST_ENV_KEYS,
};
pub use error::{Error, Result};
pub use manager::{InterceptionManager, SessionEndpoint};
pub use outcome::{PassThroughReason, Transformed};
pub use registry::InterceptionRegistry;
pub use session::{InterceptionSession, SessionId, TrustContext};
pub use upstream::EngineStream;
