//! Confined execution of local tools.
//!
//! Every request goes through the same pipeline:
//!
//! 1. A profile validates the request and builds an [`ExecutionPlan`]
//! 2. The executable is confined to the approved directory ([`resolve`])
//! 3. The child environment is composed from a startup snapshot ([`env`])
//! 4. The child runs under a hard deadline in its own process group ([`executor`])
//! 5. Captured output is sanitized and optionally parsed as JSON ([`output`])
//! 6. The profile maps the outcome to a response or an [`ExecError`]
//!
//! There is no isolation beyond that: no namespaces, no quotas other than
//! wall-clock time. Each call is one spawn-wait-collect cycle.

pub mod env;
pub mod error;
pub mod executor;
pub mod output;
pub mod profile;
pub mod resolve;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{Config, ProxyConfig, ToolsConfig};

pub use env::ChildEnv;
pub use error::{ExecError, Result};
pub use executor::{ExecutionPlan, ExecutionResult, Termination};
pub use profile::{
    GenericProfile, GenericRunOutput, GenericRunRequest, HciFilterOutput, HciFilterProfile,
    HciFilterRequest, InvocationProfile,
};

/// Settings shared by every invocation. Read-only after startup.
#[derive(Debug, Clone)]
pub struct Engine {
    approved_root: PathBuf,
    default_timeout: Duration,
    max_timeout: Duration,
    strip_ansi: bool,
    force_no_color_env: Option<String>,
    proxy: ProxyConfig,
    base_env: ChildEnv,
}

impl Engine {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(&config.approved_root(), &config.tools, &config.proxy)
    }

    /// Creates the approved directory if needed and pins it to its
    /// canonical path.
    pub fn new(
        approved_root: &Path,
        tools: &ToolsConfig,
        proxy: &ProxyConfig,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(approved_root).with_context(|| {
            format!("Failed to create tool directory {}", approved_root.display())
        })?;
        let approved_root = approved_root.canonicalize().with_context(|| {
            format!("Failed to resolve tool directory {}", approved_root.display())
        })?;

        Ok(Self {
            approved_root,
            default_timeout: Duration::from_secs(tools.default_timeout_seconds),
            max_timeout: Duration::from_secs(tools.max_timeout_seconds),
            strip_ansi: tools.strip_ansi_output,
            force_no_color_env: tools.force_no_color_env.clone(),
            proxy: proxy.clone(),
            base_env: env::base_environment(),
        })
    }

    /// Replaces the environment snapshot children start from.
    pub fn with_base_env(mut self, base_env: ChildEnv) -> Self {
        self.base_env = base_env;
        self
    }

    pub fn approved_root(&self) -> &Path {
        &self.approved_root
    }

    pub fn strip_ansi(&self) -> bool {
        self.strip_ansi
    }

    pub fn child_env(&self) -> ChildEnv {
        env::compose(&self.base_env, &self.proxy, self.force_no_color_env.as_deref())
    }

    /// Effective timeout: the default when absent, clamped to the maximum.
    pub fn timeout_for(&self, requested: Option<u64>) -> Result<Duration> {
        match requested {
            None => Ok(self.default_timeout),
            Some(0) => Err(ExecError::invalid("timeout_seconds", "must be at least 1")),
            Some(secs) => Ok(Duration::from_secs(secs).min(self.max_timeout)),
        }
    }

    /// Runs one request through `profile`.
    ///
    /// Dropping the returned future kills the child's process group.
    pub async fn invoke<P: InvocationProfile>(
        &self,
        profile: &P,
        request: P::Request,
    ) -> Result<P::Output> {
        let span = info_span!("invocation", id = %Uuid::new_v4(), profile = profile.name());
        async move {
            let plan = profile.build(&request, self).map_err(|e| {
                warn!("Rejected before spawn: {e}");
                e
            })?;
            info!(
                "Executing {:?} cwd={} timeout={:?} confined={}",
                plan.command(),
                plan.working_dir.display(),
                plan.timeout,
                plan.executable.is_confined()
            );

            let result = executor::run(&plan).await?;
            let outcome = profile.interpret(&request, result, self);

            match &outcome {
                Err(ExecError::ToolFailed {
                    exit_code,
                    timed_out,
                    stderr,
                    ..
                }) => error!(
                    "Tool failed exit_code={exit_code} timed_out={timed_out} stderr={stderr:?}"
                ),
                Err(ExecError::InvalidJsonOutput {
                    reason, exit_code, ..
                }) => error!("Tool printed invalid JSON exit_code={exit_code}: {reason}"),
                _ => {}
            }
            outcome
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;

    fn tools(default: u64, max: u64) -> ToolsConfig {
        ToolsConfig {
            default_timeout_seconds: default,
            max_timeout_seconds: max,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_creates_and_canonicalizes_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tools").join("bin");
        let engine = Engine::new(&root, &ToolsConfig::default(), &ProxyConfig::default()).unwrap();
        assert!(root.is_dir());
        assert_eq!(engine.approved_root(), root.canonicalize().unwrap());
    }

    #[test]
    fn test_timeout_defaults_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path(), &tools(30, 120), &ProxyConfig::default()).unwrap();

        assert_eq!(engine.timeout_for(None).unwrap(), Duration::from_secs(30));
        assert_eq!(engine.timeout_for(Some(5)).unwrap(), Duration::from_secs(5));
        assert_eq!(engine.timeout_for(Some(9999)).unwrap(), Duration::from_secs(120));
        assert!(matches!(
            engine.timeout_for(Some(0)),
            Err(ExecError::InvalidParameter { name: "timeout_seconds", .. })
        ));
    }

    #[test]
    fn test_child_env_applies_settings() {
        let dir = tempfile::tempdir().unwrap();
        let tools = ToolsConfig {
            force_no_color_env: Some("NO_COLOR".into()),
            ..Default::default()
        };
        let proxy = ProxyConfig {
            http: Some("http://proxy:3128".into()),
            ..Default::default()
        };
        let engine = Engine::new(dir.path(), &tools, &proxy)
            .unwrap()
            .with_base_env(ChildEnv::new());

        let env = engine.child_env();
        assert_eq!(env.get(&OsString::from("NO_COLOR")), Some(&OsString::from("1")));
        assert_eq!(
            env.get(&OsString::from("http_proxy")),
            Some(&OsString::from("http://proxy:3128"))
        );
    }
}
