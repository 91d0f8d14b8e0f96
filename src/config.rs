use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::paths;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub jira: JiraConfig,
    /// Base for every relative path in the file. Filled in by `Config::parse`.
    #[serde(skip)]
    pub project_root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Deployment tier, e.g. "dev", "staging", "prod"
    #[serde(default = "default_app_env")]
    pub env: String,
    /// "auto" picks a level from `env`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Unset means: plain text in dev, JSON everywhere else
    #[serde(default)]
    pub log_json: Option<bool>,
    /// Per-request HTTP access log lines
    #[serde(default)]
    pub log_access: bool,
    /// Overridden by BT_PROJECT_ROOT
    #[serde(default)]
    pub project_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_api_prefix")]
    pub prefix: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ToolsConfig {
    /// The approved root: no executable outside it is ever run
    #[serde(default = "default_bin_dir")]
    pub bin_dir: PathBuf,
    /// Working directory for generic runs (defaults to `bin_dir`)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_max_timeout_seconds")]
    pub max_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub strip_ansi_output: bool,
    /// Variable set to "1" in every child's environment, e.g. "NO_COLOR"
    #[serde(default)]
    pub force_no_color_env: Option<String>,
    /// Accept `sub/tool` identifiers (still confined to `bin_dir`)
    #[serde(default)]
    pub allow_nested_executables: bool,
    /// Kill the child when the HTTP client goes away
    #[serde(default)]
    pub cancel_on_disconnect: bool,
    #[serde(default)]
    pub hci_filter: HciFilterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HciFilterConfig {
    #[serde(default = "default_hci_executable")]
    pub executable: PathBuf,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Fixed argument prefix; caller selectors and the input path follow it
    #[serde(default = "default_hci_args")]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    #[serde(default)]
    pub http: Option<String>,
    #[serde(default)]
    pub https: Option<String>,
    #[serde(default)]
    pub no_proxy: Option<String>,
    /// Export the proxy variables to spawned tools
    #[serde(default = "default_true")]
    pub apply_to_process: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JiraConfig {
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    /// Supports ${ENV_VAR} substitution
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_jira_timeout")]
    pub timeout_seconds: f64,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    /// Per-environment overrides, keyed by `app.env`
    #[serde(default)]
    pub environments: HashMap<String, JiraOverrides>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct JiraOverrides {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

/// Jira settings after tier resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct JiraCredentials {
    pub base_url: String,
    pub user_email: String,
    pub api_token: String,
}

/// A required setting is empty in both the per-environment and global tier.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error(
    "Jira is not configured: `{key}` is empty for environment `{env}` \
     (set jira.environments.{env}.{key} or jira.{key})"
)]
pub struct ConfigResolutionError {
    pub key: &'static str,
    pub env: String,
}

fn default_app_name() -> String {
    "bt-service".to_string()
}

fn default_app_env() -> String {
    "dev".to_string()
}

fn default_log_level() -> String {
    "auto".to_string()
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_api_prefix() -> String {
    "/api/v1".to_string()
}

fn default_bin_dir() -> PathBuf {
    PathBuf::from("tools/bin")
}

fn default_timeout_seconds() -> u64 {
    60
}

fn default_max_timeout_seconds() -> u64 {
    3600
}

fn default_hci_executable() -> PathBuf {
    PathBuf::from("tools/bin/hci-tool")
}

fn default_hci_args() -> Vec<String> {
    ["hci", "filter", "--mode", "json", "-o", "stdout"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_jira_timeout() -> f64 {
    15.0
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            env: default_app_env(),
            log_level: default_log_level(),
            log_json: None,
            log_access: false,
            project_root: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            prefix: default_api_prefix(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            bin_dir: default_bin_dir(),
            working_dir: None,
            default_timeout_seconds: default_timeout_seconds(),
            max_timeout_seconds: default_max_timeout_seconds(),
            strip_ansi_output: true,
            force_no_color_env: None,
            allow_nested_executables: false,
            cancel_on_disconnect: false,
            hci_filter: HciFilterConfig::default(),
        }
    }
}

impl Default for HciFilterConfig {
    fn default() -> Self {
        Self {
            executable: default_hci_executable(),
            working_dir: None,
            args: default_hci_args(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            http: None,
            https: None,
            no_proxy: None,
            apply_to_process: true,
        }
    }
}

impl Default for JiraConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            user_email: None,
            api_token: None,
            timeout_seconds: default_jira_timeout(),
            verify_ssl: true,
            environments: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Effective tracing level. "auto" follows the deployment tier.
    pub fn resolved_log_level(&self) -> String {
        let level = self.log_level.trim().to_ascii_lowercase();
        match level.as_str() {
            "auto" | "" => match self.env.as_str() {
                "dev" => "debug".to_string(),
                "prod" => "warn".to_string(),
                _ => "info".to_string(),
            },
            "warning" => "warn".to_string(),
            "critical" => "error".to_string(),
            _ => level,
        }
    }

    pub fn resolved_log_json(&self) -> bool {
        self.log_json.unwrap_or(self.env != "dev")
    }
}

impl ProxyConfig {
    pub fn is_configured(&self) -> bool {
        [&self.http, &self.https, &self.no_proxy]
            .iter()
            .any(|value| value.as_deref().is_some_and(|v| !v.is_empty()))
    }

    /// Proxy variables in both spellings; tools disagree on which case they read.
    pub fn proxy_env(&self) -> Vec<(&'static str, String)> {
        let mut vars = Vec::new();
        let pairs = [
            (&self.http, "HTTP_PROXY", "http_proxy"),
            (&self.https, "HTTPS_PROXY", "https_proxy"),
            (&self.no_proxy, "NO_PROXY", "no_proxy"),
        ];
        for (value, upper, lower) in pairs {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                vars.push((upper, value.to_string()));
                vars.push((lower, value.to_string()));
            }
        }
        vars
    }
}

/// First non-blank candidate wins. Candidates are ordered most specific first.
pub fn first_configured<'a>(candidates: &[Option<&'a str>]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
}

impl JiraConfig {
    /// Resolves base URL and credentials for `env`: the
    /// `jira.environments.<env>` tier first, then the global `jira` tier.
    pub fn credentials_for(&self, env: &str) -> Result<JiraCredentials, ConfigResolutionError> {
        let overrides = self.environments.get(env).cloned().unwrap_or_default();

        let pick = |key: &'static str,
                    specific: &Option<String>,
                    global: &Option<String>|
         -> Result<String, ConfigResolutionError> {
            first_configured(&[specific.as_deref(), global.as_deref()])
                .map(|v| v.trim_end_matches('/').to_string())
                .ok_or_else(|| ConfigResolutionError {
                    key,
                    env: env.to_string(),
                })
        };

        Ok(JiraCredentials {
            base_url: pick("base_url", &overrides.base_url, &self.base_url)?,
            user_email: pick("user_email", &overrides.user_email, &self.user_email)?,
            api_token: pick("api_token", &overrides.api_token, &self.api_token)?,
        })
    }
}

/// Upper bound for `tools.max_timeout_seconds`.
pub const MAX_TOOL_TIMEOUT_SECONDS: u64 = 3600;

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${JIRA_API_TOKEN}
        let expanded = shellexpand::env(&content)?;
        let cwd = std::env::current_dir()?;
        Self::parse(&expanded, &cwd)
    }

    /// Parses an already-expanded TOML document. `cwd` anchors a relative
    /// `app.project_root`.
    pub fn parse(content: &str, cwd: &Path) -> anyhow::Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.project_root = paths::discover_project_root(config.app.project_root.as_deref(), cwd);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let tools = &self.tools;
        if !(1..=MAX_TOOL_TIMEOUT_SECONDS).contains(&tools.max_timeout_seconds) {
            anyhow::bail!(
                "tools.max_timeout_seconds must be between 1 and {MAX_TOOL_TIMEOUT_SECONDS}"
            );
        }
        if tools.default_timeout_seconds == 0
            || tools.default_timeout_seconds > tools.max_timeout_seconds
        {
            anyhow::bail!(
                "tools.default_timeout_seconds must be between 1 and tools.max_timeout_seconds ({})",
                tools.max_timeout_seconds
            );
        }
        if !(1.0..=120.0).contains(&self.jira.timeout_seconds) {
            anyhow::bail!("jira.timeout_seconds must be between 1 and 120");
        }
        let prefix = &self.api.prefix;
        if !prefix.is_empty() && (!prefix.starts_with('/') || prefix.ends_with('/')) {
            anyhow::bail!(
                "api.prefix must start with '/' and must not end with '/' (got {prefix:?})"
            );
        }
        if let Some(name) = &tools.force_no_color_env {
            if name.is_empty() || name.contains('=') || name.contains('\0') {
                anyhow::bail!("tools.force_no_color_env is not a valid variable name: {name:?}");
            }
        }
        Ok(())
    }

    /// The approved root, before canonicalization.
    pub fn approved_root(&self) -> PathBuf {
        paths::resolve_from_root(&self.project_root, &self.tools.bin_dir)
    }

    pub fn tool_working_dir(&self) -> PathBuf {
        match &self.tools.working_dir {
            Some(dir) => paths::resolve_from_root(&self.project_root, dir),
            None => self.approved_root(),
        }
    }

    pub fn hci_filter_executable(&self) -> PathBuf {
        paths::resolve_from_root(&self.project_root, &self.tools.hci_filter.executable)
    }

    pub fn hci_filter_working_dir(&self) -> PathBuf {
        match &self.tools.hci_filter.working_dir {
            Some(dir) => paths::resolve_from_root(&self.project_root, dir),
            None => self.project_root.clone(),
        }
    }

    pub fn jira_credentials(&self) -> Result<JiraCredentials, ConfigResolutionError> {
        self.jira.credentials_for(&self.app.env)
    }
}
