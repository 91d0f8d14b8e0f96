use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::sandbox::{Engine, GenericProfile, HciFilterProfile};
use crate::tracker::{IssueTracker, JiraClient};

/// Shared, read-only state handed to every handler.
pub struct AppState {
    pub app_name: String,
    pub env: String,
    pub api_prefix: String,
    pub log_access: bool,
    /// Run executions inside the request future so a disconnect kills them
    pub cancel_on_disconnect: bool,
    pub engine: Arc<Engine>,
    pub generic: Arc<GenericProfile>,
    pub hci_filter: Arc<HciFilterProfile>,
    pub tracker: Arc<dyn IssueTracker>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let engine = Engine::from_config(config)?;
        let tracker = Arc::new(JiraClient::from_config(config)?);
        Ok(Self::new(config, engine, tracker))
    }

    pub fn new(config: &Config, engine: Engine, tracker: Arc<dyn IssueTracker>) -> Self {
        Self {
            app_name: config.app.name.clone(),
            env: config.app.env.clone(),
            api_prefix: config.api.prefix.clone(),
            log_access: config.app.log_access,
            cancel_on_disconnect: config.tools.cancel_on_disconnect,
            engine: Arc::new(engine),
            generic: Arc::new(GenericProfile::from_config(config)),
            hci_filter: Arc::new(HciFilterProfile::from_config(config)),
            tracker,
            started_at: Utc::now(),
        }
    }
}
