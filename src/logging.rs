//! tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;

/// Filter used when RUST_LOG is not set: our crate and the HTTP access
/// log at the configured level, everything else at warn.
pub fn default_directives(app: &AppConfig) -> String {
    let level = app.resolved_log_level();
    format!("warn,bt_service={level},tower_http={level}")
}

/// Installs the global subscriber. Call once, after the config is loaded.
pub fn init(app: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(app)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if app.resolved_log_json() {
        builder.json().with_current_span(true).init();
    } else {
        builder.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_follow_env() {
        let app = AppConfig {
            env: "staging".into(),
            ..Default::default()
        };
        assert_eq!(default_directives(&app), "warn,bt_service=info,tower_http=info");

        let app = AppConfig {
            env: "prod".into(),
            log_level: "DEBUG".into(),
            ..Default::default()
        };
        assert_eq!(default_directives(&app), "warn,bt_service=debug,tower_http=debug");
    }

    #[test]
    fn test_default_directives_parse() {
        let app = AppConfig::default();
        assert!(EnvFilter::try_new(default_directives(&app)).is_ok());
    }
}
