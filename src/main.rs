mod config;
mod logging;
mod paths;
mod sandbox;
mod server;
mod tracker;

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::config::Config;
use crate::server::AppState;

fn print_help() {
    println!(
        "\
bt-service v{}

HTTP service that runs confined local tools and forwards issue updates to Jira.

USAGE:
    bt-service [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/service.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG           Log filter for tracing, overrides app.log_level
                       (e.g. debug, bt_service=debug,tower_http=info)
    BT_PROJECT_ROOT    Base directory for relative paths in the config
                       (overrides app.project_root)
    JIRA_API_TOKEN     Conventional name for the Jira API token
                       (reference it as api_token = \"${{JIRA_API_TOKEN}}\")

EXAMPLES:
    bt-service                              # uses config/service.toml
    bt-service /etc/bt-service/prod.toml    # custom config path
    RUST_LOG=debug bt-service               # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("bt-service v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/service.toml".to_string());

    // The log level depends on the config, so load it first
    let config = Config::load(&config_path)?;
    logging::init(&config.app);

    println!(
        r#"
   _     _
  | |__ | |_      ___  ___ _ ____   _(_) ___ ___
  | '_ \| __|____/ __|/ _ \ '__\ \ / / |/ __/ _ \
  | |_) | ||_____\__ \  __/ |   \ V /| | (_|  __/
  |_.__/ \__|    |___/\___|_|    \_/ |_|\___\___|
                                           v{}
"#,
        env!("CARGO_PKG_VERSION")
    );

    info!("Loaded configuration from {config_path}");
    info!(
        "Startup app={} env={} log_level={} log_json={} access_log={}",
        config.app.name,
        config.app.env,
        config.app.resolved_log_level(),
        config.app.resolved_log_json(),
        config.app.log_access,
    );
    info!("Project root: {}", config.project_root.display());

    let state = Arc::new(AppState::from_config(&config)?);
    info!("Approved tool directory: {}", state.engine.approved_root().display());
    info!(
        "Timeouts: default {}s, max {}s; cancel on disconnect: {}",
        config.tools.default_timeout_seconds,
        config.tools.max_timeout_seconds,
        config.tools.cancel_on_disconnect,
    );
    if config.proxy.is_configured() {
        info!(
            "Proxy configured (exported to tools: {})",
            config.proxy.apply_to_process
        );
    }
    info!("Issue tracker: {}", state.tracker.name());
    match config.jira_credentials() {
        Ok(creds) => info!("Jira: {} as {}", creds.base_url, creds.user_email),
        Err(e) => warn!("{e}; /jira endpoints will fail until it is set"),
    }

    server::serve(&config.api, state, shutdown_signal()).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
