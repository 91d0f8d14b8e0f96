//! Child-process environment composition.

use std::collections::BTreeMap;
use std::ffi::OsString;

use crate::config::ProxyConfig;

/// Environment handed to a child. Ordered so logs and tests are stable.
pub type ChildEnv = BTreeMap<OsString, OsString>;

/// Companion variables set alongside the configured "no color" variable.
const NO_COLOR_COMPANIONS: &[(&str, &str)] = &[
    ("CLICOLOR", "0"),
    ("CLICOLOR_FORCE", "0"),
    ("TERM", "dumb"),
];

/// Snapshot of this process's environment. Non-UTF-8 entries are kept as-is.
pub fn base_environment() -> ChildEnv {
    std::env::vars_os().collect()
}

/// Builds the environment for a child from `base`.
///
/// Proxy variables are added only when the proxy section asks for it; the
/// optional `force_no_color` variable is set to "1" regardless of what the
/// base environment says. The real process environment is never touched.
pub fn compose(base: &ChildEnv, proxy: &ProxyConfig, force_no_color: Option<&str>) -> ChildEnv {
    let mut env = base.clone();

    if proxy.apply_to_process {
        for (key, value) in proxy.proxy_env() {
            env.insert(key.into(), value.into());
        }
    }

    if let Some(name) = force_no_color {
        env.insert(name.into(), "1".into());
        for (key, value) in NO_COLOR_COMPANIONS {
            env.insert((*key).into(), (*value).into());
        }
    }

    env
}
