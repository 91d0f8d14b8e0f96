//! Project-root discovery and lexical path helpers.
//!
//! Nothing here touches the filesystem: canonicalization and confinement
//! checks live in `sandbox::resolve`.

use std::path::{Path, PathBuf};

/// Environment variable that pins the project root.
pub const PROJECT_ROOT_ENV: &str = "BT_PROJECT_ROOT";

/// Picks the project root: `BT_PROJECT_ROOT`, then the configured value
/// (relative to `cwd`), then `cwd` itself.
pub fn discover_project_root(configured: Option<&Path>, cwd: &Path) -> PathBuf {
    let from_env = std::env::var_os(PROJECT_ROOT_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from);

    match from_env.or_else(|| configured.map(Path::to_path_buf)) {
        Some(root) => resolve_from_root(cwd, &root),
        None => cwd.to_path_buf(),
    }
}

/// Joins `path` onto `root` unless it is already absolute. A leading `~`
/// is expanded to the home directory.
pub fn resolve_from_root(root: &Path, path: &Path) -> PathBuf {
    let expanded = match path.to_str() {
        Some(text) => PathBuf::from(shellexpand::tilde(text).as_ref()),
        None => path.to_path_buf(),
    };
    if expanded.is_absolute() {
        expanded
    } else {
        root.join(expanded)
    }
}

/// Component-wise prefix test. Both paths must already be canonical for the
/// answer to mean anything.
pub fn is_within(parent: &Path, candidate: &Path) -> bool {
    candidate.starts_with(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_joins_root() {
        let resolved = resolve_from_root(Path::new("/srv/bt"), Path::new("tools/bin"));
        assert_eq!(resolved, PathBuf::from("/srv/bt/tools/bin"));
    }

    #[test]
    fn test_resolve_absolute_kept() {
        let resolved = resolve_from_root(Path::new("/srv/bt"), Path::new("/opt/tools"));
        assert_eq!(resolved, PathBuf::from("/opt/tools"));
    }

    #[test]
    fn test_is_within_component_wise() {
        assert!(is_within(Path::new("/srv/bin"), Path::new("/srv/bin/tool")));
        assert!(is_within(Path::new("/srv/bin"), Path::new("/srv/bin")));
        // String prefix but not a path prefix
        assert!(!is_within(Path::new("/srv/bin"), Path::new("/srv/bin2/tool")));
        assert!(!is_within(Path::new("/srv/bin"), Path::new("/srv")));
    }

    #[test]
    fn test_discover_uses_configured_then_cwd() {
        if std::env::var_os(PROJECT_ROOT_ENV).is_some() {
            return;
        }
        assert_eq!(
            discover_project_root(Some(Path::new("deploy")), Path::new("/home/svc")),
            PathBuf::from("/home/svc/deploy")
        );
        assert_eq!(
            discover_project_root(None, Path::new("/home/svc")),
            PathBuf::from("/home/svc")
        );
    }
}
