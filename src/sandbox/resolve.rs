//! Path confinement for executables.
//!
//! Every executable the service runs must canonicalize to a path inside the
//! approved root. Identifiers are checked syntactically first, so traversal
//! attempts are rejected before the filesystem is consulted at all; the
//! canonical path is then checked again to catch symlinks pointing out.

use std::path::{Component, Path, PathBuf};

use crate::paths::is_within;

use super::error::{ExecError, Result};

/// How much structure a caller-supplied identifier may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamePolicy {
    /// A single file name, no separators.
    #[default]
    BareName,
    /// Relative paths below the root (`sub/tool`), still without `..`.
    Nested,
}

/// An executable that passed confinement. Only this module constructs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedExecutable {
    path: PathBuf,
    confined: bool,
}

impl ResolvedExecutable {
    /// Canonical absolute path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_confined(&self) -> bool {
        self.confined
    }
}

/// Resolves a caller-supplied identifier against the approved root.
///
/// `root` should already be canonical (see `Engine::from_config`); it is
/// canonicalized again here so a root that is itself a symlink still works.
pub fn resolve(root: &Path, identifier: &str, policy: NamePolicy) -> Result<ResolvedExecutable> {
    check_identifier(root, identifier, policy)?;
    confine(root, &root.join(identifier))
}

/// Resolves a server-configured executable path. No caller input takes part,
/// but the result must still live under the approved root.
pub fn resolve_configured(root: &Path, configured: &Path) -> Result<ResolvedExecutable> {
    if configured.components().any(|c| c == Component::ParentDir) {
        return Err(traversal(root, "configured path contains '..'"));
    }
    confine(root, configured)
}

fn check_identifier(root: &Path, identifier: &str, policy: NamePolicy) -> Result<()> {
    if identifier.is_empty() {
        return Err(traversal(root, "executable name is empty"));
    }
    if identifier.contains('\0') {
        return Err(traversal(root, "executable name contains a NUL byte"));
    }

    let candidate = Path::new(identifier);
    if candidate.is_absolute() || candidate.has_root() {
        return Err(traversal(root, "absolute paths are not allowed"));
    }

    let mut normal = 0usize;
    for component in candidate.components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(traversal(root, "'..' segments are not allowed"));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(traversal(root, "absolute paths are not allowed"));
            }
        }
    }
    // Windows-style separators are never meaningful in an identifier
    if identifier.contains('\\') {
        return Err(traversal(root, "backslashes are not allowed"));
    }

    let has_separator = identifier.contains('/') || normal > 1;
    if policy == NamePolicy::BareName && has_separator {
        return Err(traversal(root, "path separators are not allowed"));
    }
    if normal == 0 {
        return Err(traversal(root, "executable name is empty"));
    }
    Ok(())
}

fn confine(root: &Path, candidate: &Path) -> Result<ResolvedExecutable> {
    let canonical_root = root.canonicalize().map_err(|_| ExecError::ExecutableNotFound {
        path: root.to_path_buf(),
    })?;

    // Follows symlinks; a dangling link or missing file fails here
    let canonical = match candidate.canonicalize() {
        Ok(canonical) => canonical,
        Err(_) => {
            // A missing target is still an escape if the links point out
            if let Some(target) = dangling_target(candidate) {
                if !is_within(&canonical_root, &target) {
                    let reason =
                        format!("{} points outside the approved directory", candidate.display());
                    return Err(traversal(&canonical_root, &reason));
                }
            }
            return Err(ExecError::ExecutableNotFound {
                path: candidate.to_path_buf(),
            });
        }
    };

    if !is_within(&canonical_root, &canonical) || canonical == canonical_root {
        return Err(traversal(
            &canonical_root,
            &format!("{} resolves outside the approved directory", candidate.display()),
        ));
    }

    let metadata = std::fs::metadata(&canonical).map_err(|_| ExecError::ExecutableNotFound {
        path: canonical.clone(),
    })?;
    if !metadata.is_file() || !is_executable(&metadata) {
        return Err(ExecError::ExecutableNotFound { path: canonical });
    }

    Ok(ResolvedExecutable {
        path: canonical,
        confined: true,
    })
}

/// Upper bound on links followed by `dangling_target`, as in the kernel.
const MAX_SYMLINK_HOPS: usize = 40;

/// Where `path` would point if it existed: follows the final symlinks with
/// `read_link`, then canonicalizes the deepest ancestor that exists and
/// appends the rest lexically. `None` if nothing along the way exists.
fn dangling_target(path: &Path) -> Option<PathBuf> {
    let mut current = path.to_path_buf();
    for _ in 0..MAX_SYMLINK_HOPS {
        let is_link = std::fs::symlink_metadata(&current)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_link {
            break;
        }
        let link = std::fs::read_link(&current).ok()?;
        current = match current.parent() {
            Some(parent) if link.is_relative() => parent.join(link),
            _ => link,
        };
    }

    let (base, rest) = current.ancestors().find_map(|ancestor| {
        let canonical = ancestor.canonicalize().ok()?;
        let rest = current.strip_prefix(ancestor).ok()?.to_path_buf();
        Some((canonical, rest))
    })?;

    let mut target = base;
    for component in rest.components() {
        match component {
            Component::ParentDir => {
                target.pop();
            }
            Component::Normal(part) => target.push(part),
            _ => {}
        }
    }
    Some(target)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}

fn traversal(root: &Path, reason: &str) -> ExecError {
    ExecError::PathTraversal {
        root: root.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn write_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn assert_traversal(result: Result<ResolvedExecutable>) {
        match result {
            Err(ExecError::PathTraversal { .. }) => {}
            other => panic!("expected PathTraversal, got {other:?}"),
        }
    }

    // ── syntactic rejection (no filesystem needed) ──────

    #[test]
    fn test_parent_segments_rejected() {
        let root = Path::new("/nonexistent/approved");
        for id in ["..", "../bin/sh", "tool/../../etc/passwd", "./..", "a/.."] {
            assert_traversal(resolve(root, id, NamePolicy::Nested));
            assert_traversal(resolve(root, id, NamePolicy::BareName));
        }
    }

    #[test]
    fn test_absolute_rejected() {
        let root = Path::new("/nonexistent/approved");
        for id in ["/bin/sh", "/nonexistent/approved/tool", "//tool"] {
            assert_traversal(resolve(root, id, NamePolicy::Nested));
        }
    }

    #[test]
    fn test_separators_rejected_for_bare_names() {
        let root = Path::new("/nonexistent/approved");
        assert_traversal(resolve(root, "sub/tool", NamePolicy::BareName));
        assert_traversal(resolve(root, "sub\\tool", NamePolicy::Nested));
    }

    #[test]
    fn test_empty_and_nul_rejected() {
        let root = Path::new("/nonexistent/approved");
        assert_traversal(resolve(root, "", NamePolicy::BareName));
        assert_traversal(resolve(root, ".", NamePolicy::BareName));
        assert_traversal(resolve(root, "to\0ol", NamePolicy::BareName));
    }

    #[test]
    fn test_configured_path_with_parent_rejected() {
        let root = Path::new("/nonexistent/approved");
        assert_traversal(resolve_configured(
            root,
            Path::new("/nonexistent/approved/../escape"),
        ));
    }

    // ── filesystem checks ───────────────────────────────

    #[cfg(unix)]
    #[test]
    fn test_resolves_bare_name() {
        let dir = tempfile::tempdir().unwrap();
        write_executable(&dir.path().join("tool"));

        let resolved = resolve(dir.path(), "tool", NamePolicy::BareName).unwrap();
        assert!(resolved.is_confined());
        assert_eq!(
            resolved.path(),
            dir.path().canonicalize().unwrap().join("tool")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_nested_allowed_with_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        write_executable(&dir.path().join("sub/tool"));

        assert!(resolve(dir.path(), "sub/tool", NamePolicy::Nested).is_ok());
        assert_traversal(resolve(dir.path(), "sub/tool", NamePolicy::BareName));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let target = outside.path().join("evil");
        write_executable(&target);
        std::os::unix::fs::symlink(&target, root.path().join("innocent")).unwrap();

        assert_traversal(resolve(root.path(), "innocent", NamePolicy::BareName));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_escape_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        write_executable(&outside.path().join("tool"));
        std::os::unix::fs::symlink(outside.path(), root.path().join("linked")).unwrap();

        assert_traversal(resolve(root.path(), "linked/tool", NamePolicy::Nested));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_root_allowed() {
        let root = tempfile::tempdir().unwrap();
        write_executable(&root.path().join("real"));
        std::os::unix::fs::symlink(root.path().join("real"), root.path().join("alias")).unwrap();

        let resolved = resolve(root.path(), "alias", NamePolicy::BareName).unwrap();
        assert!(resolved.path().ends_with("real"));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_out_of_root_rejected() {
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("/nonexistent/outside/evil", root.path().join("link")).unwrap();

        assert_traversal(resolve(root.path(), "link", NamePolicy::BareName));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_relative_symlink_out_of_root_rejected() {
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink("../gone/tool", root.path().join("link")).unwrap();

        assert_traversal(resolve(root.path(), "link", NamePolicy::BareName));
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_file_under_linked_directory_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("linked")).unwrap();

        assert_traversal(resolve(root.path(), "linked/missing", NamePolicy::Nested));
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_inside_root_not_found() {
        let root = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(root.path().join("later"), root.path().join("link")).unwrap();

        match resolve(root.path(), "link", NamePolicy::BareName) {
            Err(ExecError::ExecutableNotFound { .. }) => {}
            other => panic!("expected ExecutableNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_executable_not_found() {
        let root = tempfile::tempdir().unwrap();
        match resolve(root.path(), "missing", NamePolicy::BareName) {
            Err(ExecError::ExecutableNotFound { .. }) => {}
            other => panic!("expected ExecutableNotFound, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_not_found() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("data.txt"), "x").unwrap();
        match resolve(root.path(), "data.txt", NamePolicy::BareName) {
            Err(ExecError::ExecutableNotFound { .. }) => {}
            other => panic!("expected ExecutableNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_directory_not_found() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("subdir")).unwrap();
        match resolve(root.path(), "subdir", NamePolicy::BareName) {
            Err(ExecError::ExecutableNotFound { .. }) => {}
            other => panic!("expected ExecutableNotFound, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_configured_absolute_path_inside_root() {
        let root = tempfile::tempdir().unwrap();
        let tool = root.path().join("hci-tool");
        write_executable(&tool);

        let resolved = resolve_configured(root.path(), &tool).unwrap();
        assert!(resolved.is_confined());
    }

    #[cfg(unix)]
    #[test]
    fn test_configured_path_outside_root_rejected() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let tool = outside.path().join("hci-tool");
        write_executable(&tool);

        assert_traversal(resolve_configured(root.path(), &tool));
    }
}
