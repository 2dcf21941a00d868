//! Path resolution: keeps every file tool inside the task's workspace.

use std::path::{Component, Path, PathBuf};
use tasklane_core::error::ToolError;

/// Resolve `relative` against `workspace`, refusing anything that escapes it.
///
/// Checks:
/// 1. No `..` components and no absolute paths outside the workspace
/// 2. The nearest existing ancestor is canonicalized so symlinks cannot leave
///    the workspace either
pub fn resolve(workspace: &Path, relative: &str, tool_name: &str) -> Result<PathBuf, ToolError> {
    let denied = |reason: String| ToolError::PermissionDenied {
        tool_name: tool_name.to_string(),
        reason,
    };

    let candidate = Path::new(relative.trim());
    if candidate.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(denied(format!("path traversal in '{relative}'")));
    }

    let root = workspace.canonicalize().map_err(|e| ToolError::ExecutionFailed {
        tool_name: tool_name.to_string(),
        reason: format!("workspace {} is not accessible: {e}", workspace.display()),
    })?;

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    // Canonicalize the deepest existing ancestor; the rest may not exist yet
    let mut existing = joined.as_path();
    let mut tail = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved = existing
        .canonicalize()
        .map_err(|e| denied(format!("cannot resolve '{relative}': {e}")))?;
    for part in tail.iter().rev() {
        resolved.push(part);
    }

    if !resolved.starts_with(&root) {
        return Err(denied(format!("'{relative}' is outside the workspace")));
    }
    Ok(resolved)
}

/// Path relative to the workspace, for messages.
pub fn display(workspace: &Path, path: &Path) -> String {
    let root = workspace.canonicalize().unwrap_or_else(|_| workspace.to_path_buf());
    path.strip_prefix(&root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_path_resolves_inside() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let p = resolve(dir.path(), "a.txt", "read_file").unwrap();
        assert!(p.ends_with("a.txt"));
        assert_eq!(display(dir.path(), &p), "a.txt");
    }

    #[test]
    fn missing_nested_path_is_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let p = resolve(dir.path(), "new/dir/file.rs", "write_to_file").unwrap();
        assert!(p.ends_with("new/dir/file.rs"));
    }

    #[test]
    fn traversal_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve(dir.path(), "../etc/passwd", "read_file").unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }

    #[test]
    fn absolute_outside_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let outside = other.path().join("x.txt");
        let err = resolve(dir.path(), outside.to_str().unwrap(), "read_file").unwrap_err();
        assert!(matches!(err, ToolError::PermissionDenied { .. }));
    }
}
