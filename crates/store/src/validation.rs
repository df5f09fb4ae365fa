use std::path::{Component, Path, PathBuf};

use crate::StoreError;

/// Resolves a protocol path to a location under `root`.
///
/// Bus paths are usually absolute (`/logs/00000001.BIN`); the leading
/// separators are stripped and the rest is joined under the store root.
///
/// Rejects:
/// - Empty paths (after stripping)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn resolve_store_path(root: &Path, file_path: &str) -> Result<PathBuf, StoreError> {
    let relative = file_path.trim_start_matches(['/', '\\']);
    if relative.is_empty() {
        return Err(StoreError::InvalidPath(format!(
            "empty path: {file_path:?}"
        )));
    }

    let path = Path::new(relative);
    let mut resolved = root.to_path_buf();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(StoreError::InvalidPath(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(StoreError::InvalidPath(format!(
                    "path prefix not allowed: {file_path}"
                )));
            }
            Component::CurDir => {}
            Component::Normal(part) => resolved.push(part),
        }
    }

    if resolved.as_path() == root {
        return Err(StoreError::InvalidPath(format!(
            "path names the store root: {file_path}"
        )));
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/srv/bus")
    }

    #[test]
    fn absolute_bus_path_lands_under_root() {
        let p = resolve_store_path(&root(), "/logs/00000001.BIN").unwrap();
        assert_eq!(p, PathBuf::from("/srv/bus/logs/00000001.BIN"));
    }

    #[test]
    fn relative_path_lands_under_root() {
        let p = resolve_store_path(&root(), "params.parm").unwrap();
        assert_eq!(p, PathBuf::from("/srv/bus/params.parm"));
    }

    #[test]
    fn current_dir_components_are_dropped() {
        let p = resolve_store_path(&root(), "./a/./b").unwrap();
        assert_eq!(p, PathBuf::from("/srv/bus/a/b"));
    }

    #[test]
    fn rejects_empty_and_bare_root() {
        assert!(resolve_store_path(&root(), "").is_err());
        assert!(resolve_store_path(&root(), "/").is_err());
        assert!(resolve_store_path(&root(), "/./").is_err());
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(resolve_store_path(&root(), "../../../etc/passwd").is_err());
        assert!(resolve_store_path(&root(), "/sub/../../escape").is_err());
        assert!(resolve_store_path(&root(), "..").is_err());
    }
}
