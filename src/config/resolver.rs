//! Source resolution: locate the configuration file and the scope filter
//!
//! A command takes an optional positional TARGET path and an optional
//! `-f FILE`. The resolver turns those into (workspace root, config file,
//! scope filter) by upward directory search for `sbkube.yaml`.

use crate::utils::errors::SbkubeError;
use crate::utils::paths::CONFIG_FILE;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved invocation context.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedSource {
    pub workspace_root: PathBuf,
    pub config_file: PathBuf,
    /// Path relative to the workspace root restricting which phase subtree
    /// to execute; `None` means the whole workspace.
    pub scope: Option<PathBuf>,
}

/// Resolve from a positional target and/or `-f` file.
pub fn resolve(target: Option<&Path>, file: Option<&Path>) -> Result<ResolvedSource> {
    // -f wins outright
    if let Some(file) = file {
        let config_file = file
            .canonicalize()
            .with_context(|| format!("config file {} does not exist", file.display()))?;
        let workspace_root = config_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        return Ok(ResolvedSource {
            workspace_root,
            config_file,
            scope: None,
        });
    }

    let start = match target {
        Some(target) => target
            .canonicalize()
            .with_context(|| format!("target path {} does not exist", target.display()))?,
        None => std::env::current_dir().context("cannot determine current directory")?,
    };

    // a file target means its directory
    let start_dir = if start.is_file() {
        start.parent().map(Path::to_path_buf).unwrap_or(start.clone())
    } else {
        start.clone()
    };

    // the target itself may be a workspace root
    if start_dir.join(CONFIG_FILE).is_file() {
        return Ok(ResolvedSource {
            workspace_root: start_dir.clone(),
            config_file: start_dir.join(CONFIG_FILE),
            scope: None,
        });
    }

    // otherwise walk up to the nearest root; the remainder is the scope
    let mut cursor = start_dir.as_path();
    while let Some(parent) = cursor.parent() {
        if parent.join(CONFIG_FILE).is_file() {
            let scope = start_dir
                .strip_prefix(parent)
                .map(Path::to_path_buf)
                .unwrap_or_default();
            return Ok(ResolvedSource {
                workspace_root: parent.to_path_buf(),
                config_file: parent.join(CONFIG_FILE),
                scope: if scope.as_os_str().is_empty() {
                    None
                } else {
                    Some(scope)
                },
            });
        }
        cursor = parent;
    }

    Err(SbkubeError::config_file_not_found(&start_dir).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "apiVersion: sbkube/v1\n").unwrap();
    }

    #[test]
    fn test_explicit_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("custom.yaml");
        touch(&file);
        let resolved = resolve(None, Some(&file)).unwrap();
        assert_eq!(resolved.config_file, file.canonicalize().unwrap());
        assert_eq!(resolved.scope, None);
    }

    #[test]
    fn test_target_is_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(CONFIG_FILE));
        let resolved = resolve(Some(dir.path()), None).unwrap();
        assert_eq!(
            resolved.workspace_root,
            dir.path().canonicalize().unwrap()
        );
        assert_eq!(resolved.scope, None);
    }

    #[test]
    fn test_upward_search_yields_scope() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(CONFIG_FILE));
        let nested = dir.path().join("a101_data_rdb").join("inner");
        std::fs::create_dir_all(&nested).unwrap();
        let resolved = resolve(Some(&nested), None).unwrap();
        assert_eq!(
            resolved.workspace_root,
            dir.path().canonicalize().unwrap()
        );
        assert_eq!(
            resolved.scope,
            Some(PathBuf::from("a101_data_rdb/inner"))
        );
    }

    #[test]
    fn test_nearest_root_wins() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join(CONFIG_FILE));
        let inner_root = dir.path().join("phase");
        touch(&inner_root.join(CONFIG_FILE));
        let resolved = resolve(Some(&inner_root), None).unwrap();
        assert_eq!(
            resolved.workspace_root,
            inner_root.canonicalize().unwrap()
        );
    }

    #[test]
    fn test_no_config_found() {
        let dir = tempfile::tempdir().unwrap();
        let lonely = dir.path().join("lonely");
        std::fs::create_dir_all(&lonely).unwrap();
        // a tmpdir has no sbkube.yaml anywhere above it in practice, but the
        // walk may escape into the real filesystem; only assert the error
        // shape when the search came up empty
        if let Err(err) = resolve(Some(&lonely), None) {
            let sb = err.downcast_ref::<SbkubeError>().unwrap();
            assert_eq!(sb.kind, crate::utils::errors::ErrorKind::Config);
            assert!(sb.message.contains("sbkube.yaml"));
        }
    }
}
