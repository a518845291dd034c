//! Workspace and user-state path layout

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Name of the unified configuration file.
pub const CONFIG_FILE: &str = "sbkube.yaml";

/// Legacy two-file split (still accepted).
pub const LEGACY_CONFIG_FILE: &str = "config.yaml";
pub const LEGACY_SOURCES_FILE: &str = "sources.yaml";

/// Pulled Helm charts: `charts/{repo}/{chart}-{version}/`
pub fn charts_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join("charts")
}

/// Cloned Git repositories: `repos/{name}/`
pub fn repos_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join("repos")
}

/// Built chart artifacts: `build/{app-name}/`
pub fn build_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join("build")
}

/// Rendered manifests: `rendered/{app-name}/`
pub fn rendered_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join("rendered")
}

/// User-supplied chart overrides: `overrides/{app-name}/...`
pub fn overrides_dir(workspace_root: &Path) -> PathBuf {
    workspace_root.join("overrides")
}

/// Versioned chart directory for a pulled chart.
///
/// Both repo and version take part in the path so that same-name charts from
/// different repos, or different versions of one chart, never collide.
pub fn chart_version_dir(
    workspace_root: &Path,
    repo: &str,
    chart: &str,
    version: Option<&str>,
) -> PathBuf {
    let leaf = match version {
        Some(v) => format!("{}-{}", chart, v),
        None => format!("{}-latest", chart),
    };
    charts_dir(workspace_root).join(repo).join(leaf)
}

/// The per-user state directory, `~/.sbkube/`. Created on first use.
pub fn state_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot determine home directory")?;
    let dir = home.join(".sbkube");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create state directory {}", dir.display()))?;
    Ok(dir)
}

/// Path of the embedded state database.
pub fn state_db_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("deployments.db"))
}

/// Per-invocation execution traces, `~/.sbkube/runs/`.
pub fn runs_dir() -> Result<PathBuf> {
    let dir = state_dir()?.join("runs");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runs directory {}", dir.display()))?;
    Ok(dir)
}

/// Resolve a possibly-relative path against a base directory.
pub fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_version_dir_versioned() {
        let root = Path::new("/ws");
        let dir = chart_version_dir(root, "bitnami", "redis", Some("17.13.2"));
        assert_eq!(dir, PathBuf::from("/ws/charts/bitnami/redis-17.13.2"));
    }

    #[test]
    fn test_chart_version_dir_latest() {
        let root = Path::new("/ws");
        let dir = chart_version_dir(root, "bitnami", "redis", None);
        assert_eq!(dir, PathBuf::from("/ws/charts/bitnami/redis-latest"));
    }

    #[test]
    fn test_collision_freedom_across_repos_and_versions() {
        let root = Path::new("/ws");
        let a = chart_version_dir(root, "repo-a", "nginx", Some("1.0.0"));
        let b = chart_version_dir(root, "repo-b", "nginx", Some("1.0.0"));
        let c = chart_version_dir(root, "repo-a", "nginx", Some("2.0.0"));
        assert_ne!(a, b);
        assert_ne!(a, c);
        // same chart, same version: shared
        let d = chart_version_dir(root, "repo-a", "nginx", Some("1.0.0"));
        assert_eq!(a, d);
    }

    #[test]
    fn test_resolve_relative() {
        let base = Path::new("/ws/app");
        assert_eq!(
            resolve_relative(base, Path::new("values.yaml")),
            PathBuf::from("/ws/app/values.yaml")
        );
        assert_eq!(
            resolve_relative(base, Path::new("/abs/values.yaml")),
            PathBuf::from("/abs/values.yaml")
        );
    }
}
