//! The recursive workspace tree
//!
//! Each phase points at another `sbkube.yaml` (or embeds one inline).
//! Loading resolves the whole tree up front, computing per-node effective
//! settings functionally; a phase that points back at an ancestor is a
//! configuration error, reported with the chain that closes the loop.

use crate::config::legacy;
use crate::config::model::{self, PhaseRef, UnifiedConfig};
use crate::config::settings::EffectiveSettings;
use crate::utils::errors::{ErrorKind, SbkubeError};
use crate::utils::paths::CONFIG_FILE;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// One node of the loaded workspace tree.
#[derive(Debug, Clone)]
pub struct PhaseNode {
    /// Phase name; the root node is named after its directory.
    pub name: String,
    /// App-group label: the directory holding the node's document (phase
    /// name for inline sub-workspaces).
    pub group: String,
    pub dir: PathBuf,
    pub config_file: PathBuf,
    pub config: UnifiedConfig,
    pub effective: EffectiveSettings,
    pub children: Vec<PhaseNode>,
}

impl PhaseNode {
    /// Depth-first iterator over the tree, parents before children.
    pub fn walk(&self) -> Vec<&PhaseNode> {
        let mut nodes = vec![self];
        for child in &self.children {
            nodes.extend(child.walk());
        }
        nodes
    }

    /// Select the subtree a scope filter points at. The filter is a path
    /// relative to the workspace root; the nearest node whose directory
    /// contains it wins, deepest first.
    pub fn select_scope(&self, workspace_root: &Path, scope: &Path) -> Option<&PhaseNode> {
        if scope.as_os_str().is_empty() {
            return Some(self);
        }
        let target = workspace_root.join(scope);
        let mut best: Option<(&PhaseNode, usize)> = None;
        for node in self.walk() {
            if target.starts_with(&node.dir) {
                let depth = node.dir.components().count();
                if best.map_or(true, |(_, d)| depth > d) {
                    best = Some((node, depth));
                }
            }
        }
        best.map(|(node, _)| node)
    }
}

/// Load the full workspace tree rooted at a config file.
pub fn load_workspace(config_file: &Path) -> Result<PhaseNode> {
    let config_file = config_file
        .canonicalize()
        .with_context(|| format!("config file {} does not exist", config_file.display()))?;
    let mut ancestors = Vec::new();
    load_node(&config_file, None, None, &mut ancestors)
}

fn load_node(
    config_file: &Path,
    name: Option<&str>,
    parent: Option<&EffectiveSettings>,
    ancestors: &mut Vec<PathBuf>,
) -> Result<PhaseNode> {
    if ancestors.iter().any(|a| a == config_file) {
        let mut chain: Vec<String> = ancestors
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        chain.push(config_file.display().to_string());
        return Err(SbkubeError::new(
            ErrorKind::Config,
            "phase tree contains a cycle",
        )
        .with_details(chain.join("\n -> "))
        .into());
    }

    let dir = config_file
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let config = load_document(config_file)?;
    let group = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let name = name.map(str::to_string).unwrap_or_else(|| group.clone());

    let effective = match parent {
        Some(parent) => parent.child(&config.settings, &dir),
        None => EffectiveSettings::root(&config.settings, &dir),
    };

    ancestors.push(config_file.to_path_buf());
    let mut children = Vec::new();
    for (phase_name, phase) in &config.phases {
        match phase {
            PhaseRef::Path(reference) => {
                let mut target = crate::utils::paths::resolve_relative(&dir, &reference.path);
                if target.is_dir() {
                    target = target.join(CONFIG_FILE);
                }
                let target = target.canonicalize().with_context(|| {
                    format!(
                        "phase '{}' points at missing config {}",
                        phase_name,
                        target.display()
                    )
                })?;
                children.push(load_node(&target, Some(phase_name), Some(&effective), ancestors)?);
            }
            PhaseRef::Inline(inner) => {
                let child_effective = effective.child(&inner.settings, &dir);
                let mut child = PhaseNode {
                    name: phase_name.clone(),
                    group: phase_name.clone(),
                    dir: dir.clone(),
                    config_file: config_file.to_path_buf(),
                    config: (**inner).clone(),
                    effective: child_effective.clone(),
                    children: Vec::new(),
                };
                // inline sub-workspaces may nest further inline phases
                let mut grandchildren = Vec::new();
                for (inner_name, inner_phase) in &inner.phases {
                    if let PhaseRef::Path(reference) = inner_phase {
                        let mut target =
                            crate::utils::paths::resolve_relative(&dir, &reference.path);
                        if target.is_dir() {
                            target = target.join(CONFIG_FILE);
                        }
                        let target = target.canonicalize().with_context(|| {
                            format!(
                                "phase '{}' points at missing config {}",
                                inner_name,
                                target.display()
                            )
                        })?;
                        grandchildren.push(load_node(
                            &target,
                            Some(inner_name),
                            Some(&child_effective),
                            ancestors,
                        )?);
                    }
                }
                child.children = grandchildren;
                children.push(child);
            }
        }
    }
    ancestors.pop();

    let mut node = PhaseNode {
        name,
        group,
        dir,
        config_file: config_file.to_path_buf(),
        config,
        effective,
        children,
    };
    // drop the phases mapping from the stored config; the tree already
    // captured it and the snapshot should not duplicate whole subtrees
    node.config.phases.clear();
    Ok(node)
}

/// Load one document, detecting and normalizing the legacy layout.
fn load_document(config_file: &Path) -> Result<UnifiedConfig> {
    let content = std::fs::read_to_string(config_file)
        .with_context(|| format!("failed to read {}", config_file.display()))?;
    let raw: serde_yaml::Value = serde_yaml::from_str(&content)
        .with_context(|| format!("{} is not valid YAML", config_file.display()))?;
    if legacy::is_legacy(&raw) {
        return legacy::load_legacy(config_file);
    }
    model::parse_unified_value(raw).with_context(|| format!("in {}", config_file.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_tree_with_path_phase() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("sbkube.yaml"),
            "apiVersion: sbkube/v1\nsettings:\n  namespace: root-ns\n  cluster: prod\nphases:\n  data:\n    path: a101_data/sbkube.yaml\n",
        );
        write(
            &dir.path().join("a101_data").join("sbkube.yaml"),
            "apiVersion: sbkube/v1\nsettings:\n  namespace: data-ns\napps:\n  pg:\n    type: noop\n",
        );
        let tree = load_workspace(&dir.path().join("sbkube.yaml")).unwrap();
        assert_eq!(tree.children.len(), 1);
        let data = &tree.children[0];
        assert_eq!(data.name, "data");
        assert_eq!(data.group, "a101_data");
        // child namespace overrides, cluster inherits
        assert_eq!(data.effective.merged.namespace.as_deref(), Some("data-ns"));
        assert_eq!(data.effective.merged.cluster.as_deref(), Some("prod"));
    }

    #[test]
    fn test_inline_phase() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("sbkube.yaml"),
            "apiVersion: sbkube/v1\nphases:\n  extras:\n    settings:\n      namespace: extras\n    apps:\n      marker:\n        type: noop\n",
        );
        let tree = load_workspace(&dir.path().join("sbkube.yaml")).unwrap();
        assert_eq!(tree.children.len(), 1);
        let extras = &tree.children[0];
        assert_eq!(extras.group, "extras");
        assert_eq!(extras.effective.merged.namespace.as_deref(), Some("extras"));
        assert_eq!(extras.config.apps.len(), 1);
    }

    #[test]
    fn test_phase_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("sbkube.yaml"),
            "apiVersion: sbkube/v1\nphases:\n  child:\n    path: sub/sbkube.yaml\n",
        );
        write(
            &dir.path().join("sub").join("sbkube.yaml"),
            "apiVersion: sbkube/v1\nphases:\n  back:\n    path: ../sbkube.yaml\n",
        );
        let err = load_workspace(&dir.path().join("sbkube.yaml")).unwrap_err();
        let sb = err.downcast_ref::<SbkubeError>().unwrap();
        assert!(sb.message.contains("cycle"));
    }

    #[test]
    fn test_scope_selection() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("sbkube.yaml"),
            "apiVersion: sbkube/v1\nphases:\n  data:\n    path: a101_data/sbkube.yaml\n",
        );
        write(
            &dir.path().join("a101_data").join("sbkube.yaml"),
            "apiVersion: sbkube/v1\napps:\n  pg:\n    type: noop\n",
        );
        let root = dir.path().canonicalize().unwrap();
        let tree = load_workspace(&root.join("sbkube.yaml")).unwrap();
        let selected = tree.select_scope(&root, Path::new("a101_data")).unwrap();
        assert_eq!(selected.group, "a101_data");
        // unscoped stays at the root
        let whole = tree.select_scope(&root, Path::new("")).unwrap();
        assert_eq!(whole.config_file, tree.config_file);
    }

    #[test]
    fn test_walk_order_parents_first() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("sbkube.yaml"),
            "apiVersion: sbkube/v1\nphases:\n  a:\n    path: a/sbkube.yaml\n  b:\n    path: b/sbkube.yaml\n",
        );
        write(&dir.path().join("a/sbkube.yaml"), "apiVersion: sbkube/v1\n");
        write(&dir.path().join("b/sbkube.yaml"), "apiVersion: sbkube/v1\n");
        let tree = load_workspace(&dir.path().join("sbkube.yaml")).unwrap();
        let groups: Vec<&str> = tree.walk().iter().map(|n| n.group.as_str()).collect();
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1], "a");
        assert_eq!(groups[2], "b");
    }
}
