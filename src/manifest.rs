//! Multi-document manifest handling
//!
//! Deploy, hooks, and rollback all need the same view of a manifest file:
//! the list of Kubernetes objects it contains, each with enough identity to
//! fetch, apply, and snapshot it.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;

/// Identity of one Kubernetes object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl ResourceRef {
    /// The `kind[.group]` argument kubectl expects, e.g. `deployment.apps`
    /// for `apps/v1` Deployments and `configmap` for core/v1 ConfigMaps.
    pub fn kubectl_type(&self) -> String {
        match self.api_version.split_once('/') {
            Some((group, _version)) => format!("{}.{}", self.kind.to_lowercase(), group),
            None => self.kind.to_lowercase(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{} ({})", self.kind, self.name, ns),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Split a YAML stream into its documents and identify each object.
///
/// Empty documents (separator runs, comment-only) are skipped. A document
/// without apiVersion/kind/metadata.name is a validation error; kubectl
/// would reject it anyway, but we want the path in our own report.
pub fn parse_documents(content: &str, default_namespace: Option<&str>) -> Result<Vec<(ResourceRef, serde_yaml::Value)>> {
    let mut objects = Vec::new();
    for (index, raw) in split_documents(content).into_iter().enumerate() {
        let value: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("manifest document #{} is not valid YAML", index + 1))?;
        if value.is_null() {
            continue;
        }
        let api_version = string_at(&value, &["apiVersion"]);
        let kind = string_at(&value, &["kind"]);
        let name = string_at(&value, &["metadata", "name"]);
        let (Some(api_version), Some(kind), Some(name)) = (api_version, kind, name) else {
            bail!(
                "manifest document #{} is missing apiVersion, kind, or metadata.name",
                index + 1
            );
        };
        let namespace = string_at(&value, &["metadata", "namespace"])
            .or_else(|| default_namespace.map(str::to_string));
        objects.push((
            ResourceRef {
                api_version,
                kind,
                name,
                namespace,
            },
            value,
        ));
    }
    Ok(objects)
}

/// Read and parse a manifest file.
pub fn load_file(path: &Path, default_namespace: Option<&str>) -> Result<Vec<(ResourceRef, serde_yaml::Value)>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    parse_documents(&content, default_namespace)
        .with_context(|| format!("in manifest {}", path.display()))
}

/// SHA-256 hex digest of an object's serialized state.
pub fn checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn split_documents(content: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if line.trim_end() == "---" {
            if !current.trim().is_empty() {
                docs.push(std::mem::take(&mut current));
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        docs.push(current);
    }
    docs
}

fn string_at(value: &serde_yaml::Value, path: &[&str]) -> Option<String> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(key)?;
    }
    cursor.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_DOCS: &str = r#"apiVersion: v1
kind: ConfigMap
metadata:
  name: app-config
data:
  key: value
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: web
  namespace: demo
spec:
  replicas: 3
"#;

    #[test]
    fn test_parse_two_documents() {
        let objects = parse_documents(TWO_DOCS, Some("fallback")).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].0.kind, "ConfigMap");
        // no metadata.namespace: falls back to the app namespace
        assert_eq!(objects[0].0.namespace.as_deref(), Some("fallback"));
        // explicit namespace wins
        assert_eq!(objects[1].0.namespace.as_deref(), Some("demo"));
    }

    #[test]
    fn test_kubectl_type() {
        let core = ResourceRef {
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            name: "x".into(),
            namespace: None,
        };
        assert_eq!(core.kubectl_type(), "configmap");
        let grouped = ResourceRef {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            name: "x".into(),
            namespace: None,
        };
        assert_eq!(grouped.kubectl_type(), "deployment.apps");
    }

    #[test]
    fn test_skip_empty_documents() {
        let content = "---\n# just a comment\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: demo\n";
        let objects = parse_documents(content, None).unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].0.kind, "Namespace");
    }

    #[test]
    fn test_missing_identity_is_error() {
        let content = "apiVersion: v1\nkind: ConfigMap\ndata:\n  a: b\n";
        assert!(parse_documents(content, None).is_err());
    }

    #[test]
    fn test_checksum_stability() {
        let a = checksum("content");
        let b = checksum("content");
        let c = checksum("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
