//! Dependency resolution
//!
//! Two graphs: the intra-document graph over `depends_on` (topologically
//! ordered, cycles rejected with the full cycle named) and the inter-group
//! graph over `deps` (resolved purely against deployment history, never by
//! re-parsing other workspaces).

use crate::config::model::UnifiedConfig;
use crate::utils::errors::SbkubeError;
use anyhow::Result;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Topological execution order over a document's enabled apps.
///
/// Disabled apps drop out of the order but still satisfy edges pointing at
/// them. Unknown `depends_on` references and cycles are errors.
pub fn topo_order(config: &UnifiedConfig) -> Result<Vec<String>> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for name in config.apps.keys() {
        index.insert(name.as_str(), graph.add_node(name.as_str()));
    }

    let mut problems = Vec::new();
    for (name, app) in &config.apps {
        for dep in &app.common().depends_on {
            match index.get(dep.as_str()) {
                Some(&dep_index) => {
                    // edge dep -> app: dependency completes first
                    graph.add_edge(dep_index, index[name.as_str()], ());
                }
                None => problems.push(format!(
                    "apps.{}.depends_on: '{}' is not an app in this document",
                    name, dep
                )),
            }
        }
    }
    if !problems.is_empty() {
        return Err(SbkubeError::config_validation(&problems).into());
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order
            .into_iter()
            .map(|ix| graph[ix].to_string())
            .filter(|name| config.apps[name].is_enabled())
            .collect()),
        Err(_) => {
            // name every node on a cycle: the first strongly connected
            // component with more than one node (tarjan runs in O(V+E))
            let cycle = tarjan_scc(&graph)
                .into_iter()
                .find(|scc| scc.len() > 1)
                .map(|scc| {
                    let mut names: Vec<String> =
                        scc.iter().map(|&ix| graph[ix].to_string()).collect();
                    names.sort();
                    let first = names[0].clone();
                    names.push(first);
                    names
                })
                .unwrap_or_default();
            Err(SbkubeError::dependency_cycle(&cycle).into())
        }
    }
}

/// An unmet cross-document requirement.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingGroupDep {
    pub app: String,
    pub group: String,
}

/// Check every enabled app's `deps` against deployment history.
///
/// `lookup` answers "which namespace was group X last deployed to,
/// successfully?" — namespaces are auto-discovered from history, never
/// inferred from the current command, so an infra group deployed to `infra`
/// satisfies a reference from an app deploying to `app`.
pub fn check_group_deps<F>(config: &UnifiedConfig, lookup: F) -> Vec<MissingGroupDep>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing = Vec::new();
    for (name, app) in &config.apps {
        if !app.is_enabled() {
            continue;
        }
        for group in &app.common().deps {
            if lookup(group).is_none() {
                missing.push(MissingGroupDep {
                    app: name.clone(),
                    group: group.clone(),
                });
            }
        }
    }
    missing
}
