//! `sbkube workspace` — multi-phase operations: graph, validate, status
//!
//! `workspace deploy` survives as a deprecated alias of `apply`.

use crate::commands::pipeline::{resolve_invocation, TargetArgs};
use crate::config::phases::PhaseNode;
use crate::state::StateStore;
use crate::utils::output::{emit, OutputFormat};
use anyhow::Result;
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use serde::Serialize;
use std::collections::HashMap;

/// `workspace graph` — print the phase tree and app dependency edges.
pub fn graph(args: &TargetArgs, dot: bool) -> Result<i32> {
    let invocation = resolve_invocation(args)?;
    let scope = invocation.scope();

    if dot {
        let mut graph: DiGraph<String, &str> = DiGraph::new();
        let mut index = HashMap::new();
        for node in scope.walk() {
            for app_name in node.config.apps.keys() {
                let label = format!("{}/{}", node.group, app_name);
                index.insert(label.clone(), graph.add_node(label));
            }
        }
        for node in scope.walk() {
            for (app_name, app) in &node.config.apps {
                let from = format!("{}/{}", node.group, app_name);
                for dep in &app.common().depends_on {
                    let to = format!("{}/{}", node.group, dep);
                    if let (Some(&a), Some(&b)) = (index.get(&from), index.get(&to)) {
                        graph.add_edge(b, a, "depends_on");
                    }
                }
            }
        }
        println!("{:?}", Dot::with_config(&graph, &[Config::EdgeNoLabel]));
        return Ok(0);
    }

    print_tree(scope, 0);
    Ok(0)
}

fn print_tree(node: &PhaseNode, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{}{} ({})", indent, node.name, node.group);
    for (app_name, app) in &node.config.apps {
        let common = app.common();
        let mut annotations = Vec::new();
        if !common.depends_on.is_empty() {
            annotations.push(format!("depends_on: {}", common.depends_on.join(", ")));
        }
        if !common.deps.is_empty() {
            annotations.push(format!("deps: {}", common.deps.join(", ")));
        }
        if !common.enabled {
            annotations.push("disabled".to_string());
        }
        if annotations.is_empty() {
            println!("{}  - {} [{}]", indent, app_name, app.type_name());
        } else {
            println!(
                "{}  - {} [{}] ({})",
                indent,
                app_name,
                app.type_name(),
                annotations.join("; ")
            );
        }
    }
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

/// `workspace validate` — the full-tree validation pass.
pub fn validate(args: &TargetArgs, format: OutputFormat) -> Result<i32> {
    crate::commands::validate::run(args, true, false, format)
}

#[derive(Serialize)]
struct GroupStatus {
    group: String,
    apps: usize,
    /// Namespace of the last successful deployment, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_status: Option<crate::state::DeploymentStatus>,
}

/// `workspace status` — last deployment per app group in the tree.
pub fn status(args: &TargetArgs, format: OutputFormat) -> Result<i32> {
    let invocation = resolve_invocation(args)?;
    let scope = invocation.scope();
    let store = StateStore::open_default()?;

    let mut rows = Vec::new();
    for node in scope.walk() {
        let enabled = node
            .config
            .apps
            .values()
            .filter(|app| app.is_enabled())
            .count();
        // any successful deployment of this group, any namespace
        let last = store.latest_success_namespace_for_group(&node.group)?;
        let (namespace, last_status) = match last {
            Some(namespace) => (
                Some(namespace),
                Some(crate::state::DeploymentStatus::Success),
            ),
            None => (None, None),
        };
        rows.push(GroupStatus {
            group: node.group.clone(),
            apps: enabled,
            namespace,
            last_status,
        });
    }

    emit(format, &rows, || {
        println!("{:<24} {:>5}  {:<12} {}", "GROUP", "APPS", "STATUS", "NAMESPACE");
        for row in &rows {
            println!(
                "{:<24} {:>5}  {:<12} {}",
                row.group,
                row.apps,
                row.last_status
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "never".to_string()),
                row.namespace.as_deref().unwrap_or("-")
            );
        }
        Ok(())
    })?;
    Ok(0)
}
