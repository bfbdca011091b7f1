//! Manifest dependency resolution.
//!
//! Runs once per manifest load. Detects circular dependencies between flows
//! and between nodes within a flow, and validates that every explicit
//! `depends_on` edge and every implicit reference-induced edge points at a
//! node that actually exists. Implicit edges derive from property
//! references: a property referencing `first.response:value` makes its node
//! depend on `first`.

use super::{ERROR_RESOURCE, FlowManager, INPUT_RESOURCE, Manifest, Node};
use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

/// Manifest-time resolution failures, fatal at load.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("circular dependency detected: {first} <-> {second}")]
    CircularDependency { first: String, second: String },

    #[error("unknown reference: {from} -> {to}")]
    UnknownReference { from: String, to: String },

    #[error("duplicate definition: {name}")]
    DuplicateDefinition { name: String },
}

/// Resolves all dependencies inside the given manifest.
pub fn resolve_manifest(manifest: &Manifest) -> Result<(), ResolveError> {
    tracing::info!("resolving manifest dependencies");

    let managers = manifest
        .flows
        .iter()
        .map(|flow| flow as &dyn FlowManager)
        .chain(manifest.proxy.iter().map(|proxy| proxy as &dyn FlowManager));

    for manager in managers {
        resolve_flow_manager_dependencies(manifest, manager, &mut HashSet::new())?;

        for node in manager.nodes() {
            resolve_call_dependencies(manager, node, &mut HashSet::new())?;
        }
    }

    Ok(())
}

/// Resolves the inter-flow dependencies of a flow manager and attempts to
/// detect any circular dependency among them.
pub fn resolve_flow_manager_dependencies(
    manifest: &Manifest,
    manager: &dyn FlowManager,
    unresolved: &mut HashSet<String>,
) -> Result<(), ResolveError> {
    unresolved.insert(manager.name().to_string());

    for edge in manager.dependencies() {
        if unresolved.contains(edge) {
            return Err(ResolveError::CircularDependency {
                first: manager.name().to_string(),
                second: edge.clone(),
            });
        }

        let Some(flow) = manifest.flows.iter().find(|flow| &flow.name == edge) else {
            return Err(ResolveError::UnknownReference {
                from: manager.name().to_string(),
                to: edge.clone(),
            });
        };

        resolve_flow_manager_dependencies(manifest, flow, unresolved)?;
    }

    unresolved.remove(manager.name());
    Ok(())
}

/// Resolves the dependencies of a single node and attempts to detect any
/// circular dependency within its flow.
pub fn resolve_call_dependencies(
    manager: &dyn FlowManager,
    node: &Node,
    unresolved: &mut HashSet<String>,
) -> Result<(), ResolveError> {
    unresolved.insert(node.name.clone());

    for edge in node_dependencies(manager, node)? {
        if unresolved.contains(&edge) {
            return Err(ResolveError::CircularDependency {
                first: format!("{}.{}", manager.name(), node.name),
                second: format!("{}.{}", manager.name(), edge),
            });
        }

        // node_dependencies already rejected edges to unknown nodes
        let Some(next) = manager.nodes().iter().find(|node| node.name == edge) else {
            continue;
        };

        resolve_call_dependencies(manager, next, unresolved)?;
    }

    unresolved.remove(&node.name);
    Ok(())
}

/// Returns the effective dependency set of a node: the union of its explicit
/// `depends_on` edges and the edges implied by its property references.
/// Iteration order is made deterministic so scheduling never depends on map
/// ordering.
pub fn node_dependencies(
    manager: &dyn FlowManager,
    node: &Node,
) -> Result<BTreeSet<String>, ResolveError> {
    let mut result = BTreeSet::new();

    for edge in &node.depends_on {
        if !has_node(manager, edge) {
            return Err(ResolveError::UnknownReference {
                from: format!("{}.{}", manager.name(), node.name),
                to: edge.clone(),
            });
        }

        result.insert(edge.clone());
    }

    for reference in node.references() {
        let Some(owner) = resource_owner(&reference.resource) else {
            continue;
        };

        if owner == node.name {
            continue;
        }

        if !has_node(manager, owner) {
            return Err(ResolveError::UnknownReference {
                from: format!("{}.{}", manager.name(), node.name),
                to: reference.to_string(),
            });
        }

        result.insert(owner.to_string());
    }

    Ok(result)
}

/// Extracts the node name owning a reference resource, if any. Resources
/// such as `input` and `error` are reserved and never resolve to a node.
pub fn resource_owner(resource: &str) -> Option<&str> {
    let owner = resource
        .strip_suffix(".request")
        .or_else(|| resource.strip_suffix(".response"))
        .or_else(|| resource.strip_suffix(".header"))
        .unwrap_or(resource);

    match owner {
        INPUT_RESOURCE | ERROR_RESOURCE | "" => None,
        owner => Some(owner),
    }
}

fn has_node(manager: &dyn FlowManager, name: &str) -> bool {
    manager.nodes().iter().any(|node| node.name == name)
}
