//! Reference resolution and plan ordering.
//!
//! Turns a resource graph into an ordered plan: dependency edges come from
//! attribute references plus explicit hints, ordering is a topological sort
//! with a fixed declaration-order tie-break so plans stay deterministic and
//! diff-friendly across runs, and optional sub-record fields are defaulted
//! into the planned attribute maps.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Value, json};
use thiserror::Error;

use crate::graph::{AttrValue, ResourceGraph, ResourceKind, ResourceNode};
use crate::lifecycle::LifecyclePolicy;

/// A node scheduled for reconciliation, with resolved attribute defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct PlannedNode {
    /// Which resource this step reconciles.
    pub kind: ResourceKind,
    /// Desired attributes with sub-record defaults applied.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Present nodes this step must run after.
    pub dependencies: BTreeSet<ResourceKind>,
    /// Lifecycle policy carried over from the graph node.
    pub lifecycle: LifecyclePolicy,
}

/// Topologically ordered plan over the present nodes of a graph.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderedPlan {
    nodes: Vec<PlannedNode>,
}

impl OrderedPlan {
    /// Planned nodes in execution order.
    #[must_use]
    pub fn nodes(&self) -> &[PlannedNode] {
        &self.nodes
    }

    /// Returns the planned node of the given kind, if present this run.
    #[must_use]
    pub fn node(&self, kind: ResourceKind) -> Option<&PlannedNode> {
        self.nodes.iter().find(|node| node.kind == kind)
    }

    /// True when the plan materialises the given kind.
    #[must_use]
    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.node(kind).is_some()
    }

    /// Node kinds in execution order.
    #[must_use]
    pub fn kinds(&self) -> Vec<ResourceKind> {
        self.nodes.iter().map(|node| node.kind).collect()
    }

    /// Present kinds that depend, directly or transitively, on `kind`.
    #[must_use]
    pub fn dependents_of(&self, kind: ResourceKind) -> BTreeSet<ResourceKind> {
        let mut dependents = BTreeSet::new();
        // Plan order guarantees dependencies precede dependents, so a single
        // forward pass closes the transitive set.
        for node in &self.nodes {
            if node.dependencies.contains(&kind)
                || node.dependencies.iter().any(|dep| dependents.contains(dep))
            {
                dependents.insert(node.kind);
            }
        }
        dependents.remove(&kind);
        dependents
    }
}

/// The dependency graph is not acyclic.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
#[error("dependency cycle between nodes: {}", render_kinds(.nodes))]
pub struct CycleError {
    /// Nodes participating in (or downstream of) the cycle, in declaration
    /// order.
    pub nodes: Vec<ResourceKind>,
}

fn render_kinds(kinds: &[ResourceKind]) -> String {
    kinds
        .iter()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Resolves a graph into an ordered plan.
///
/// Ties between nodes with no relative ordering constraint are broken by the
/// fixed declaration order ([`ResourceKind::DECLARATION_ORDER`]).
///
/// # Errors
///
/// Returns [`CycleError`] when the dependency edges do not form a DAG.
pub fn resolve(graph: &ResourceGraph) -> Result<OrderedPlan, CycleError> {
    let present: BTreeSet<ResourceKind> =
        graph.present_nodes().map(|node| node.kind).collect();

    let mut pending: BTreeMap<ResourceKind, BTreeSet<ResourceKind>> = graph
        .present_nodes()
        .map(|node| {
            let deps: BTreeSet<ResourceKind> = node
                .dependencies()
                .into_iter()
                .filter(|dep| present.contains(dep))
                .collect();
            (node.kind, deps)
        })
        .collect();

    let mut order = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        // BTreeMap iteration yields kinds in declaration order, so the first
        // unblocked node is always the deterministic choice.
        let next = pending
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .map(|(kind, _)| *kind);
        let Some(kind) = next else {
            return Err(CycleError {
                nodes: pending.keys().copied().collect(),
            });
        };
        pending.remove(&kind);
        for deps in pending.values_mut() {
            deps.remove(&kind);
        }
        order.push(kind);
    }

    let nodes = order
        .into_iter()
        .filter_map(|kind| graph.node(kind))
        .map(planned_node)
        .collect();
    Ok(OrderedPlan { nodes })
}

fn planned_node(node: &ResourceNode) -> PlannedNode {
    let mut attributes = node.attributes.clone();
    if node.kind == ResourceKind::Instance
        && let Some(AttrValue::Literal(volumes)) = attributes.get_mut("additional_volumes")
    {
        *volumes = normalised_volumes(volumes);
    }

    PlannedNode {
        kind: node.kind,
        attributes,
        dependencies: node.dependencies(),
        lifecycle: node.lifecycle.clone(),
    }
}

/// Applies sub-record defaults to the additional-volume list: an unset
/// `delete_on_termination` resolves to `true`; unset `iops` and `throughput`
/// stay unset rather than serialising as nulls.
fn normalised_volumes(volumes: &Value) -> Value {
    let Some(entries) = volumes.as_array() else {
        return volumes.clone();
    };

    let resolved: Vec<Value> = entries
        .iter()
        .map(|entry| {
            let Some(fields) = entry.as_object() else {
                return entry.clone();
            };
            let mut out = fields.clone();
            if out.get("delete_on_termination").is_none_or(Value::is_null) {
                out.insert(String::from("delete_on_termination"), json!(true));
            }
            for optional in ["iops", "throughput"] {
                if out.get(optional).is_some_and(Value::is_null) {
                    out.remove(optional);
                }
            }
            Value::Object(out)
        })
        .collect();
    Value::Array(resolved)
}
