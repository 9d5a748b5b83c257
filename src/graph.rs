//! Resource graph construction from a validated snapshot.
//!
//! The graph materialises one node per managed resource with an explicit
//! presence flag, an attribute map whose values are either literals or typed
//! references into other nodes, and the dependency hints the resolver needs.
//! References into absent nodes are refused here, before any provider call.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::inputs::StackSnapshot;
use crate::lifecycle::{LifecyclePolicy, policy_for};

/// Attribute payload for a single resource, keyed by attribute name.
pub type AttributeMap = BTreeMap<String, Value>;

/// The closed set of resource kinds managed by a stack.
///
/// Variant order is the fixed declaration order used to break ties in the
/// evaluation plan, so the derived `Ord` is meaningful.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Network security group guarding the instance.
    SecurityGroup,
    /// SSH key pair, managed only when `create_key_pair` is set.
    KeyPair,
    /// The virtual machine instance.
    Instance,
    /// CPU utilisation alarm, managed only when `create_cpu_alarm` is set.
    Alarm,
}

impl ResourceKind {
    /// Fixed declaration order used for deterministic tie-breaking.
    pub const DECLARATION_ORDER: [Self; 4] =
        [Self::SecurityGroup, Self::KeyPair, Self::Instance, Self::Alarm];

    /// Stable identifier used in state files and messages.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SecurityGroup => "security_group",
            Self::KeyPair => "key_pair",
            Self::Instance => "instance",
            Self::Alarm => "alarm",
        }
    }

    /// Derives this node's resource name from the stack name.
    #[must_use]
    pub fn resource_name(self, stack_name: &str) -> String {
        match self {
            Self::SecurityGroup => format!("{stack_name}-sg"),
            Self::KeyPair => format!("{stack_name}-key"),
            Self::Instance => stack_name.to_owned(),
            Self::Alarm => format!("{stack_name}-cpu-high"),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attribute value: either a literal known at build time, or a reference
/// to another node's post-creation state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttrValue {
    /// Value fixed by the configuration snapshot.
    Literal(Value),
    /// Value produced by another node once it has been applied.
    Reference {
        /// Node the value is read from.
        kind: ResourceKind,
        /// Attribute name on the referenced node.
        attribute: String,
    },
}

impl AttrValue {
    /// Builds a reference to another node's attribute.
    #[must_use]
    pub fn reference(kind: ResourceKind, attribute: impl Into<String>) -> Self {
        Self::Reference {
            kind,
            attribute: attribute.into(),
        }
    }

    /// Returns the referenced node kind, when this value is a reference.
    #[must_use]
    pub const fn referenced_kind(&self) -> Option<ResourceKind> {
        match self {
            Self::Literal(_) => None,
            Self::Reference { kind, .. } => Some(*kind),
        }
    }
}

/// One managed resource in the graph.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceNode {
    /// Which resource this node manages.
    pub kind: ResourceKind,
    /// Whether the node is materialised this run.
    pub present: bool,
    /// Desired attributes, literal or reference valued.
    pub attributes: BTreeMap<String, AttrValue>,
    /// Explicit ordering hints in addition to reference-implied edges.
    pub depends_on: Vec<ResourceKind>,
    /// Lifecycle policy governing reconciliation of this node.
    pub lifecycle: LifecyclePolicy,
}

impl ResourceNode {
    /// All dependencies of this node: explicit hints plus every reference.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<ResourceKind> {
        let mut deps: BTreeSet<ResourceKind> = self.depends_on.iter().copied().collect();
        deps.extend(
            self.attributes
                .values()
                .filter_map(AttrValue::referenced_kind),
        );
        deps
    }
}

/// Errors raised while constructing or checking a resource graph.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum GraphError {
    /// A present node references a node that is absent this run.
    #[error("node {from} references absent node {to} via attribute '{attribute}'")]
    DanglingReference {
        /// Node holding the reference.
        from: ResourceKind,
        /// Absent node being referenced.
        to: ResourceKind,
        /// Attribute on `from` that holds the reference.
        attribute: String,
    },
    /// The same kind appears more than once in the node set.
    #[error("duplicate node for kind {kind}")]
    DuplicateNode {
        /// Kind declared twice.
        kind: ResourceKind,
    },
    /// An attribute payload could not be serialised.
    #[error("failed to build attribute '{attribute}' for node {node}: {message}")]
    Attribute {
        /// Node whose attribute failed to serialise.
        node: ResourceKind,
        /// Attribute name.
        attribute: String,
        /// Serialiser error message.
        message: String,
    },
}

/// The full node set for one evaluation run, in declaration order.
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
}

impl ResourceGraph {
    /// Assembles a graph from explicit nodes, refusing duplicates and
    /// references from present nodes into absent ones.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateNode`] or
    /// [`GraphError::DanglingReference`] when the node set is structurally
    /// invalid.
    pub fn from_nodes(nodes: Vec<ResourceNode>) -> Result<Self, GraphError> {
        let mut seen = BTreeSet::new();
        for node in &nodes {
            if !seen.insert(node.kind) {
                return Err(GraphError::DuplicateNode { kind: node.kind });
            }
        }

        let graph = Self { nodes };
        graph.check_references()?;
        Ok(graph)
    }

    /// Builds the graph for the fixed stack shape from a validated snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError`] when a reference targets an absent node or an
    /// attribute payload cannot be serialised.
    pub fn build(snapshot: &StackSnapshot) -> Result<Self, GraphError> {
        let nodes = vec![
            security_group_node(snapshot),
            key_pair_node(snapshot),
            instance_node(snapshot)?,
            alarm_node(snapshot),
        ];
        Self::from_nodes(nodes)
    }

    /// Returns the node of the given kind, if it is part of the graph.
    #[must_use]
    pub fn node(&self, kind: ResourceKind) -> Option<&ResourceNode> {
        self.nodes.iter().find(|node| node.kind == kind)
    }

    /// All nodes in declaration order, absent ones included.
    #[must_use]
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    /// Nodes whose presence predicate held this run, in declaration order.
    pub fn present_nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter().filter(|node| node.present)
    }

    /// True when a present node of the given kind exists.
    #[must_use]
    pub fn is_present(&self, kind: ResourceKind) -> bool {
        self.node(kind).is_some_and(|node| node.present)
    }

    fn check_references(&self) -> Result<(), GraphError> {
        for node in self.present_nodes() {
            for (name, value) in &node.attributes {
                if let AttrValue::Reference { kind, .. } = value
                    && !self.is_present(*kind)
                {
                    return Err(GraphError::DanglingReference {
                        from: node.kind,
                        to: *kind,
                        attribute: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Merges global tags with the per-node `Name` tag.
///
/// Global tags are applied first; the computed `Name` wins on collision.
#[must_use]
pub fn merged_tags(
    global: &BTreeMap<String, String>,
    resource_name: &str,
) -> BTreeMap<String, String> {
    let mut tags = global.clone();
    tags.insert(String::from("Name"), resource_name.to_owned());
    tags
}

fn tags_value(snapshot: &StackSnapshot, kind: ResourceKind) -> Value {
    let name = kind.resource_name(&snapshot.inputs().name);
    json!(merged_tags(&snapshot.inputs().tags, &name))
}

fn security_group_node(snapshot: &StackSnapshot) -> ResourceNode {
    let inputs = snapshot.inputs();
    let kind = ResourceKind::SecurityGroup;
    let mut attributes = BTreeMap::new();
    attributes.insert(
        String::from("name"),
        AttrValue::Literal(json!(kind.resource_name(&inputs.name))),
    );
    attributes.insert(
        String::from("description"),
        AttrValue::Literal(json!(format!("Managed security group for {}", inputs.name))),
    );
    attributes.insert(
        String::from("ingress"),
        AttrValue::Literal(json!(inputs.ingress_rules)),
    );
    attributes.insert(
        String::from("egress"),
        AttrValue::Literal(json!(inputs.egress_rules)),
    );
    attributes.insert(String::from("tags"), AttrValue::Literal(tags_value(snapshot, kind)));

    ResourceNode {
        kind,
        present: true,
        attributes,
        depends_on: Vec::new(),
        lifecycle: policy_for(kind, snapshot),
    }
}

fn key_pair_node(snapshot: &StackSnapshot) -> ResourceNode {
    let inputs = snapshot.inputs();
    let kind = ResourceKind::KeyPair;
    let mut attributes = BTreeMap::new();
    attributes.insert(
        String::from("key_name"),
        AttrValue::Literal(json!(kind.resource_name(&inputs.name))),
    );
    attributes.insert(
        String::from("public_key"),
        AttrValue::Literal(json!(inputs.ssh_public_key)),
    );
    attributes.insert(String::from("tags"), AttrValue::Literal(tags_value(snapshot, kind)));

    ResourceNode {
        kind,
        present: inputs.create_key_pair,
        attributes,
        depends_on: Vec::new(),
        lifecycle: policy_for(kind, snapshot),
    }
}

fn instance_node(snapshot: &StackSnapshot) -> Result<ResourceNode, GraphError> {
    let inputs = snapshot.inputs();
    let kind = ResourceKind::Instance;
    let mut attributes = BTreeMap::new();
    attributes.insert(String::from("image_id"), AttrValue::Literal(json!(inputs.image_id)));
    attributes.insert(
        String::from("instance_type"),
        AttrValue::Literal(json!(inputs.instance_type)),
    );
    attributes.insert(
        String::from("subnet_id"),
        AttrValue::Literal(json!(inputs.subnet_id)),
    );
    attributes.insert(
        String::from("associate_public_ip"),
        AttrValue::Literal(json!(inputs.associate_public_ip)),
    );
    attributes.insert(
        String::from("monitoring"),
        AttrValue::Literal(json!(inputs.enable_monitoring)),
    );
    attributes.insert(
        String::from("user_data"),
        AttrValue::Literal(json!(inputs.user_data)),
    );
    attributes.insert(
        String::from("metadata_hop_limit"),
        AttrValue::Literal(json!(inputs.metadata_hop_limit)),
    );
    attributes.insert(
        String::from("root_volume"),
        AttrValue::Literal(json!({
            "volume_type": inputs.root_volume_type,
            "volume_size": inputs.root_volume_size,
        })),
    );
    let volumes =
        serde_json::to_value(&inputs.additional_volumes).map_err(|err| GraphError::Attribute {
            node: kind,
            attribute: String::from("additional_volumes"),
            message: err.to_string(),
        })?;
    attributes.insert(String::from("additional_volumes"), AttrValue::Literal(volumes));
    attributes.insert(
        String::from("security_group_id"),
        AttrValue::reference(ResourceKind::SecurityGroup, "id"),
    );
    let key_name = if inputs.create_key_pair {
        AttrValue::reference(ResourceKind::KeyPair, "key_name")
    } else {
        AttrValue::Literal(json!(inputs.key_name))
    };
    attributes.insert(String::from("key_name"), key_name);
    attributes.insert(String::from("tags"), AttrValue::Literal(tags_value(snapshot, kind)));

    Ok(ResourceNode {
        kind,
        present: true,
        attributes,
        depends_on: Vec::new(),
        lifecycle: policy_for(kind, snapshot),
    })
}

fn alarm_node(snapshot: &StackSnapshot) -> ResourceNode {
    let inputs = snapshot.inputs();
    let kind = ResourceKind::Alarm;
    let mut attributes = BTreeMap::new();
    attributes.insert(
        String::from("alarm_name"),
        AttrValue::Literal(json!(kind.resource_name(&inputs.name))),
    );
    attributes.insert(String::from("metric"), AttrValue::Literal(json!("cpu_utilization")));
    attributes.insert(
        String::from("comparison"),
        AttrValue::Literal(json!("greater_than_or_equal")),
    );
    attributes.insert(
        String::from("threshold"),
        AttrValue::Literal(json!(inputs.alarm_cpu_threshold)),
    );
    attributes.insert(String::from("period"), AttrValue::Literal(json!(inputs.alarm_period)));
    attributes.insert(
        String::from("evaluation_periods"),
        AttrValue::Literal(json!(inputs.alarm_evaluation_periods)),
    );
    attributes.insert(
        String::from("instance_id"),
        AttrValue::reference(ResourceKind::Instance, "id"),
    );
    attributes.insert(String::from("tags"), AttrValue::Literal(tags_value(snapshot, kind)));

    ResourceNode {
        kind,
        present: inputs.create_cpu_alarm,
        attributes,
        // Alarm orders after the instance even where every attribute it
        // reads happens to be literal.
        depends_on: vec![ResourceKind::Instance],
        lifecycle: policy_for(kind, snapshot),
    }
}
