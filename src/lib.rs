//! Core library for the Stratus stack convergence tool.
//!
//! The crate evaluates a declared compute stack — a security group, an
//! optional SSH key pair, a VM instance, and an optional CPU alarm — into a
//! dependency-ordered plan and reconciles it against a pluggable provider
//! and a persisted state store (validate → build → resolve → apply →
//! project).

pub mod graph;
pub mod inputs;
pub mod lifecycle;
pub mod outputs;
pub mod plan;
pub mod provider;
pub mod reconcile;
pub mod state;
pub mod test_support;

pub use graph::{AttrValue, AttributeMap, GraphError, ResourceGraph, ResourceKind, ResourceNode};
pub use inputs::{
    AccessRule, InputLoadError, StackInputs, StackSnapshot, ValidationError, ValidationErrors,
    VolumeSpec,
};
pub use lifecycle::{LifecyclePolicy, Precondition};
pub use outputs::{StackOutputs, project};
pub use plan::{CycleError, OrderedPlan, PlannedNode, resolve};
pub use provider::{
    CreatedResource, LocalProvider, LocalProviderError, Operation, Provider, ProviderFuture,
    UpdateOutcome,
};
pub use reconcile::{
    ApplyError, NodeAction, NodeError, NodeFailure, PartialFailure, PlannedAction, Reconciler,
    plan_actions,
};
pub use state::{FileStateStore, NodeRecord, StackState, StateStore, StateStoreError};
