//! Reconciliation of an ordered plan against a provider and state store.
//!
//! The reconciler loads state once, destroys nodes the plan no longer
//! materialises (in reverse order), then walks the plan in order: checking
//! preconditions, resolving references against freshly-applied attributes,
//! diffing against the last applied record minus the ignore-changes set, and
//! creating, updating, or replacing as required. State is saved after every
//! successful node action, so an interrupted run persists exactly the subset
//! that changed. A failed node halts its dependents but never rolls back
//! nodes already applied; the updated state travels inside the failure so a
//! retry only reattempts the remainder.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;

use crate::graph::{AttrValue, AttributeMap, ResourceGraph, ResourceKind};
use crate::plan::{OrderedPlan, PlannedNode};
use crate::provider::{Operation, Provider, ProviderFuture, UpdateOutcome};
use crate::state::{NodeRecord, StackState, StateStore, StateStoreError};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Action the reconciler plans or performs for one node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeAction {
    /// The node will be created.
    Create,
    /// The node drifted and will be updated (or replaced, should the
    /// provider require it).
    Update,
    /// The node will be replaced.
    Replace,
    /// The node will be destroyed.
    Destroy,
    /// The node is already converged; no provider call will be made.
    NoOp,
}

impl NodeAction {
    /// Lower-case action name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of a plan preview.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlannedAction {
    /// Node the action applies to.
    pub kind: ResourceKind,
    /// Action the reconciler would take.
    pub action: NodeAction,
}

/// Failure affecting a single node during a run.
#[derive(Debug, Error)]
pub enum NodeError<E>
where
    E: std::error::Error + 'static,
{
    /// An apply-time precondition did not hold.
    #[error("precondition failed: {condition}")]
    Precondition {
        /// The violated condition.
        condition: String,
    },
    /// The provider rejected an operation.
    #[error("{operation} failed: {source}")]
    Provider {
        /// Operation that failed.
        operation: Operation,
        /// Provider error.
        #[source]
        source: E,
    },
    /// A provider call exceeded the configured timeout.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation that timed out.
        operation: Operation,
        /// Configured timeout in seconds.
        seconds: u64,
    },
    /// A reference failed to resolve even though its target applied.
    #[error("reference to {kind}.{attribute} did not resolve")]
    UnresolvedReference {
        /// Referenced node.
        kind: ResourceKind,
        /// Referenced attribute.
        attribute: String,
    },
    /// A node this one depends on failed earlier in the run.
    #[error("dependency {dependency} failed earlier in the run")]
    DependencyFailed {
        /// The failed dependency.
        dependency: ResourceKind,
    },
    /// A dependent that must be destroyed first is still recorded.
    #[error("dependent {dependent} could not be destroyed first")]
    DependentStillRecorded {
        /// The dependent still holding a record.
        dependent: ResourceKind,
    },
    /// The predecessor of a replaced resource was kept because a dependent
    /// failed to repoint to the successor.
    #[error("replaced resource {id} retained; a dependent failed to repoint")]
    ReplacedResourceRetained {
        /// Identifier of the retained predecessor.
        id: String,
    },
}

/// A node paired with the failure that stopped it.
#[derive(Debug)]
pub struct NodeFailure<E>
where
    E: std::error::Error + 'static,
{
    /// Node that failed.
    pub kind: ResourceKind,
    /// What went wrong.
    pub error: NodeError<E>,
}

impl<E> fmt::Display for NodeFailure<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {}: {}", self.kind, self.error)
    }
}

/// A run that stopped after some nodes succeeded.
///
/// Carries the successfully-updated state so callers can persist progress
/// and retry only the remainder.
#[derive(Debug)]
pub struct PartialFailure<E>
where
    E: std::error::Error + 'static,
{
    /// State reflecting every node action that succeeded this run.
    pub state: StackState,
    /// Per-node failures, in the order they occurred.
    pub failures: Vec<NodeFailure<E>>,
}

impl<E> fmt::Display for PartialFailure<E>
where
    E: std::error::Error + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run failed for {} node(s): ", self.failures.len())?;
        let mut first = true;
        for failure in &self.failures {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl<E> std::error::Error for PartialFailure<E> where E: std::error::Error + 'static {}

/// Errors surfaced by a reconciliation run.
#[derive(Debug, Error)]
pub enum ApplyError<E>
where
    E: std::error::Error + 'static,
{
    /// The state store failed; the run aborted at the last saved point.
    #[error(transparent)]
    State(#[from] StateStoreError),
    /// Some nodes failed; the updated state travels with the error.
    #[error(transparent)]
    Partial(#[from] PartialFailure<E>),
}

enum StepError<E>
where
    E: std::error::Error + 'static,
{
    Node(NodeError<E>),
    Store(StateStoreError),
}

/// Drives plans to convergence against a provider and state store.
#[derive(Debug)]
pub struct Reconciler<P, S> {
    provider: P,
    store: S,
    call_timeout: Duration,
}

impl<P, S> Reconciler<P, S>
where
    P: Provider,
    S: StateStore,
{
    /// Creates a reconciler with the default provider-call timeout.
    #[must_use]
    pub const fn new(provider: P, store: S) -> Self {
        Self {
            provider,
            store,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Overrides the per-call timeout.
    ///
    /// This is primarily used by tests to keep timeout scenarios fast.
    #[must_use]
    pub const fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Converges every planned node, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::State`] when the state store fails, or
    /// [`ApplyError::Partial`] when one or more nodes could not be
    /// converged. Already-applied nodes are never rolled back.
    pub async fn apply(&self, plan: &OrderedPlan) -> Result<StackState, ApplyError<P::Error>> {
        let mut state = self.store.load()?;
        let mut failures: Vec<NodeFailure<P::Error>> = Vec::new();

        self.destroy_orphans(plan, &mut state, &mut failures).await?;

        let mut failed: BTreeSet<ResourceKind> = BTreeSet::new();
        let mut deferred: Vec<(ResourceKind, String)> = Vec::new();
        for node in plan.nodes() {
            if let Some(error) = self
                .converge_node(node, &mut state, &mut deferred, &failed)
                .await?
            {
                failed.insert(node.kind);
                failures.push(NodeFailure {
                    kind: node.kind,
                    error,
                });
            }
        }

        self.destroy_deferred(plan, deferred, &failed, &mut failures)
            .await;

        if failures.is_empty() {
            Ok(state)
        } else {
            Err(ApplyError::Partial(PartialFailure { state, failures }))
        }
    }

    /// Destroys every recorded node, dependents first.
    ///
    /// `describe` is consulted before each destroy so resources that already
    /// disappeared are tolerated and simply dropped from state.
    ///
    /// # Errors
    ///
    /// Returns [`ApplyError::State`] when the state store fails, or
    /// [`ApplyError::Partial`] listing the nodes that could not be
    /// destroyed (including those blocked by a surviving dependent).
    pub async fn teardown(
        &self,
        graph: &ResourceGraph,
    ) -> Result<StackState, ApplyError<P::Error>> {
        let mut state = self.store.load()?;
        let mut failures: Vec<NodeFailure<P::Error>> = Vec::new();

        for kind in state.kinds_reversed() {
            let blocking = graph
                .nodes()
                .iter()
                .find(|node| node.dependencies().contains(&kind) && state.record(node.kind).is_some())
                .map(|node| node.kind);
            if let Some(dependent) = blocking {
                failures.push(NodeFailure {
                    kind,
                    error: NodeError::DependentStillRecorded { dependent },
                });
                continue;
            }

            let Some(record) = state.record(kind).cloned() else {
                continue;
            };
            match self.destroy_existing(kind, &record).await {
                Ok(()) => {
                    state.remove(kind);
                    self.store.save(&state)?;
                }
                Err(error) => failures.push(NodeFailure { kind, error }),
            }
        }

        if failures.is_empty() {
            Ok(state)
        } else {
            Err(ApplyError::Partial(PartialFailure { state, failures }))
        }
    }

    async fn destroy_orphans(
        &self,
        plan: &OrderedPlan,
        state: &mut StackState,
        failures: &mut Vec<NodeFailure<P::Error>>,
    ) -> Result<(), ApplyError<P::Error>> {
        for kind in state.kinds_reversed() {
            if plan.contains(kind) {
                continue;
            }
            let Some(record) = state.record(kind).cloned() else {
                continue;
            };
            match self.destroy_existing(kind, &record).await {
                Ok(()) => {
                    state.remove(kind);
                    self.store.save(state)?;
                }
                Err(error) => failures.push(NodeFailure { kind, error }),
            }
        }
        Ok(())
    }

    /// Converges one node; returns the node's failure, if any.
    async fn converge_node(
        &self,
        node: &PlannedNode,
        state: &mut StackState,
        deferred: &mut Vec<(ResourceKind, String)>,
        failed: &BTreeSet<ResourceKind>,
    ) -> Result<Option<NodeError<P::Error>>, ApplyError<P::Error>> {
        if let Some(dependency) = node.dependencies.iter().find(|dep| failed.contains(dep)) {
            return Ok(Some(NodeError::DependencyFailed {
                dependency: *dependency,
            }));
        }
        if let Some(pre) = node.lifecycle.violated_precondition() {
            return Ok(Some(NodeError::Precondition {
                condition: pre.condition.clone(),
            }));
        }
        let desired = match resolve_attributes(node, state) {
            Ok(map) => map,
            Err(error) => return Ok(Some(error)),
        };

        match self.converge_resolved(node, &desired, state, deferred).await {
            Ok(()) => Ok(None),
            Err(StepError::Node(error)) => Ok(Some(error)),
            Err(StepError::Store(error)) => Err(ApplyError::State(error)),
        }
    }

    async fn converge_resolved(
        &self,
        node: &PlannedNode,
        desired: &AttributeMap,
        state: &mut StackState,
        deferred: &mut Vec<(ResourceKind, String)>,
    ) -> Result<(), StepError<P::Error>> {
        let Some(record) = state.record(node.kind).cloned() else {
            return self.create_node(node.kind, desired, state).await;
        };

        let changes =
            changed_attributes(desired, &record.attributes, &node.lifecycle.ignore_changes);
        if changes.is_empty() {
            return Ok(());
        }

        let outcome = self
            .bounded(
                Operation::Update,
                self.provider.update(node.kind, &record.id, desired),
            )
            .await
            .map_err(StepError::Node)?;
        match outcome {
            UpdateOutcome::Applied(observed) => {
                state.insert(
                    node.kind,
                    NodeRecord {
                        id: record.id,
                        attributes: merge_attributes(desired, &observed),
                    },
                );
                self.save(state)
            }
            UpdateOutcome::RequiresReplacement => {
                self.replace_node(node, desired, &record, state, deferred)
                    .await
            }
        }
    }

    async fn create_node(
        &self,
        kind: ResourceKind,
        desired: &AttributeMap,
        state: &mut StackState,
    ) -> Result<(), StepError<P::Error>> {
        let created = self
            .bounded(Operation::Create, self.provider.create(kind, desired))
            .await
            .map_err(StepError::Node)?;
        state.insert(
            kind,
            NodeRecord {
                id: created.id,
                attributes: merge_attributes(desired, &created.attributes),
            },
        );
        self.save(state)
    }

    async fn replace_node(
        &self,
        node: &PlannedNode,
        desired: &AttributeMap,
        old: &NodeRecord,
        state: &mut StackState,
        deferred: &mut Vec<(ResourceKind, String)>,
    ) -> Result<(), StepError<P::Error>> {
        if node.lifecycle.create_before_destroy {
            // Successor first; a failed creation leaves the predecessor and
            // its state record intact. The predecessor is destroyed only
            // after dependents have repointed, at the end of the run.
            self.create_node(node.kind, desired, state).await?;
            deferred.push((node.kind, old.id.clone()));
            return Ok(());
        }

        self.bounded(
            Operation::Destroy,
            self.provider.destroy(node.kind, &old.id),
        )
        .await
        .map_err(StepError::Node)?;
        state.remove(node.kind);
        self.save(state)?;
        self.create_node(node.kind, desired, state).await
    }

    async fn destroy_deferred(
        &self,
        plan: &OrderedPlan,
        deferred: Vec<(ResourceKind, String)>,
        failed: &BTreeSet<ResourceKind>,
        failures: &mut Vec<NodeFailure<P::Error>>,
    ) {
        for (kind, old_id) in deferred {
            let blocked = plan
                .dependents_of(kind)
                .iter()
                .any(|dependent| failed.contains(dependent));
            if blocked {
                failures.push(NodeFailure {
                    kind,
                    error: NodeError::ReplacedResourceRetained { id: old_id },
                });
                continue;
            }
            if let Err(error) = self
                .bounded(Operation::Destroy, self.provider.destroy(kind, &old_id))
                .await
            {
                failures.push(NodeFailure { kind, error });
            }
        }
    }

    async fn destroy_existing(
        &self,
        kind: ResourceKind,
        record: &NodeRecord,
    ) -> Result<(), NodeError<P::Error>> {
        let described = self
            .bounded(
                Operation::Describe,
                self.provider.describe(kind, &record.id),
            )
            .await?;
        if described.is_none() {
            return Ok(());
        }
        self.bounded(Operation::Destroy, self.provider.destroy(kind, &record.id))
            .await
    }

    async fn bounded<T>(
        &self,
        operation: Operation,
        call: ProviderFuture<'_, T, P::Error>,
    ) -> Result<T, NodeError<P::Error>> {
        match timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(NodeError::Provider { operation, source }),
            Err(_) => Err(NodeError::Timeout {
                operation,
                seconds: self.call_timeout.as_secs(),
            }),
        }
    }

    fn save(&self, state: &StackState) -> Result<(), StepError<P::Error>> {
        self.store.save(state).map_err(StepError::Store)
    }
}

/// Previews the actions a run would take, without any provider call.
///
/// Reference-valued attributes resolve against the recorded attributes of
/// their target; a target with no record yet previews the referring node as
/// drifted. A drifted node previews as `update` because only the provider
/// can decide between in-place update and replacement.
#[must_use]
pub fn plan_actions(plan: &OrderedPlan, state: &StackState) -> Vec<PlannedAction> {
    let mut actions = Vec::new();
    for kind in state.kinds_reversed() {
        if !plan.contains(kind) {
            actions.push(PlannedAction {
                kind,
                action: NodeAction::Destroy,
            });
        }
    }
    for node in plan.nodes() {
        let action = state
            .record(node.kind)
            .map_or(NodeAction::Create, |record| preview_action(node, state, record));
        actions.push(PlannedAction {
            kind: node.kind,
            action,
        });
    }
    actions
}

fn preview_action(node: &PlannedNode, state: &StackState, record: &NodeRecord) -> NodeAction {
    for (name, value) in &node.attributes {
        if node.lifecycle.ignore_changes.contains(name) {
            continue;
        }
        let desired = match value {
            AttrValue::Literal(literal) => Some(literal.clone()),
            AttrValue::Reference { kind, attribute } => state
                .record(*kind)
                .and_then(|target| target.attributes.get(attribute))
                .cloned(),
        };
        let converged =
            desired.is_some_and(|value_now| record.attributes.get(name) == Some(&value_now));
        if !converged {
            return NodeAction::Update;
        }
    }
    NodeAction::NoOp
}

fn resolve_attributes<E>(
    node: &PlannedNode,
    state: &StackState,
) -> Result<AttributeMap, NodeError<E>>
where
    E: std::error::Error + 'static,
{
    node.attributes
        .iter()
        .map(|(name, value)| match value {
            AttrValue::Literal(literal) => Ok((name.clone(), literal.clone())),
            AttrValue::Reference { kind, attribute } => state
                .record(*kind)
                .and_then(|target| target.attributes.get(attribute))
                .cloned()
                .map(|resolved| (name.clone(), resolved))
                .ok_or_else(|| NodeError::UnresolvedReference {
                    kind: *kind,
                    attribute: attribute.clone(),
                }),
        })
        .collect()
}

/// Desired keys whose recorded value differs, excluding the ignore set.
fn changed_attributes(
    desired: &AttributeMap,
    recorded: &AttributeMap,
    ignore: &BTreeSet<String>,
) -> Vec<String> {
    desired
        .iter()
        .filter(|(name, _)| !ignore.contains(*name))
        .filter(|(name, value)| recorded.get(*name) != Some(*value))
        .map(|(name, _)| name.clone())
        .collect()
}

/// Last-applied attributes: the resolved desired map merged with whatever
/// the provider observed on top (observed values win).
fn merge_attributes(desired: &AttributeMap, observed: &AttributeMap) -> AttributeMap {
    let mut merged = desired.clone();
    merged.extend(observed.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}
