//! Per-resource lifecycle policies.
//!
//! Policies are data, not code: each node carries a replacement-ordering
//! flag, a set of attributes excluded from the needs-update decision, and the
//! apply-time preconditions gating its materialisation. The graph is rebuilt
//! from the snapshot on every run, so preconditions are re-evaluated on every
//! run rather than only at first creation.

use std::collections::BTreeSet;

use crate::graph::ResourceKind;
use crate::inputs::StackSnapshot;

/// Minimum alarm period, in seconds, accepted without detailed monitoring.
pub const BASIC_MONITORING_MIN_PERIOD: u32 = 300;

/// An apply-time check gating materialisation of a single node.
///
/// The condition is evaluated against the immutable snapshot when the policy
/// is built; the reconciler consults `holds` immediately before the node's
/// create or update call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Precondition {
    /// Human-readable statement of the condition.
    pub condition: String,
    /// Whether the condition held against the current snapshot.
    pub holds: bool,
}

impl Precondition {
    /// Builds a precondition with an explicit evaluation result.
    #[must_use]
    pub fn new(condition: impl Into<String>, holds: bool) -> Self {
        Self {
            condition: condition.into(),
            holds,
        }
    }
}

/// Lifecycle policy attached to a resource node.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LifecyclePolicy {
    /// On replacement, create the successor and repoint dependents before
    /// destroying the predecessor.
    pub create_before_destroy: bool,
    /// Attributes excluded from the needs-update decision after creation.
    pub ignore_changes: BTreeSet<String>,
    /// Conditions that must hold before the node may be materialised.
    pub preconditions: Vec<Precondition>,
}

impl LifecyclePolicy {
    /// Returns the first precondition that failed to hold, if any.
    #[must_use]
    pub fn violated_precondition(&self) -> Option<&Precondition> {
        self.preconditions.iter().find(|pre| !pre.holds)
    }
}

/// Builds the lifecycle policy for a node kind from the current snapshot.
#[must_use]
pub fn policy_for(kind: ResourceKind, snapshot: &StackSnapshot) -> LifecyclePolicy {
    let inputs = snapshot.inputs();
    match kind {
        ResourceKind::SecurityGroup => LifecyclePolicy {
            create_before_destroy: true,
            ..LifecyclePolicy::default()
        },
        ResourceKind::KeyPair => LifecyclePolicy {
            preconditions: vec![Precondition::new(
                "ssh_public_key must be non-empty when create_key_pair is true",
                !inputs.ssh_public_key.trim().is_empty(),
            )],
            ..LifecyclePolicy::default()
        },
        ResourceKind::Instance => LifecyclePolicy {
            ignore_changes: BTreeSet::from([String::from("user_data")]),
            ..LifecyclePolicy::default()
        },
        ResourceKind::Alarm => LifecyclePolicy {
            preconditions: vec![Precondition::new(
                format!(
                    "enable_monitoring must be true or alarm_period must be at least \
                     {BASIC_MONITORING_MIN_PERIOD} seconds"
                ),
                inputs.enable_monitoring || inputs.alarm_period >= BASIC_MONITORING_MIN_PERIOD,
            )],
            ..LifecyclePolicy::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::StackInputs;

    fn snapshot_with(mutate: impl FnOnce(&mut StackInputs)) -> StackSnapshot {
        let mut inputs = StackInputs {
            name: String::from("web"),
            image_id: String::from("img-0123"),
            ..StackInputs::default()
        };
        mutate(&mut inputs);
        inputs
            .validate()
            .unwrap_or_else(|err| panic!("inputs should validate: {err}"))
    }

    #[test]
    fn security_group_replaces_create_first() {
        let snapshot = snapshot_with(|_| {});
        let policy = policy_for(ResourceKind::SecurityGroup, &snapshot);
        assert!(policy.create_before_destroy);
        assert!(policy.preconditions.is_empty());
    }

    #[test]
    fn instance_ignores_user_data_changes() {
        let snapshot = snapshot_with(|_| {});
        let policy = policy_for(ResourceKind::Instance, &snapshot);
        assert!(policy.ignore_changes.contains("user_data"));
        assert!(!policy.create_before_destroy);
    }

    #[test]
    fn key_pair_requires_public_key_material() {
        let snapshot = snapshot_with(|inputs| {
            inputs.create_key_pair = true;
            inputs.ssh_public_key = String::from("   ");
        });
        let policy = policy_for(ResourceKind::KeyPair, &snapshot);
        let violated = policy
            .violated_precondition()
            .unwrap_or_else(|| panic!("blank key material should violate the precondition"));
        assert!(violated.condition.contains("ssh_public_key"));
    }

    #[test]
    fn alarm_precondition_accepts_either_granularity() {
        let coarse = snapshot_with(|inputs| {
            inputs.create_cpu_alarm = true;
            inputs.alarm_period = 300;
            inputs.enable_monitoring = false;
        });
        assert!(policy_for(ResourceKind::Alarm, &coarse)
            .violated_precondition()
            .is_none());

        let detailed = snapshot_with(|inputs| {
            inputs.create_cpu_alarm = true;
            inputs.alarm_period = 60;
            inputs.enable_monitoring = true;
        });
        assert!(policy_for(ResourceKind::Alarm, &detailed)
            .violated_precondition()
            .is_none());

        let rejected = snapshot_with(|inputs| {
            inputs.create_cpu_alarm = true;
            inputs.alarm_period = 60;
            inputs.enable_monitoring = false;
        });
        assert!(policy_for(ResourceKind::Alarm, &rejected)
            .violated_precondition()
            .is_some());
    }
}
