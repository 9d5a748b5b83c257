//! Projection of persisted state into the stack's exported outputs.
//!
//! Outputs read the owning node's recorded attributes when the node exists
//! and resolve to explicit nulls otherwise; projecting over a partially
//! converged (or empty) state is never an error.

use serde::Serialize;
use serde_json::Value;

use crate::graph::ResourceKind;
use crate::inputs::StackSnapshot;
use crate::state::StackState;

/// Exported values of a converged stack.
///
/// Serialises with explicit `null`s for values whose owning node is absent
/// or not yet applied.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StackOutputs {
    /// Provider identifier of the instance.
    pub instance_id: Option<String>,
    /// Private IP address observed on the instance.
    pub private_ip: Option<String>,
    /// Public IP address, when one was associated.
    pub public_ip: Option<String>,
    /// Provider identifier of the security group.
    pub security_group_id: Option<String>,
    /// Name of the key pair in use: the managed pair's name when
    /// `create_key_pair` is set, else the caller-supplied existing name.
    pub key_pair_name: Option<String>,
    /// Provider identifiers of the additional volumes, in declaration order.
    pub additional_volume_ids: Vec<String>,
    /// Provider identifier of the CPU alarm, when one is managed.
    pub cpu_alarm_id: Option<String>,
}

/// Projects outputs from the snapshot and the persisted state.
#[must_use]
pub fn project(snapshot: &StackSnapshot, state: &StackState) -> StackOutputs {
    let instance = state.record(ResourceKind::Instance);

    let key_pair_name = if snapshot.inputs().create_key_pair {
        state
            .record(ResourceKind::KeyPair)
            .and_then(|record| record.attributes.get("key_name"))
            .and_then(Value::as_str)
            .map(str::to_owned)
    } else {
        snapshot.inputs().key_name.clone()
    };

    let additional_volume_ids = instance
        .and_then(|record| record.attributes.get("additional_volume_ids"))
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();

    StackOutputs {
        instance_id: instance.map(|record| record.id.clone()),
        private_ip: instance_attr(state, "private_ip"),
        public_ip: instance_attr(state, "public_ip"),
        security_group_id: state
            .record(ResourceKind::SecurityGroup)
            .map(|record| record.id.clone()),
        key_pair_name,
        additional_volume_ids,
        cpu_alarm_id: state
            .record(ResourceKind::Alarm)
            .map(|record| record.id.clone()),
    }
}

fn instance_attr(state: &StackState, name: &str) -> Option<String> {
    state
        .record(ResourceKind::Instance)
        .and_then(|record| record.attributes.get(name))
        .and_then(Value::as_str)
        .map(str::to_owned)
}
