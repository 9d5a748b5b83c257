//! Integration tests for output projection over converged and partial state.

#[path = "common/test_constants.rs"]
mod test_constants;

use stratus::test_support::InMemoryStateStore;
use stratus::{
    LocalProvider, OrderedPlan, Reconciler, ResourceGraph, StackSnapshot, StackState, project,
    resolve,
};
use test_constants::{PUBLIC_KEY, snapshot_with};

fn plan_for(snapshot: &StackSnapshot) -> OrderedPlan {
    let graph =
        ResourceGraph::build(snapshot).unwrap_or_else(|err| panic!("graph should build: {err}"));
    resolve(&graph).unwrap_or_else(|err| panic!("plan should resolve: {err}"))
}

async fn converge(snapshot: &StackSnapshot) -> StackState {
    Reconciler::new(LocalProvider::new(), InMemoryStateStore::new())
        .apply(&plan_for(snapshot))
        .await
        .unwrap_or_else(|err| panic!("apply should converge: {err}"))
}

#[tokio::test]
async fn full_stack_projects_every_output() {
    let snapshot = snapshot_with(|inputs| {
        inputs.create_key_pair = true;
        inputs.ssh_public_key = String::from(PUBLIC_KEY);
        inputs.create_cpu_alarm = true;
        inputs.associate_public_ip = true;
        inputs.additional_volumes = vec![stratus::VolumeSpec {
            device_name: String::from("/dev/sdb"),
            volume_type: String::from("gp3"),
            volume_size: 100,
            encrypted: true,
            delete_on_termination: None,
            iops: None,
            throughput: None,
        }];
    });
    let state = converge(&snapshot).await;
    let outputs = project(&snapshot, &state);

    assert!(outputs.instance_id.is_some_and(|id| id.starts_with("i-")));
    assert!(outputs.private_ip.is_some());
    assert!(outputs.public_ip.is_some());
    assert!(outputs
        .security_group_id
        .is_some_and(|id| id.starts_with("sg-")));
    assert_eq!(outputs.key_pair_name, Some(String::from("web-key")));
    assert_eq!(outputs.additional_volume_ids.len(), 1);
    assert!(outputs
        .cpu_alarm_id
        .is_some_and(|id| id.starts_with("alarm-")));
}

#[tokio::test]
async fn absent_alarm_projects_null_not_error() {
    let snapshot = snapshot_with(|inputs| {
        inputs.create_cpu_alarm = false;
    });
    let state = converge(&snapshot).await;
    let outputs = project(&snapshot, &state);

    assert_eq!(outputs.cpu_alarm_id, None);
    assert!(outputs.instance_id.is_some());
}

#[tokio::test]
async fn existing_key_name_passes_through_as_a_literal() {
    let snapshot = snapshot_with(|inputs| {
        inputs.create_key_pair = false;
        inputs.key_name = Some(String::from("ops-shared"));
    });
    let state = converge(&snapshot).await;
    let outputs = project(&snapshot, &state);

    assert_eq!(outputs.key_pair_name, Some(String::from("ops-shared")));
}

#[tokio::test]
async fn no_public_ip_when_not_associated() {
    let snapshot = snapshot_with(|inputs| {
        inputs.associate_public_ip = false;
    });
    let state = converge(&snapshot).await;
    let outputs = project(&snapshot, &state);

    assert_eq!(outputs.public_ip, None);
    assert!(outputs.private_ip.is_some());
}
