//! Integration tests for the reconciler: convergence, idempotence, lifecycle
//! policies, partial failure, and teardown.

#[path = "common/test_constants.rs"]
mod test_constants;

use std::time::Duration;

use serde_json::{Value, json};
use stratus::test_support::{InMemoryStateStore, RecordingProvider};
use stratus::{
    ApplyError, NodeError, Operation, OrderedPlan, Reconciler, ResourceGraph, ResourceKind,
    StackSnapshot, StackState, resolve,
};
use test_constants::{PUBLIC_KEY, snapshot_with};

fn plan_for(snapshot: &StackSnapshot) -> OrderedPlan {
    let graph =
        ResourceGraph::build(snapshot).unwrap_or_else(|err| panic!("graph should build: {err}"));
    resolve(&graph).unwrap_or_else(|err| panic!("plan should resolve: {err}"))
}

fn reconciler(
    provider: &RecordingProvider,
    store: &InMemoryStateStore,
) -> Reconciler<RecordingProvider, InMemoryStateStore> {
    Reconciler::new(provider.clone(), store.clone())
}

async fn converge(
    provider: &RecordingProvider,
    store: &InMemoryStateStore,
    snapshot: &StackSnapshot,
) -> StackState {
    reconciler(provider, store)
        .apply(&plan_for(snapshot))
        .await
        .unwrap_or_else(|err| panic!("apply should converge: {err}"))
}

#[tokio::test]
async fn first_apply_creates_in_dependency_order() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|inputs| {
        inputs.create_key_pair = true;
        inputs.ssh_public_key = String::from(PUBLIC_KEY);
        inputs.create_cpu_alarm = true;
    });

    let state = converge(&provider, &store, &snapshot).await;

    assert_eq!(state.len(), 4);
    let kinds: Vec<ResourceKind> = provider.calls().iter().map(|call| call.kind).collect();
    assert_eq!(
        kinds,
        [
            ResourceKind::SecurityGroup,
            ResourceKind::KeyPair,
            ResourceKind::Instance,
            ResourceKind::Alarm
        ]
    );
    assert!(provider
        .calls()
        .iter()
        .all(|call| call.operation == Operation::Create));
    // One incremental save per node action.
    assert_eq!(store.save_count(), 4);
}

#[tokio::test]
async fn alarm_resolves_the_instance_id_reference() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|inputs| {
        inputs.create_cpu_alarm = true;
    });

    let state = converge(&provider, &store, &snapshot).await;

    let instance_id = state
        .record(ResourceKind::Instance)
        .map(|record| record.id.clone())
        .unwrap_or_else(|| panic!("instance should be recorded"));
    let watched = state
        .record(ResourceKind::Alarm)
        .and_then(|record| record.attributes.get("instance_id"))
        .cloned();
    assert_eq!(watched, Some(json!(instance_id)));
}

#[tokio::test]
async fn reapplying_an_unchanged_snapshot_makes_zero_calls() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|inputs| {
        inputs.create_key_pair = true;
        inputs.ssh_public_key = String::from(PUBLIC_KEY);
        inputs.create_cpu_alarm = true;
    });

    converge(&provider, &store, &snapshot).await;
    let calls_after_first = provider.call_count();
    converge(&provider, &store, &snapshot).await;

    assert_eq!(provider.call_count(), calls_after_first);
}

#[tokio::test]
async fn user_data_drift_is_ignored_but_instance_type_is_not() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|inputs| {
        inputs.user_data = Some(String::from("#!/bin/sh\necho v1"));
    });
    converge(&provider, &store, &snapshot).await;
    let calls_after_first = provider.call_count();

    let edited_script = snapshot_with(|inputs| {
        inputs.user_data = Some(String::from("#!/bin/sh\necho v2"));
    });
    converge(&provider, &store, &edited_script).await;
    assert_eq!(provider.call_count(), calls_after_first);

    let resized = snapshot_with(|inputs| {
        inputs.user_data = Some(String::from("#!/bin/sh\necho v2"));
        inputs.instance_type = String::from("t3.large");
    });
    converge(&provider, &store, &resized).await;
    assert_eq!(
        provider.calls_for(ResourceKind::Instance),
        [Operation::Create, Operation::Update]
    );
}

#[tokio::test]
async fn volume_defaults_reach_the_provider_payload() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|inputs| {
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

    let state = converge(&provider, &store, &snapshot).await;

    let record = state
        .record(ResourceKind::Instance)
        .unwrap_or_else(|| panic!("instance should be recorded"));
    let volumes = record
        .attributes
        .get("additional_volumes")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("volumes should be recorded"));
    assert_eq!(volumes.len(), 1);
    let entry = volumes
        .first()
        .and_then(Value::as_object)
        .unwrap_or_else(|| panic!("volume entry should be an object"));
    assert_eq!(entry.get("delete_on_termination"), Some(&json!(true)));
    assert!(!entry.contains_key("iops"));
    assert!(!entry.contains_key("throughput"));

    let volume_ids = record
        .attributes
        .get("additional_volume_ids")
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("volume ids should be observed"));
    assert_eq!(volume_ids.len(), 1);
}

#[tokio::test]
async fn blank_key_material_fails_the_key_pair_before_any_call() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|inputs| {
        inputs.create_key_pair = true;
        inputs.ssh_public_key = String::new();
    });

    let Err(ApplyError::Partial(failure)) =
        reconciler(&provider, &store).apply(&plan_for(&snapshot)).await
    else {
        panic!("blank key material should fail the run");
    };

    let key_failure = failure
        .failures
        .iter()
        .find(|f| f.kind == ResourceKind::KeyPair)
        .unwrap_or_else(|| panic!("key pair should be the failing node"));
    assert!(matches!(
        &key_failure.error,
        NodeError::Precondition { condition } if condition.contains("ssh_public_key")
    ));
    assert!(provider.calls_for(ResourceKind::KeyPair).is_empty());
    assert!(provider.calls_for(ResourceKind::Instance).is_empty());

    let instance_failure = failure
        .failures
        .iter()
        .find(|f| f.kind == ResourceKind::Instance)
        .unwrap_or_else(|| panic!("instance should be halted"));
    assert!(matches!(
        instance_failure.error,
        NodeError::DependencyFailed {
            dependency: ResourceKind::KeyPair
        }
    ));

    // The security group does not depend on the key pair and still applies.
    assert!(failure.state.record(ResourceKind::SecurityGroup).is_some());
}

#[tokio::test]
async fn coarse_alarm_without_monitoring_fails_the_alarm() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|inputs| {
        inputs.create_cpu_alarm = true;
        inputs.alarm_period = 60;
        inputs.enable_monitoring = false;
    });

    let Err(ApplyError::Partial(failure)) =
        reconciler(&provider, &store).apply(&plan_for(&snapshot)).await
    else {
        panic!("coarse alarm should fail the run");
    };

    assert_eq!(failure.failures.len(), 1);
    let alarm_failure = failure
        .failures
        .first()
        .unwrap_or_else(|| panic!("one failure expected"));
    assert_eq!(alarm_failure.kind, ResourceKind::Alarm);
    assert!(matches!(
        &alarm_failure.error,
        NodeError::Precondition { condition } if condition.contains("enable_monitoring")
    ));
    assert!(provider.calls_for(ResourceKind::Alarm).is_empty());
    // Preconditions gate single nodes; the rest of the stack converged.
    assert!(failure.state.record(ResourceKind::Instance).is_some());
}

#[tokio::test]
async fn failed_node_halts_dependents_and_keeps_progress() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    provider.fail_on(ResourceKind::Instance, Operation::Create);
    let snapshot = snapshot_with(|inputs| {
        inputs.create_cpu_alarm = true;
    });

    let Err(ApplyError::Partial(failure)) =
        reconciler(&provider, &store).apply(&plan_for(&snapshot)).await
    else {
        panic!("scripted instance failure should fail the run");
    };

    assert!(failure.state.record(ResourceKind::SecurityGroup).is_some());
    assert!(failure.state.record(ResourceKind::Instance).is_none());
    assert!(provider.calls_for(ResourceKind::Alarm).is_empty());

    // A retry only reattempts the remainder.
    let retry_provider = provider.clone();
    retry_provider.clear_scripts();
    converge(&retry_provider, &store, &snapshot).await;
    let retried: Vec<ResourceKind> = provider
        .calls()
        .iter()
        .skip(2)
        .map(|call| call.kind)
        .collect();
    assert_eq!(retried, [ResourceKind::Instance, ResourceKind::Alarm]);
}

#[tokio::test]
async fn security_group_replacement_creates_before_destroying() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|_| {});
    converge(&provider, &store, &snapshot).await;

    provider.replace_on_update(ResourceKind::SecurityGroup);
    let renamed = snapshot_with(|inputs| {
        inputs.name = String::from("web-v2");
    });
    let state = converge(&provider, &store, &renamed).await;

    let sequence: Vec<(ResourceKind, Operation)> = provider
        .calls()
        .iter()
        .skip(2)
        .map(|call| (call.kind, call.operation))
        .collect();
    assert_eq!(
        sequence,
        [
            (ResourceKind::SecurityGroup, Operation::Update),
            (ResourceKind::SecurityGroup, Operation::Create),
            (ResourceKind::Instance, Operation::Update),
            (ResourceKind::SecurityGroup, Operation::Destroy),
        ]
    );

    // The instance repointed to the successor before the predecessor died.
    let new_group_id = state
        .record(ResourceKind::SecurityGroup)
        .map(|record| record.id.clone())
        .unwrap_or_else(|| panic!("group should be recorded"));
    let instance_group = state
        .record(ResourceKind::Instance)
        .and_then(|record| record.attributes.get("security_group_id"))
        .cloned();
    assert_eq!(instance_group, Some(json!(new_group_id)));
    assert!(!provider.live_ids().contains(&String::from("sg-1")));
}

#[tokio::test]
async fn failed_replacement_creation_leaves_the_old_group_intact() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|_| {});
    converge(&provider, &store, &snapshot).await;

    provider.replace_on_update(ResourceKind::SecurityGroup);
    provider.fail_on(ResourceKind::SecurityGroup, Operation::Create);
    let renamed = snapshot_with(|inputs| {
        inputs.name = String::from("web-v2");
    });

    let Err(ApplyError::Partial(failure)) =
        reconciler(&provider, &store).apply(&plan_for(&renamed)).await
    else {
        panic!("failed replacement should fail the run");
    };

    assert_eq!(
        failure
            .state
            .record(ResourceKind::SecurityGroup)
            .map(|record| record.id.as_str()),
        Some("sg-1")
    );
    assert!(provider.live_ids().contains(&String::from("sg-1")));
    assert!(provider.calls_for(ResourceKind::SecurityGroup).iter().all(
        |operation| *operation != Operation::Destroy
    ));
}

#[tokio::test]
async fn predecessor_is_retained_when_a_dependent_fails_to_repoint() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|_| {});
    converge(&provider, &store, &snapshot).await;

    provider.replace_on_update(ResourceKind::SecurityGroup);
    provider.fail_on(ResourceKind::Instance, Operation::Update);
    let renamed = snapshot_with(|inputs| {
        inputs.name = String::from("web-v2");
    });

    let Err(ApplyError::Partial(failure)) =
        reconciler(&provider, &store).apply(&plan_for(&renamed)).await
    else {
        panic!("failed repoint should fail the run");
    };

    assert!(failure.failures.iter().any(|f| matches!(
        &f.error,
        NodeError::ReplacedResourceRetained { id } if id == "sg-1"
    )));
    assert!(provider.live_ids().contains(&String::from("sg-1")));
}

#[tokio::test]
async fn hung_provider_calls_are_bounded_by_the_timeout() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    provider.hang_on(ResourceKind::SecurityGroup, Operation::Create);
    let snapshot = snapshot_with(|_| {});

    let bounded = reconciler(&provider, &store).with_call_timeout(Duration::from_millis(20));
    let Err(ApplyError::Partial(failure)) = bounded.apply(&plan_for(&snapshot)).await else {
        panic!("hung create should fail the run");
    };

    let group_failure = failure
        .failures
        .iter()
        .find(|f| f.kind == ResourceKind::SecurityGroup)
        .unwrap_or_else(|| panic!("group should time out"));
    assert!(matches!(
        group_failure.error,
        NodeError::Timeout {
            operation: Operation::Create,
            ..
        }
    ));
    assert!(failure.state.record(ResourceKind::SecurityGroup).is_none());
}

#[tokio::test]
async fn flipping_presence_off_destroys_the_orphan_first() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let with_alarm = snapshot_with(|inputs| {
        inputs.create_cpu_alarm = true;
    });
    converge(&provider, &store, &with_alarm).await;
    let calls_after_first = provider.call_count();

    let without_alarm = snapshot_with(|inputs| {
        inputs.create_cpu_alarm = false;
    });
    let state = converge(&provider, &store, &without_alarm).await;

    assert!(state.record(ResourceKind::Alarm).is_none());
    let follow_up: Vec<(ResourceKind, Operation)> = provider
        .calls()
        .iter()
        .skip(calls_after_first)
        .map(|call| (call.kind, call.operation))
        .collect();
    assert_eq!(
        follow_up,
        [
            (ResourceKind::Alarm, Operation::Describe),
            (ResourceKind::Alarm, Operation::Destroy),
        ]
    );
}

#[tokio::test]
async fn teardown_destroys_dependents_first() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|inputs| {
        inputs.create_key_pair = true;
        inputs.ssh_public_key = String::from(PUBLIC_KEY);
        inputs.create_cpu_alarm = true;
    });
    converge(&provider, &store, &snapshot).await;
    let calls_after_apply = provider.call_count();

    let graph = ResourceGraph::build(&snapshot)
        .unwrap_or_else(|err| panic!("graph should build: {err}"));
    let state = reconciler(&provider, &store)
        .teardown(&graph)
        .await
        .unwrap_or_else(|err| panic!("teardown should succeed: {err}"));

    assert!(state.is_empty());
    assert!(provider.live_ids().is_empty());
    let destroys: Vec<ResourceKind> = provider
        .calls()
        .iter()
        .skip(calls_after_apply)
        .filter(|call| call.operation == Operation::Destroy)
        .map(|call| call.kind)
        .collect();
    assert_eq!(
        destroys,
        [
            ResourceKind::Alarm,
            ResourceKind::Instance,
            ResourceKind::KeyPair,
            ResourceKind::SecurityGroup
        ]
    );
}

#[tokio::test]
async fn teardown_halts_dependencies_of_a_surviving_dependent() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|inputs| {
        inputs.create_cpu_alarm = true;
    });
    converge(&provider, &store, &snapshot).await;

    provider.fail_on(ResourceKind::Alarm, Operation::Destroy);
    let graph = ResourceGraph::build(&snapshot)
        .unwrap_or_else(|err| panic!("graph should build: {err}"));
    let Err(ApplyError::Partial(failure)) = reconciler(&provider, &store).teardown(&graph).await
    else {
        panic!("scripted alarm failure should fail teardown");
    };

    assert!(failure.state.record(ResourceKind::Alarm).is_some());
    assert!(failure.state.record(ResourceKind::Instance).is_some());
    assert!(failure.failures.iter().any(|f| matches!(
        f.error,
        NodeError::DependentStillRecorded {
            dependent: ResourceKind::Alarm
        }
    ) && f.kind == ResourceKind::Instance));
    // No destroy was attempted below the surviving dependent.
    assert!(provider.calls_for(ResourceKind::Instance).iter().all(
        |operation| *operation != Operation::Destroy
    ));
}

#[tokio::test]
async fn teardown_tolerates_resources_that_already_disappeared() {
    let provider = RecordingProvider::new();
    let store = InMemoryStateStore::new();
    let snapshot = snapshot_with(|_| {});
    let state = converge(&provider, &store, &snapshot).await;

    // Simulate out-of-band deletion of everything the provider knows about.
    let fresh_provider = RecordingProvider::new();
    let graph = ResourceGraph::build(&snapshot)
        .unwrap_or_else(|err| panic!("graph should build: {err}"));
    let after = reconciler(&fresh_provider, &store)
        .teardown(&graph)
        .await
        .unwrap_or_else(|err| panic!("teardown should succeed: {err}"));

    assert_eq!(state.len(), 2);
    assert!(after.is_empty());
    assert!(fresh_provider
        .calls()
        .iter()
        .all(|call| call.operation == Operation::Describe));
}
