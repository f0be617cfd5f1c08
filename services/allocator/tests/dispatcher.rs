//! Dispatcher lifecycle: create, process, destroy, resume.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bmfleet_allocator::dispatcher::{AllocationRequest, DispatchError, Dispatcher, DispatcherConfig};
use bmfleet_allocator::model::{AllocationState, ProvisionState};
use bmfleet_allocator::store::{AllocationStore, NodeStore};
use common::{available_node, bound_node, fast_scheduler_config, wait_for_terminal, FaultyStore};
use rstest::rstest;

const CONDUCTOR: &str = "conductor-a";

fn config() -> DispatcherConfig {
    let mut config = DispatcherConfig::new(CONDUCTOR);
    config.workers = 4;
    config.scheduler = fast_scheduler_config(1);
    config
}

async fn start(store: &FaultyStore, config: DispatcherConfig) -> Dispatcher {
    common::init_tracing();
    Dispatcher::start(config, Arc::new(store.clone()), Arc::new(store.clone()))
        .await
        .unwrap()
}

#[tokio::test]
async fn create_returns_allocating_and_completes() {
    let store = FaultyStore::new();
    let node = available_node("x-large");
    store.put_node(&node).await.unwrap();
    let dispatcher = start(&store, config()).await;

    let mut request = AllocationRequest::new("x-large");
    request.name = Some("web-0".to_string());
    request
        .extra
        .insert("owner".to_string(), serde_json::json!("team-a"));
    let created = dispatcher.create_allocation(request).await.unwrap();

    assert_eq!(created.state, AllocationState::Allocating);
    assert_eq!(created.conductor_affinity.as_deref(), Some(CONDUCTOR));
    assert_eq!(created.node_id, None);

    let done = wait_for_terminal(&dispatcher, created.id).await;
    assert_eq!(done.state, AllocationState::Active);
    assert_eq!(done.node_id, Some(node.id));
    assert_eq!(done.name.as_deref(), Some("web-0"));
    assert_eq!(done.extra.get("owner"), Some(&serde_json::json!("team-a")));

    let by_name = dispatcher.find_allocation("web-0").await.unwrap();
    assert_eq!(by_name.id, created.id);
    let by_id = dispatcher
        .find_allocation(&created.id.to_string())
        .await
        .unwrap();
    assert_eq!(by_id.id, created.id);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn failed_allocation_is_recorded() {
    let store = FaultyStore::new();
    let dispatcher = start(&store, config()).await;

    let created = dispatcher
        .create_allocation(AllocationRequest::new("x-large"))
        .await
        .unwrap();
    let done = wait_for_terminal(&dispatcher, created.id).await;

    assert_eq!(done.state, AllocationState::Error);
    assert!(done.last_error.unwrap().contains("x-large"));
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn duplicate_name_rejected() {
    let store = FaultyStore::new();
    let dispatcher = start(&store, config()).await;

    let mut request = AllocationRequest::new("x-large");
    request.name = Some("db-1".to_string());
    dispatcher.create_allocation(request.clone()).await.unwrap();

    let err = dispatcher.create_allocation(request).await.unwrap_err();
    assert!(matches!(err, DispatchError::DuplicateName(ref name) if name == "db-1"));
    dispatcher.shutdown().await;
}

#[rstest]
#[case::uuid_shaped("6d2b5cb4-6c07-4f2a-9a38-e7a3a5a1c0de")]
#[case::bad_chars("web 0")]
#[tokio::test]
async fn invalid_name_rejected_before_persisting(#[case] name: &str) {
    let store = FaultyStore::new();
    let dispatcher = start(&store, config()).await;

    let mut request = AllocationRequest::new("x-large");
    request.name = Some(name.to_string());
    let err = dispatcher.create_allocation(request).await.unwrap_err();

    assert!(matches!(err, DispatchError::InvalidParameter(_)));
    let all = dispatcher.list_allocations(&Default::default()).await.unwrap();
    assert!(all.is_empty());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn destroy_without_node() {
    let store = FaultyStore::new();
    let dispatcher = start(&store, config()).await;
    let created = dispatcher
        .create_allocation(AllocationRequest::new("x-large"))
        .await
        .unwrap();
    wait_for_terminal(&dispatcher, created.id).await;

    dispatcher.destroy_allocation(created.id).await.unwrap();

    let err = dispatcher.get_allocation(created.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::NotFound(_)));
    dispatcher.shutdown().await;
}

#[rstest]
#[case::available(ProvisionState::Available, false)]
#[case::deploy_failed(ProvisionState::DeployFailed, false)]
#[case::active_in_maintenance(ProvisionState::Active, true)]
#[tokio::test]
async fn destroy_clears_association(#[case] state: ProvisionState, #[case] maintenance: bool) {
    let store = FaultyStore::new();
    let mut allocation = common::allocation("x-large");
    let mut node = bound_node(&mut allocation, state);
    node.maintenance = maintenance;
    store.put_node(&node).await.unwrap();
    store.create_allocation(&allocation).await.unwrap();
    let dispatcher = start(&store, config()).await;

    dispatcher.destroy_allocation(allocation.id).await.unwrap();

    let stored = store.get_node(node.id).await.unwrap();
    assert_eq!(stored.instance_uuid, None);
    assert_eq!(stored.allocation_id, None);
    assert_eq!(stored.reservation, None);
    assert!(store.get_allocation(allocation.id).await.unwrap_err().is_not_found());
    dispatcher.shutdown().await;
}

#[rstest]
#[case::deploying(ProvisionState::Deploying, false)]
#[case::cleaning(ProvisionState::Cleaning, true)]
#[case::active(ProvisionState::Active, false)]
#[tokio::test]
async fn destroy_rejected_for_busy_node(#[case] state: ProvisionState, #[case] maintenance: bool) {
    let store = FaultyStore::new();
    let mut allocation = common::allocation("x-large");
    let mut node = bound_node(&mut allocation, state);
    node.maintenance = maintenance;
    store.put_node(&node).await.unwrap();
    store.create_allocation(&allocation).await.unwrap();
    let dispatcher = start(&store, config()).await;

    let err = dispatcher.destroy_allocation(allocation.id).await.unwrap_err();

    assert!(matches!(err, DispatchError::InvalidState(_)), "{err}");
    let stored = store.get_node(node.id).await.unwrap();
    assert_eq!(stored.instance_uuid, Some(allocation.id.uuid()));
    assert_eq!(stored.allocation_id, Some(allocation.id));
    assert_eq!(stored.reservation, None);
    assert_eq!(store.get_allocation(allocation.id).await.unwrap(), allocation);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn destroy_leaves_rebound_node_alone() {
    let store = FaultyStore::new();
    let mut stale = common::allocation("x-large");
    let mut current = common::allocation("x-large");
    let node = bound_node(&mut current, ProvisionState::Available);
    stale.mark_active(node.id);
    store.put_node(&node).await.unwrap();
    store.create_allocation(&stale).await.unwrap();
    store.create_allocation(&current).await.unwrap();
    let dispatcher = start(&store, config()).await;

    dispatcher.destroy_allocation(stale.id).await.unwrap();

    let stored = store.get_node(node.id).await.unwrap();
    assert_eq!(stored.allocation_id, Some(current.id));
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn destroy_allocating_without_node() {
    let store = FaultyStore::new();
    let mut allocation = common::allocation("x-large");
    allocation.conductor_affinity = Some("dead-conductor".to_string());
    store.create_allocation(&allocation).await.unwrap();
    let dispatcher = start(&store, config()).await;

    dispatcher.destroy_allocation(allocation.id).await.unwrap();

    assert!(store.get_allocation(allocation.id).await.unwrap_err().is_not_found());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn destroy_allocating_unbinds_node() {
    let store = FaultyStore::new();
    let mut allocation = common::allocation("x-large");
    let node = bound_node(&mut allocation, ProvisionState::Available);
    allocation.state = AllocationState::Allocating;
    store.put_node(&node).await.unwrap();
    store.create_allocation(&allocation).await.unwrap();
    let dispatcher = start(&store, config()).await;

    dispatcher.destroy_allocation(allocation.id).await.unwrap();

    let stored = store.get_node(node.id).await.unwrap();
    assert_eq!(stored.allocation_id, None);
    assert_eq!(stored.instance_uuid, None);
    assert_eq!(stored.reservation, None);
    assert!(store.get_allocation(allocation.id).await.unwrap_err().is_not_found());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn destroy_during_commit_leaves_node_unbound() {
    let store = FaultyStore::new();
    let node = available_node("x-large");
    store.put_node(&node).await.unwrap();
    let gate = store.hold_next_update();
    let dispatcher = start(&store, config()).await;

    let created = dispatcher
        .create_allocation(AllocationRequest::new("x-large"))
        .await
        .unwrap();
    // The worker has bound the node and is about to persist `active`.
    gate.reached.notified().await;
    assert_eq!(
        store.get_node(node.id).await.unwrap().allocation_id,
        Some(created.id)
    );

    dispatcher.destroy_allocation(created.id).await.unwrap();
    gate.resume.notify_one();
    dispatcher.shutdown().await;

    let stored = store.get_node(node.id).await.unwrap();
    assert_eq!(stored.allocation_id, None);
    assert_eq!(stored.instance_uuid, None);
    assert_eq!(stored.reservation, None);
    assert!(store.get_allocation(created.id).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn destroy_reports_locked_node() {
    let store = FaultyStore::new();
    let mut allocation = common::allocation("x-large");
    let node = bound_node(&mut allocation, ProvisionState::Available);
    store.put_node(&node).await.unwrap();
    store.create_allocation(&allocation).await.unwrap();
    let dispatcher = start(&store, config()).await;
    store.inner.reserve_node(node.id, "conductor-b/other").await.unwrap();

    let err = dispatcher.destroy_allocation(allocation.id).await.unwrap_err();

    assert!(matches!(err, DispatchError::NodeLocked { ref holder, .. } if holder == "conductor-b/other"));
    // Initial try plus one retry.
    assert_eq!(store.reserve_attempts(), 2);
    assert!(store.get_allocation(allocation.id).await.is_ok());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn start_clears_own_stale_reservations() {
    let store = FaultyStore::new();
    let ours = available_node("x-large");
    let theirs = available_node("x-large");
    store.put_node(&ours).await.unwrap();
    store.put_node(&theirs).await.unwrap();
    store
        .inner
        .reserve_node(ours.id, &format!("{CONDUCTOR}/leftover"))
        .await
        .unwrap();
    store.inner.reserve_node(theirs.id, "conductor-b/live").await.unwrap();

    let dispatcher = start(&store, config()).await;

    assert_eq!(store.get_node(ours.id).await.unwrap().reservation, None);
    assert_eq!(
        store.get_node(theirs.id).await.unwrap().reservation.as_deref(),
        Some("conductor-b/live")
    );
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn resume_picks_up_own_allocating_work() {
    let store = FaultyStore::new();
    store.put_node(&available_node("x-large")).await.unwrap();

    let mut ours = common::allocation("x-large");
    ours.conductor_affinity = Some(CONDUCTOR.to_string());
    let mut theirs = common::allocation("x-large");
    theirs.conductor_affinity = Some("conductor-b".to_string());
    store.create_allocation(&ours).await.unwrap();
    store.create_allocation(&theirs).await.unwrap();

    let dispatcher = start(&store, config()).await;
    assert_eq!(dispatcher.resume_allocations().await.unwrap(), 1);

    let done = wait_for_terminal(&dispatcher, ours.id).await;
    assert_eq!(done.state, AllocationState::Active);
    let untouched = dispatcher.get_allocation(theirs.id).await.unwrap();
    assert_eq!(untouched.state, AllocationState::Allocating);
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn full_queue_fails_creation() {
    let store = FaultyStore::new();
    store.delay_list_nodes(Duration::from_millis(300));
    let mut config = config();
    config.workers = 1;
    config.queue_capacity = 1;
    let dispatcher = start(&store, config).await;

    let mut rejected = Vec::new();
    for name in ["a", "b", "c"] {
        let mut request = AllocationRequest::new("x-large");
        request.name = Some(name.to_string());
        match dispatcher.create_allocation(request).await {
            Ok(_) => {}
            Err(DispatchError::NoFreeWorker) => rejected.push(name),
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert!(!rejected.is_empty());
    for name in rejected {
        let allocation = dispatcher.find_allocation(name).await.unwrap();
        assert_eq!(allocation.state, AllocationState::Error);
        assert_eq!(
            allocation.last_error.as_deref(),
            Some("no free worker to process the allocation")
        );
    }
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn shutdown_waits_for_in_flight_allocation() {
    let store = FaultyStore::new();
    let node = available_node("x-large");
    store.put_node(&node).await.unwrap();
    let gate = store.hold_next_update();
    let dispatcher = start(&store, config()).await;

    let created = dispatcher
        .create_allocation(AllocationRequest::new("x-large"))
        .await
        .unwrap();
    gate.reached.notified().await;

    let shutdown = tokio::spawn(dispatcher.shutdown());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!shutdown.is_finished());

    gate.resume.notify_one();
    shutdown.await.unwrap();

    let done = store.get_allocation(created.id).await.unwrap();
    assert_eq!(done.state, AllocationState::Active);
    assert_eq!(done.node_id, Some(node.id));
    let stored = store.get_node(node.id).await.unwrap();
    assert_eq!(stored.allocation_id, Some(created.id));
    assert_eq!(stored.reservation, None);
}
