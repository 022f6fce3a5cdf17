//! Client/server integration: request round-trips, leader failover, close
//! semantics, watchers over the wire.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{container_meta, container_stats, resource_meta, shared_backend, TestCoordinator};
use serial_test::serial;

use meridian_coord::client::{ClientError, ClientOptions, CoordClient};
use meridian_coord::event::{Event, EventFlags};
use meridian_election::ElectionHub;

fn client_for(hub: Arc<ElectionHub>) -> CoordClient {
    let getter = Arc::new(move || hub.leader().map(|m| m.addr));
    CoordClient::new(ClientOptions::new(getter).with_rpc_timeout(Duration::from_secs(2)))
}

#[tokio::test]
#[serial]
async fn alloc_id_roundtrip_and_monotonicity() {
    let hub = ElectionHub::new(Duration::from_millis(300));
    let coord = TestCoordinator::start(1, hub.clone(), shared_backend()).await;
    coord.wait_leader().await;

    let client = client_for(hub);
    let first = client.alloc_id().await.unwrap();
    let second = client.alloc_id().await.unwrap();
    assert!(first > 0);
    assert!(second > first);

    client.close();
    coord.stop();
}

#[tokio::test]
#[serial]
async fn calls_survive_leader_change() {
    let hub = ElectionHub::new(Duration::from_millis(300));
    let backend = shared_backend();
    let a = TestCoordinator::start(1, hub.clone(), backend.clone()).await;
    a.wait_leader().await;
    let b = TestCoordinator::start(2, hub.clone(), backend).await;

    let client = client_for(hub.clone());
    let before = client.alloc_id().await.unwrap();

    // Kill the leader; the follower takes the lease and the client finds it.
    a.stop();
    for _ in 0..200 {
        if b.election.is_leader() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(b.election.is_leader());

    // The first attempt may burn its timeout on the dead connection; the
    // call must succeed within a bounded number of retries.
    let mut after = 0;
    for _ in 0..10 {
        match client.alloc_id().await {
            Ok(id) => {
                after = id;
                break;
            }
            Err(ClientError::Timeout) => continue,
            Err(err) => panic!("unexpected error during failover: {err}"),
        }
    }
    assert!(after > before, "ids stay monotone across the failover");

    client.close();
    b.stop();
}

#[tokio::test]
#[serial]
async fn container_and_resource_flow_over_the_wire() {
    let hub = ElectionHub::new(Duration::from_millis(300));
    let coord = TestCoordinator::start(1, hub.clone(), shared_backend()).await;
    coord.wait_leader().await;

    let client = client_for(hub);
    for id in 1..=3 {
        client.put_container(container_meta(id)).await.unwrap();
        let got = client.get_container(id).await.unwrap();
        assert_eq!(got.id, id);
        let rsp = client.container_heartbeat(container_stats(id, 0)).await.unwrap();
        assert!(rsp.steps.is_empty());
    }

    // Unknown containers are an error.
    assert!(matches!(
        client.get_container(99).await,
        Err(ClientError::Server(_))
    ));

    // Create a resource with explicit peers, watch it round-trip.
    client
        .create_resources(vec![resource_meta(1, &[1, 2, 3])])
        .await
        .unwrap();
    let rules = client.get_applied_rules(1).await.unwrap();
    assert_eq!(rules.len(), 1, "the default placement rule applies");

    // Two-phase destroy over the wire.
    let state = client
        .create_destroying(1, 1, true, vec![100, 101, 102])
        .await
        .unwrap();
    assert_eq!(state, meridian_coord::meta::ResourceState::Destroying);
    for replica in [100, 101] {
        client.report_destroyed(1, replica).await.unwrap();
    }
    let (destroying, destroyed) = client.check_resource_state(vec![1]).await.unwrap();
    assert_eq!(destroying, vec![1]);
    assert!(destroyed.is_empty());
    let state = client.report_destroyed(1, 102).await.unwrap();
    assert_eq!(state, meridian_coord::meta::ResourceState::Destroyed);

    client.close();
    coord.stop();
}

#[tokio::test]
#[serial]
async fn watcher_receives_init_then_created() {
    let hub = ElectionHub::new(Duration::from_millis(300));
    let coord = TestCoordinator::start(1, hub.clone(), shared_backend()).await;
    coord.wait_leader().await;

    let client = client_for(hub);
    for id in 1..=3 {
        client.put_container(container_meta(id)).await.unwrap();
    }

    let mut events = client.watch(EventFlags::ALL).await.unwrap();
    let init = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("init event in time")
        .unwrap();
    match init {
        Event::Init { containers, .. } => assert_eq!(containers.len(), 3),
        other => panic!("expected init, got {other:?}"),
    }

    client
        .create_resources(vec![resource_meta(7, &[1, 2, 3])])
        .await
        .unwrap();
    let created = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("create event in time")
        .unwrap();
    assert!(matches!(created, Event::ResourceCreated(r) if r.id == 7));

    client.close();
    coord.stop();
}

#[tokio::test]
#[serial]
async fn close_fails_inflight_and_future_calls() {
    let hub = ElectionHub::new(Duration::from_millis(300));
    // No coordinator at all: calls sit in the queue until closed.
    let client = client_for(hub);

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.alloc_id().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.close();

    let result = pending.await.unwrap();
    assert_eq!(result.unwrap_err(), ClientError::Closed);
    assert_eq!(client.alloc_id().await.unwrap_err(), ClientError::Closed);

    // Closing twice is fine.
    client.close();
}

#[tokio::test]
#[serial]
async fn follower_rejects_and_client_reroutes() {
    let hub = ElectionHub::new(Duration::from_millis(300));
    let backend = shared_backend();
    let a = TestCoordinator::start(1, hub.clone(), backend.clone()).await;
    a.wait_leader().await;
    let b = TestCoordinator::start(2, hub.clone(), backend).await;

    // Point the client straight at the follower: every call is answered
    // NotLeader until the getter is consulted again.
    let follower_addr = b.addr.to_string();
    let leader_addr = a.addr.to_string();
    let flips = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let getter = {
        let flips = flips.clone();
        Arc::new(move || {
            let n = flips.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Some(if n == 0 { follower_addr.clone() } else { leader_addr.clone() })
        })
    };
    let client = CoordClient::new(
        ClientOptions::new(getter).with_rpc_timeout(Duration::from_secs(2)),
    );

    let id = client.alloc_id().await.unwrap();
    assert!(id > 0);
    assert!(flips.load(std::sync::atomic::Ordering::SeqCst) >= 2);

    client.close();
    a.stop();
    b.stop();
}
