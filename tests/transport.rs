//! Coordinated transport integration tests
//!
//! Runs real agents and a coordinator over loopback UDP. JACK itself is
//! absent, so the agents' adapter calls fail softly; the timing machinery,
//! wire protocol, and skew reporting are exercised end to end.

use std::sync::Arc;
use std::time::Duration;

use skeleton_crew::clock::wall_seconds;
use skeleton_crew::transport::{TransportAgent, TransportCoordinator, DEFAULT_SKEW_WARN_MS};
use skeleton_crew::{Event, EventBridge, JackAdapter, Scheduler, TransportState};

async fn spawn_agent(bridge: EventBridge) -> (Arc<TransportAgent>, std::net::SocketAddr) {
    let adapter = Arc::new(JackAdapter::new("skc_itest", bridge.clone()));
    let scheduler = Arc::new(Scheduler::new());
    let agent = Arc::new(
        TransportAgent::bind(0, adapter, scheduler, bridge, DEFAULT_SKEW_WARN_MS)
            .await
            .unwrap(),
    );
    let addr = agent.local_addr().unwrap();
    agent.spawn();
    (agent, addr)
}

#[tokio::test]
async fn coordinated_locate_start_fires_on_both_agents_within_budget() {
    let bridge_a = EventBridge::new();
    let bridge_b = EventBridge::new();
    let mut rx_a = bridge_a.subscribe();
    let mut rx_b = bridge_b.subscribe();

    let (_agent_a, addr_a) = spawn_agent(bridge_a).await;
    let (_agent_b, addr_b) = spawn_agent(bridge_b).await;

    let coordinator = TransportCoordinator::bind(0).await.unwrap();
    coordinator.add_agent(addr_a, "karate");
    coordinator.add_agent(addr_b, "green");

    let before = wall_seconds();
    let target = coordinator.locate_and_start_all(0, 0.2).await;
    assert!(target >= before + 0.2);

    for rx in [&mut rx_a, &mut rx_b] {
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("agent never fired")
            .unwrap();
        match event {
            Event::TransportSkewReported {
                action, skew_ms, ..
            } => {
                assert_eq!(action, "locate_start");
                assert!(skew_ms >= 0.0);
                assert!(skew_ms < 50.0, "skew {skew_ms}ms exceeds test budget");
            }
            other => panic!("unexpected event {}", other.kind()),
        }
    }
}

#[tokio::test]
async fn immediate_locate_start_executes_with_near_zero_skew() {
    let bridge = EventBridge::new();
    let mut rx = bridge.subscribe();
    let (_agent, addr) = spawn_agent(bridge).await;

    let coordinator = TransportCoordinator::bind(0).await.unwrap();
    coordinator.add_agent(addr, "solo");

    // target_instant = now: fires immediately
    coordinator.locate_and_start_all(48_000, 0.0).await;

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("agent never fired")
        .unwrap();
    match event {
        Event::TransportSkewReported { skew_ms, .. } => {
            assert!(skew_ms < 25.0, "skew {skew_ms}ms not near zero");
        }
        other => panic!("unexpected event {}", other.kind()),
    }
}

#[tokio::test]
async fn query_all_collects_a_snapshot_per_agent() {
    let (_agent_a, addr_a) = spawn_agent(EventBridge::new()).await;
    let (_agent_b, addr_b) = spawn_agent(EventBridge::new()).await;

    let coordinator = TransportCoordinator::bind(0).await.unwrap();
    coordinator.add_agent(addr_a, "a");
    coordinator.add_agent(addr_b, "b");

    let snapshot = coordinator.query_all(Duration::from_secs(1)).await;
    assert_eq!(snapshot.len(), 2);
    for reply in snapshot.values() {
        // No JACK in tests: both agents report stopped at frame 0
        assert_eq!(reply.state, TransportState::Stopped);
        assert_eq!(reply.frame, 0);
        assert!(reply.reported_at > 0.0);
    }
}

#[tokio::test]
async fn add_agent_twice_leaves_membership_unchanged() {
    let coordinator = TransportCoordinator::bind(0).await.unwrap();
    let addr = "192.168.32.11:5555".parse().unwrap();

    assert!(coordinator.add_agent(addr, "karate"));
    assert!(!coordinator.add_agent(addr, "karate"));
    assert_eq!(coordinator.agents().len(), 1);
}

#[tokio::test]
async fn past_targets_are_rejected_not_fired() {
    let bridge = EventBridge::new();
    let mut rx = bridge.subscribe();
    let (agent, addr) = spawn_agent(bridge).await;

    let coordinator = TransportCoordinator::bind(0).await.unwrap();
    coordinator.add_agent(addr, "late");

    // Negative pre-roll puts the target in the past
    coordinator.start_all(-2.0).await;

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while agent.rejected_past_count() == 0 {
        assert!(
            std::time::Instant::now() < deadline,
            "rejection never registered"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(rx.try_recv().is_err());
}
