//! Discovery integration tests
//!
//! Exercises the beacon wire path and the registry projections the way two
//! peers on a LAN would, without real broadcast sockets.

use skeleton_crew::discovery::{
    decode_beacon, encode_frame, Availability, Beacon, ClusterRegistry, FrameKind, ServiceAction,
    ServiceDescriptor, ServiceMessage, ServiceType,
};
use skeleton_crew::{Event, NodeStatus};

mod common;

/// Deliver `from`'s presence to `to` through the actual wire encoding
fn deliver_beacon(to: &ClusterRegistry, from: &skeleton_crew::NodeDescriptor, now_ms: u64) -> Vec<Event> {
    let frame = encode_frame(FrameKind::Beacon, &Beacon::announce(from, now_ms)).unwrap();
    let beacon = decode_beacon(&frame).unwrap();
    to.apply_beacon(beacon, now_ms)
}

#[test]
fn two_nodes_discover_each_other() {
    let indigo = common::node("indigo", "192.168.32.7");
    let karate = common::node("karate", "192.168.32.11");

    let registry_a = common::registry(indigo.clone());
    let registry_b = common::registry(karate.clone());

    // B starts later; each hears the other's next beacon
    let events_a = deliver_beacon(&registry_a, &karate, 3_000);
    let events_b = deliver_beacon(&registry_b, &indigo, 3_100);

    assert_eq!(events_a.len(), 1);
    match &events_a[0] {
        Event::NodeDiscovered { node } => {
            assert_eq!(node.id, "karate");
            assert_eq!(node.host, "192.168.32.11");
        }
        other => panic!("unexpected event {}", other.kind()),
    }
    match &events_b[0] {
        Event::NodeDiscovered { node } => {
            assert_eq!(node.id, "indigo");
            assert_eq!(node.host, "192.168.32.7");
        }
        other => panic!("unexpected event {}", other.kind()),
    }

    assert_eq!(registry_a.node("karate").unwrap().status, NodeStatus::Online);
    assert_eq!(registry_b.node("indigo").unwrap().status, NodeStatus::Online);
}

#[test]
fn repeated_heartbeats_keep_a_node_online_without_noise() {
    let registry = common::registry(common::node("indigo", "192.168.32.7"));
    let karate = common::node("karate", "192.168.32.11");

    deliver_beacon(&registry, &karate, 1_000);
    for t in (2_000..10_000).step_by(2_000) {
        let events = deliver_beacon(&registry, &karate, t);
        assert!(events.is_empty(), "steady heartbeat produced {events:?}");
    }
    assert!(registry.sweep(11_000).is_empty());
    assert_eq!(registry.node("karate").unwrap().status, NodeStatus::Online);
}

#[test]
fn node_loss_keeps_services_visible_but_unavailable() {
    let registry = common::registry(common::node("indigo", "192.168.32.7"));
    let karate = common::node("karate", "192.168.32.11");

    deliver_beacon(&registry, &karate, 1_000);
    registry.apply_service(ServiceMessage {
        action: ServiceAction::Registered,
        service: ServiceDescriptor::new(
            "karate",
            ServiceType::SttEngine,
            "vosk-small",
            "192.168.32.11:2700",
        ),
    });

    // No beacon for longer than the liveness window
    let events = registry.sweep(13_500);
    assert_eq!(events.len(), 1);
    match &events[0] {
        Event::NodeLost { node_id } => assert_eq!(node_id, "karate"),
        other => panic!("unexpected event {}", other.kind()),
    }

    let services = registry.services_by_node("karate");
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].service_name, "vosk-small");
    assert_eq!(services[0].availability, Availability::Unavailable);

    // The healed partition refreshes silently back to online
    deliver_beacon(&registry, &karate, 14_000);
    let services = registry.services_by_node("karate");
    assert_eq!(services[0].availability, Availability::Available);
}

#[test]
fn service_lifecycle_converges_across_the_projection() {
    let registry = common::registry(common::node("indigo", "192.168.32.7"));
    deliver_beacon(&registry, &common::node("karate", "192.168.32.11"), 1_000);

    let mut service = ServiceDescriptor::new(
        "karate",
        ServiceType::TransportAgent,
        "transport_agent",
        "192.168.32.11:5555",
    );
    registry.apply_service(ServiceMessage {
        action: ServiceAction::Registered,
        service: service.clone(),
    });

    assert_eq!(registry.services_by_type(ServiceType::TransportAgent).len(), 1);
    assert!(registry
        .services_by_type(ServiceType::TtsEngine)
        .is_empty());

    service.availability = Availability::Busy;
    let events = registry.apply_service(ServiceMessage {
        action: ServiceAction::Updated,
        service: service.clone(),
    });
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind(), "service_updated");

    registry.apply_service(ServiceMessage {
        action: ServiceAction::Unregistered,
        service,
    });
    assert!(registry.services_by_node("karate").is_empty());
}

#[test]
fn beacon_frames_survive_the_wire_intact() {
    let node = common::node("indigo", "192.168.32.7");
    let frame = encode_frame(FrameKind::Beacon, &Beacon::announce(&node, 42)).unwrap();
    let decoded = decode_beacon(&frame).unwrap();
    let descriptor = decoded.into_descriptor();

    assert_eq!(descriptor.id, node.id);
    assert_eq!(descriptor.host, node.host);
    assert_eq!(descriptor.control_port, node.control_port);
    assert_eq!(descriptor.roles, node.roles);
}
