//! End-to-end behavior across the registry, policy, routing and stats layers,
//! driven by a manual clock.

use std::{collections::HashMap, sync::Arc};

use super::{ManualClock, ReadySource, Readiness};
use crate::{
    balancer::{Balancer, NoAttributes, RouteDecision, RouteOutcome},
    export::BillingExporter,
    policy::{Algorithm, PolicyStore, RoutingPolicy},
    registry::{InstanceSpec, InstanceStatus, InstanceStore},
    stats::{Outcome, StatsAggregator},
};

const IMAGE: &str = "demo-app";

struct Mesh {
    clock: Arc<ManualClock>,
    balancer: Balancer,
    exporter: BillingExporter,
}

fn mesh() -> Mesh {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let registry = Arc::new(InstanceStore::new(clock.clone(), 30));
    let stats = Arc::new(StatsAggregator::new(&[60, 300], 4, clock.clone()));
    let readiness = Arc::new(Readiness::new());
    readiness.mark_ready(ReadySource::Stores);

    let balancer = Balancer::new(
        registry,
        Arc::new(PolicyStore::new()),
        stats.clone(),
        readiness,
        30_000,
    );
    let exporter = BillingExporter::new(stats, clock.clone(), 60);
    Mesh {
        clock,
        balancer,
        exporter,
    }
}

fn register(mesh: &Mesh, id: &str, port: u16, ttl_seconds: u64) {
    mesh.balancer
        .registry()
        .register(InstanceSpec {
            instance_id: Some(id.to_string()),
            name: "web".into(),
            image: IMAGE.into(),
            host: "10.0.0.1".into(),
            port,
            ttl_seconds: Some(ttl_seconds),
            ..Default::default()
        })
        .unwrap();
}

fn routed(mesh: &Mesh) -> RouteDecision {
    mesh.balancer
        .route(IMAGE, &NoAttributes)
        .unwrap()
        .into_result()
        .unwrap()
}

fn routed_id(mesh: &Mesh) -> String {
    routed(mesh).instance.instance_id
}

#[test]
fn test_weighted_routing_follows_expiry() {
    let mesh = mesh();
    register(&mesh, "i1", 9001, 5);
    register(&mesh, "i2", 9002, 60);
    mesh.balancer
        .policies()
        .set(
            IMAGE,
            RoutingPolicy::new(Algorithm::WeightedRr).with_weights([("i1", 2), ("i2", 1)]),
            true,
        )
        .unwrap();

    let picks: Vec<String> = (0..3).map(|_| routed_id(&mesh)).collect();
    assert_eq!(picks, ["i1", "i2", "i1"]);

    // i1 lapses while i2 keeps heartbeating.
    mesh.clock.advance_secs(6);
    mesh.balancer.registry().heartbeat("i2").unwrap();
    assert_eq!(routed_id(&mesh), "i2");
    assert_eq!(routed_id(&mesh), "i2");

    let i1 = mesh.balancer.registry().get("i1").unwrap();
    assert_eq!(i1.status, InstanceStatus::Expired);

    let snapshot = mesh.balancer.stats().snapshot(IMAGE, 60).unwrap();
    assert_eq!(snapshot.req_count, 5);
    let i2 = mesh.balancer.stats().instance_snapshot(IMAGE, "i2", 60).unwrap();
    assert_eq!(i2.req_count, 3);
}

#[test]
fn test_round_robin_visits_every_instance() {
    let mesh = mesh();
    for (i, id) in ["a", "b", "c"].iter().enumerate() {
        register(&mesh, id, 9001 + i as u16, 30);
    }

    let mut picks: Vec<String> = (0..3).map(|_| routed_id(&mesh)).collect();
    picks.sort();
    assert_eq!(picks, ["a", "b", "c"]);
}

#[test]
fn test_sticky_key_is_stable_until_membership_changes() {
    let mesh = mesh();
    register(&mesh, "a", 9001, 30);
    register(&mesh, "b", 9002, 30);
    register(&mesh, "c", 9003, 30);
    mesh.balancer
        .policies()
        .set(
            IMAGE,
            RoutingPolicy::new(Algorithm::RoundRobin).with_sticky_key("cookie_session"),
            true,
        )
        .unwrap();

    let attrs = HashMap::from([("cookie_session".to_string(), "user-42".to_string())]);
    let route = || {
        mesh.balancer
            .route(IMAGE, &attrs)
            .unwrap()
            .into_result()
            .unwrap()
    };
    let first = route();
    assert!(first.sticky);
    for _ in 0..10 {
        assert_eq!(route().instance.instance_id, first.instance.instance_id);
    }

    // Removing a different instance leaves the mapping alone.
    let other = ["a", "b", "c"]
        .into_iter()
        .find(|id| *id != first.instance.instance_id)
        .unwrap();
    assert!(mesh.balancer.registry().delete(other));
    assert_eq!(route().instance.instance_id, first.instance.instance_id);
}

#[test]
fn test_empty_pool_only_reports_no_healthy_instance() {
    let mesh = mesh();
    let outcome = mesh.balancer.route(IMAGE, &NoAttributes).unwrap();
    assert!(matches!(outcome, RouteOutcome::NoHealthyInstance { .. }));

    register(&mesh, "a", 9001, 1);
    assert!(mesh.balancer.route(IMAGE, &NoAttributes).unwrap().decision().is_some());

    mesh.clock.advance_secs(2);
    let outcome = mesh.balancer.route(IMAGE, &NoAttributes).unwrap();
    assert!(matches!(outcome, RouteOutcome::NoHealthyInstance { .. }));
}

#[test]
fn test_export_reflects_completed_traffic() {
    let mesh = mesh();
    register(&mesh, "a", 9001, 30);

    let decision = routed(&mesh);
    mesh.balancer.complete(&decision, 200, 512);
    let decision = routed(&mesh);
    mesh.balancer.complete(&decision, 503, 0);
    mesh.balancer
        .stats()
        .record(IMAGE, Some("a"), Outcome::Error4xx, 10);

    // billed once the window has closed
    assert_eq!(mesh.exporter.export().unwrap().body.summaries[0].totals.req_count, 0);
    mesh.clock.advance_secs(60);
    let export = mesh.exporter.export().unwrap();
    assert!(export.verify());
    let summary = export
        .body
        .summaries
        .iter()
        .find(|s| s.image == IMAGE)
        .unwrap();
    assert_eq!(summary.totals.req_count, 3);
    assert_eq!(summary.totals.bytes_tx, 522);
    assert_eq!(summary.totals.errors_4xx, 1);
    assert_eq!(summary.totals.errors_5xx, 1);
}
