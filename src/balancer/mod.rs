//! Routing facade tying the registry, the policy store and the stats together.

pub mod engine;
pub mod sticky;

use std::{collections::HashMap, sync::Arc};

use log::debug;
use once_cell::sync::Lazy;
use prometheus::{register_int_counter_vec, IntCounterVec};
use serde::Serialize;

use crate::{
    core::{Clock, CoreError, CoreResult, Readiness},
    policy::PolicyStore,
    registry::InstanceStore,
    stats::{Outcome, StatsAggregator},
};

pub use engine::{RouteDecision, RoutingEngine};

/// `image` label of routing attempts for images the registry has never seen.
pub const UNKNOWN_IMAGE_LABEL: &str = "(unknown)";

static ROUTE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pingmesh_route_total",
        "Routing decisions by image and result",
        &["image", "result"]
    )
    .unwrap()
});

/// Named request attributes a sticky key can refer to.
///
/// Names follow the `arg_<query>`, `cookie_<name>`, `http_<header>` scheme,
/// plus `uri` and `remote_addr`.
pub trait RequestAttributes {
    fn attribute(&self, name: &str) -> Option<String>;
}

impl RequestAttributes for HashMap<String, String> {
    fn attribute(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Request without any attributes.
pub struct NoAttributes;

impl RequestAttributes for NoAttributes {
    fn attribute(&self, _name: &str) -> Option<String> {
        None
    }
}

/// Result of a routing call. An empty pool is an expected outcome, not a fault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RouteOutcome {
    Routed(RouteDecision),
    NoHealthyInstance { image: String },
}

impl RouteOutcome {
    pub fn decision(&self) -> Option<&RouteDecision> {
        match self {
            RouteOutcome::Routed(decision) => Some(decision),
            RouteOutcome::NoHealthyInstance { .. } => None,
        }
    }

    pub fn into_result(self) -> CoreResult<RouteDecision> {
        match self {
            RouteOutcome::Routed(decision) => Ok(decision),
            RouteOutcome::NoHealthyInstance { image } => Err(CoreError::NoHealthyInstance(
                format!("no healthy instance for image '{image}'"),
            )),
        }
    }
}

pub struct Balancer {
    registry: Arc<InstanceStore>,
    policies: Arc<PolicyStore>,
    stats: Arc<StatsAggregator>,
    readiness: Arc<Readiness>,
    engine: RoutingEngine,
}

impl Balancer {
    pub fn new(
        registry: Arc<InstanceStore>,
        policies: Arc<PolicyStore>,
        stats: Arc<StatsAggregator>,
        readiness: Arc<Readiness>,
        least_conn_decay_ms: u64,
    ) -> Self {
        Self {
            registry,
            policies,
            stats,
            readiness,
            engine: RoutingEngine::new(least_conn_decay_ms),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceStore> {
        &self.registry
    }

    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    pub fn stats(&self) -> &Arc<StatsAggregator> {
        &self.stats
    }

    pub fn readiness(&self) -> &Arc<Readiness> {
        &self.readiness
    }

    /// Choose an instance for `image` and count the request against it.
    pub fn route(&self, image: &str, attrs: &dyn RequestAttributes) -> CoreResult<RouteOutcome> {
        let outcome = self.decide(image, attrs, true)?;
        match &outcome {
            RouteOutcome::Routed(decision) => {
                self.stats.record(
                    image,
                    Some(&decision.instance.instance_id),
                    Outcome::Success,
                    0,
                );
                ROUTE_TOTAL.with_label_values(&[image, "routed"]).inc();
            }
            RouteOutcome::NoHealthyInstance { .. } => {
                ROUTE_TOTAL
                    .with_label_values(&[self.image_label(image), "no_healthy_instance"])
                    .inc();
            }
        }
        Ok(outcome)
    }

    /// Same decision as [`Balancer::route`] without touching stats or cursors.
    pub fn preview_route(
        &self,
        image: &str,
        attrs: &dyn RequestAttributes,
    ) -> CoreResult<RouteOutcome> {
        self.decide(image, attrs, false)
    }

    /// Feedback from an edge once the routed request has finished.
    pub fn complete(&self, decision: &RouteDecision, status: u16, bytes: u64) {
        self.stats.record_completion(
            &decision.image,
            Some(&decision.instance.instance_id),
            Outcome::from_status(status),
            bytes,
        );
        self.engine
            .release(decision, self.registry.clock().now_millis());
    }

    /// Image names come from request paths; only registered ones become
    /// metric labels.
    fn image_label<'a>(&self, image: &'a str) -> &'a str {
        if self.registry.knows_image(image) {
            image
        } else {
            UNKNOWN_IMAGE_LABEL
        }
    }

    fn decide(
        &self,
        image: &str,
        attrs: &dyn RequestAttributes,
        commit: bool,
    ) -> CoreResult<RouteOutcome> {
        if !self.readiness.is_ready() {
            return Err(CoreError::NotReady(
                "routing state is not initialized".to_string(),
            ));
        }

        let candidates = self.registry.healthy_instances(image);
        let policy = self.policies.get(image);
        let sticky_value = policy
            .sticky_key
            .as_deref()
            .and_then(|key| attrs.attribute(key))
            .filter(|v| !v.is_empty());

        let now = self.registry.clock().now_millis();
        match self.engine.select(
            image,
            &candidates,
            &policy,
            sticky_value.as_deref(),
            now,
            commit,
        ) {
            Some(decision) => Ok(RouteOutcome::Routed(decision)),
            None => {
                debug!("No healthy instance for image '{image}'");
                Ok(RouteOutcome::NoHealthyInstance {
                    image: image.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{ManualClock, ReadySource},
        policy::{Algorithm, RoutingPolicy},
        registry::InstanceSpec,
    };

    fn balancer() -> Balancer {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let registry = Arc::new(InstanceStore::new(clock.clone(), 30));
        let stats = Arc::new(StatsAggregator::new(&[60], 4, clock.clone()));
        let readiness = Arc::new(Readiness::new());
        readiness.mark_ready(ReadySource::Stores);
        Balancer::new(
            registry,
            Arc::new(PolicyStore::new()),
            stats,
            readiness,
            30_000,
        )
    }

    fn register(balancer: &Balancer, id: &str) {
        balancer
            .registry()
            .register(InstanceSpec {
                instance_id: Some(id.to_string()),
                name: "web".into(),
                image: "demo-app".into(),
                host: "127.0.0.1".into(),
                port: 9001,
                ttl_seconds: Some(10),
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn test_not_ready_is_distinct_from_empty_pool() {
        let clock = Arc::new(ManualClock::new(0));
        let balancer = Balancer::new(
            Arc::new(InstanceStore::new(clock.clone(), 30)),
            Arc::new(PolicyStore::new()),
            Arc::new(StatsAggregator::new(&[60], 4, clock)),
            Arc::new(Readiness::new()),
            1_000,
        );
        let err = balancer.route("demo-app", &NoAttributes).unwrap_err();
        assert_eq!(err.code(), "not_ready");

        balancer.readiness().mark_ready(ReadySource::Stores);
        let outcome = balancer.route("demo-app", &NoAttributes).unwrap();
        assert_eq!(
            outcome.into_result().unwrap_err().code(),
            "no_healthy_instance"
        );
    }

    #[test]
    fn test_route_records_stats_and_preview_does_not() {
        let b = balancer();
        register(&b, "i1");

        let preview = b.preview_route("demo-app", &NoAttributes).unwrap();
        assert!(preview.decision().is_some());
        assert!(b.stats().snapshot("demo-app", 60).is_err());

        b.route("demo-app", &NoAttributes).unwrap();
        let snap = b.stats().instance_snapshot("demo-app", "i1", 60).unwrap();
        assert_eq!(snap.req_count, 1);
    }

    #[test]
    fn test_no_phantom_stats_on_empty_pool() {
        let b = balancer();
        let outcome = b.route("demo-app", &NoAttributes).unwrap();
        assert!(outcome.decision().is_none());
        assert!(b.stats().images().is_empty());
    }

    #[test]
    fn test_unregistered_images_share_one_label() {
        let b = balancer();
        b.route("ghost-image-7f3a", &NoAttributes).unwrap();
        assert!(ROUTE_TOTAL
            .remove_label_values(&["ghost-image-7f3a", "no_healthy_instance"])
            .is_err());
        assert!(
            ROUTE_TOTAL
                .with_label_values(&[UNKNOWN_IMAGE_LABEL, "no_healthy_instance"])
                .get()
                >= 1
        );

        register(&b, "i1");
        assert_eq!(b.image_label("demo-app"), "demo-app");
        assert_eq!(b.image_label("ghost-image-7f3a"), UNKNOWN_IMAGE_LABEL);
    }

    #[test]
    fn test_sticky_attribute_from_request() {
        let b = balancer();
        for id in ["i1", "i2", "i3"] {
            register(&b, id);
        }
        b.policies()
            .set(
                "demo-app",
                RoutingPolicy::new(Algorithm::RoundRobin).with_sticky_key("cookie_session"),
                true,
            )
            .unwrap();

        let attrs: HashMap<String, String> =
            [("cookie_session".to_string(), "abc".to_string())].into();
        let first = b.route("demo-app", &attrs).unwrap().into_result().unwrap();
        assert!(first.sticky);
        for _ in 0..5 {
            let next = b.route("demo-app", &attrs).unwrap().into_result().unwrap();
            assert_eq!(next.instance.instance_id, first.instance.instance_id);
        }
    }

    #[test]
    fn test_complete_feeds_stats_and_releases() {
        let b = balancer();
        register(&b, "i1");
        b.policies()
            .set("demo-app", RoutingPolicy::new(Algorithm::LeastConn), true)
            .unwrap();

        let decision = b
            .route("demo-app", &NoAttributes)
            .unwrap()
            .into_result()
            .unwrap();
        b.complete(&decision, 502, 128);

        let snap = b.stats().instance_snapshot("demo-app", "i1", 60).unwrap();
        assert_eq!(snap.req_count, 1);
        assert_eq!(snap.errors_5xx, 1);
        assert_eq!(snap.bytes_tx, 128);
        assert_eq!(b.engine.load_of("demo-app", "i1"), 0);
    }
}
