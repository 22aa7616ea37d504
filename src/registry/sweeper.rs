use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use prometheus::{register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec};

use crate::stats::StatsAggregator;

use super::{InstanceStore, SweepReport};

static SWEEP_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "pingmesh_sweeper_transitions_total",
        "Instance transitions performed by the expiry sweeper",
        &["kind"] // expired | evicted | skipped
    )
    .unwrap()
});

static REGISTRY_INSTANCES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "pingmesh_registry_instances",
        "Instances currently known to the registry",
        &["status"]
    )
    .unwrap()
});

/// Background task demoting lapsed instances and evicting them after a grace period.
///
/// The interval is independent of any instance's TTL; each pass is a call to
/// [`InstanceStore::sweep`]. When given the stats aggregator, each pass also
/// drops traffic series that went silent, evicted instances included.
pub struct Sweeper {
    store: Arc<InstanceStore>,
    stats: Option<Arc<StatsAggregator>>,
    interval: Duration,
    grace: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<InstanceStore>, interval: Duration, grace: Duration) -> Self {
        Self {
            store,
            stats: None,
            interval,
            grace,
        }
    }

    pub fn with_stats(mut self, stats: Arc<StatsAggregator>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Runs a single pass and updates the registry gauges.
    pub fn run_once(&self) -> SweepReport {
        let report = self.store.sweep(self.grace.as_millis() as u64);

        SWEEP_TRANSITIONS
            .with_label_values(&["expired"])
            .inc_by(report.expired.len() as u64);
        SWEEP_TRANSITIONS
            .with_label_values(&["evicted"])
            .inc_by(report.evicted.len() as u64);
        SWEEP_TRANSITIONS
            .with_label_values(&["skipped"])
            .inc_by(report.skipped.len() as u64);

        let (healthy, expired) = self.store.counts();
        REGISTRY_INSTANCES
            .with_label_values(&["HEALTHY"])
            .set(healthy as i64);
        REGISTRY_INSTANCES
            .with_label_values(&["EXPIRED"])
            .set(expired as i64);

        if !report.is_empty() {
            info!(
                "Sweep pass: {} expired, {} evicted, {} skipped",
                report.expired.len(),
                report.evicted.len(),
                report.skipped.len()
            );
        }
        if !report.skipped.is_empty() {
            warn!("Sweep skipped records: {:?}", report.skipped);
        }

        if let Some(stats) = &self.stats {
            let dropped = stats.prune_idle();
            if dropped > 0 {
                info!("Sweep pass dropped {dropped} idle traffic series");
            }
        }

        report
    }
}

#[async_trait]
impl BackgroundService for Sweeper {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        info!(
            "Starting expiry sweeper (interval {:?}, grace {:?})",
            self.interval, self.grace
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown signal received, stopping expiry sweeper");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let report = self.run_once();
                    debug!("Sweep pass finished: {report:?}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{Clock, ManualClock},
        registry::{InstanceSpec, InstanceStatus},
        stats::Outcome,
    };
    use tokio::sync::watch;

    fn spec(id: &str) -> InstanceSpec {
        InstanceSpec {
            instance_id: Some(id.to_string()),
            name: "web".to_string(),
            image: "demo-app".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9001,
            ttl_seconds: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_run_once_reports_transitions() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InstanceStore::new(clock.clone(), 30));
        store.register(spec("web-1")).unwrap();
        store.register(spec("web-2")).unwrap();
        let sweeper = Sweeper::new(store.clone(), Duration::from_millis(10), Duration::ZERO);

        clock.advance_millis(1_001);
        store.heartbeat("web-2").unwrap();
        let report = sweeper.run_once();
        assert_eq!(report.expired, vec!["web-1".to_string()]);

        clock.advance_millis(1);
        let report = sweeper.run_once();
        assert_eq!(report.evicted, vec!["web-1".to_string()]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_run_once_drops_traffic_of_evicted_instances() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InstanceStore::new(clock.clone(), 30));
        let stats = Arc::new(StatsAggregator::new(&[1], 0, clock.clone()));
        store.register(spec("web-1")).unwrap();
        stats.record("demo-app", Some("web-1"), Outcome::Success, 0);

        let sweeper = Sweeper::new(store.clone(), Duration::from_millis(10), Duration::ZERO)
            .with_stats(stats.clone());
        sweeper.run_once();
        assert_eq!(stats.instances("demo-app"), vec!["web-1"]);

        clock.advance_millis(1_001);
        sweeper.run_once();
        clock.advance_millis(1);
        sweeper.run_once();
        assert!(store.is_empty());
        assert!(stats.images().is_empty());
        assert!(stats.instances("demo-app").is_empty());
    }

    #[tokio::test]
    async fn test_background_sweeper_stops_on_shutdown() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(InstanceStore::new(clock.clone(), 30));
        store.register(spec("web-1")).unwrap();
        clock.advance_millis(1_500);

        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            Duration::from_millis(5),
            Duration::ZERO,
        ));
        let (tx, rx) = watch::channel(false);
        let task = {
            let sweeper = sweeper.clone();
            tokio::spawn(async move { sweeper.start(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            store.get("web-1").map(|i| i.status),
            Some(InstanceStatus::Expired)
        );

        // past the (zero) grace period the next pass evicts
        clock.advance_millis(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(store.is_empty());
        assert!(clock.now_millis() > 1_500);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
