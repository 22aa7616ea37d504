//! Instance record store.
//!
//! Records live in a [`DashMap`] keyed by `instance_id`, so every per-record
//! mutation runs under that record's shard lock and is linearizable. A
//! secondary `image -> ids` index keeps routing snapshots cheap.
//!
//! Lock order is always record shard first, index shard second. Readers of the
//! index release it before touching records, so the two maps never deadlock.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use dashmap::{mapref::entry::Entry, DashMap};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::{Clock, CoreError, CoreResult};

use super::{InstanceSpec, InstanceStatus, ServiceInstance};

/// Filter accepted by [`InstanceStore::snapshot`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SnapshotFilter {
    pub name: Option<String>,
    pub image: Option<String>,
    pub status: Option<InstanceStatus>,
}

impl SnapshotFilter {
    pub fn healthy(image: &str) -> Self {
        Self {
            name: None,
            image: Some(image.to_string()),
            status: Some(InstanceStatus::Healthy),
        }
    }

    fn matches(&self, inst: &ServiceInstance) -> bool {
        self.name.as_ref().map_or(true, |n| *n == inst.name)
            && self.image.as_ref().map_or(true, |i| *i == inst.image)
            && self.status.map_or(true, |s| s == inst.status)
    }
}

/// Outcome of one sweep pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: Vec<String>,
    pub evicted: Vec<String>,
    pub skipped: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.evicted.is_empty() && self.skipped.is_empty()
    }
}

pub struct InstanceStore {
    records: DashMap<String, ServiceInstance>,
    by_image: DashMap<String, BTreeSet<String>>,
    clock: Arc<dyn Clock>,
    default_ttl_seconds: u64,
}

impl InstanceStore {
    pub fn new(clock: Arc<dyn Clock>, default_ttl_seconds: u64) -> Self {
        Self {
            records: DashMap::new(),
            by_image: DashMap::new(),
            clock,
            default_ttl_seconds: default_ttl_seconds.max(1),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Insert or replace the record for `spec.instance_id`.
    ///
    /// Replacing keeps `registered_at` but refreshes the deadline and revives
    /// an expired record. An id already owned by another name/image pair is
    /// rejected with `duplicate_id`.
    pub fn register(&self, spec: InstanceSpec) -> CoreResult<ServiceInstance> {
        spec.validate()
            .map_err(|e| CoreError::InvalidInstance(e.to_string()))?;

        let id = spec
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let ttl = spec.ttl_seconds.unwrap_or(self.default_ttl_seconds);

        match self.records.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = entry.get();
                if existing.name != spec.name || existing.image != spec.image {
                    warn!(
                        "Rejecting register of '{id}' as {}/{}: owned by {}/{}",
                        spec.name, spec.image, existing.name, existing.image
                    );
                    return Err(CoreError::DuplicateId(format!(
                        "instance '{id}' is already registered as {}/{}",
                        existing.name, existing.image
                    )));
                }

                let now = self.clock.now_millis();
                let record = entry.get_mut();
                let registered_at = record.registered_at;
                let last_heartbeat = record.last_heartbeat;
                *record = ServiceInstance::from_spec(id.clone(), spec, ttl, now);
                record.registered_at = registered_at;
                record.last_heartbeat = last_heartbeat;
                record.refresh(now);
                debug!("Re-registered instance '{id}' (expires at {})", record.expires_at);
                Ok(record.clone())
            }
            Entry::Vacant(entry) => {
                let now = self.clock.now_millis();
                let record = ServiceInstance::from_spec(id.clone(), spec, ttl, now);
                let image = record.image.clone();
                let stored = entry.insert(record);
                // index while the record shard is still held
                self.by_image.entry(image).or_default().insert(id.clone());
                info!(
                    "Registered instance '{id}' for image '{}' at {}",
                    stored.image,
                    stored.address()
                );
                Ok(stored.clone())
            }
        }
    }

    /// Refresh the deadline of a known instance, reviving it when expired.
    pub fn heartbeat(&self, instance_id: &str) -> CoreResult<ServiceInstance> {
        let mut record = self
            .records
            .get_mut(instance_id)
            .ok_or_else(|| CoreError::NotFound(format!("instance '{instance_id}'")))?;

        let now = self.clock.now_millis();
        if record.refresh(now) {
            info!("Instance '{instance_id}' revived by heartbeat");
        }
        Ok(record.clone())
    }

    /// Remove an instance. Returns whether it existed; unknown ids are not an error.
    pub fn delete(&self, instance_id: &str) -> bool {
        match self.records.entry(instance_id.to_string()) {
            Entry::Occupied(entry) => {
                self.unindex(&entry.get().image, instance_id);
                entry.remove();
                info!("Deleted instance '{instance_id}'");
                true
            }
            Entry::Vacant(_) => {
                debug!("Delete of unknown instance '{instance_id}' ignored");
                false
            }
        }
    }

    pub fn get(&self, instance_id: &str) -> Option<ServiceInstance> {
        let now = self.clock.now_millis();
        self.records
            .get(instance_id)
            .map(|r| Self::observed(r.value(), now))
    }

    /// Point-in-time copy of the records matching `filter`, sorted by `instance_id`.
    ///
    /// Each record is cloned under its shard lock, so no caller ever observes a
    /// record mid-update. Status is reported as observed now: a healthy record
    /// past its deadline is returned as expired.
    pub fn snapshot(&self, filter: &SnapshotFilter) -> Vec<ServiceInstance> {
        let now = self.clock.now_millis();

        let mut out: Vec<ServiceInstance> = match &filter.image {
            Some(image) => {
                let ids: Vec<String> = self
                    .by_image
                    .get(image)
                    .map(|ids| ids.iter().cloned().collect())
                    .unwrap_or_default();
                ids.iter()
                    .filter_map(|id| self.records.get(id).map(|r| Self::observed(r.value(), now)))
                    .filter(|inst| filter.matches(inst))
                    .collect()
            }
            None => self
                .records
                .iter()
                .map(|r| Self::observed(r.value(), now))
                .filter(|inst| filter.matches(inst))
                .collect(),
        };

        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        out
    }

    /// Healthy instances of `image`, sorted by `instance_id`.
    pub fn healthy_instances(&self, image: &str) -> Vec<ServiceInstance> {
        self.snapshot(&SnapshotFilter::healthy(image))
    }

    /// Images with at least one record.
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self
            .by_image
            .iter()
            .filter(|e| !e.value().is_empty())
            .map(|e| e.key().clone())
            .collect();
        images.sort();
        images
    }

    /// True while at least one record of `image` exists, expired or not.
    pub fn knows_image(&self, image: &str) -> bool {
        self.by_image.get(image).is_some_and(|ids| !ids.is_empty())
    }

    /// All records grouped by image.
    pub fn services_map(&self) -> BTreeMap<String, Vec<ServiceInstance>> {
        let mut map: BTreeMap<String, Vec<ServiceInstance>> = BTreeMap::new();
        for inst in self.snapshot(&SnapshotFilter::default()) {
            map.entry(inst.image.clone()).or_default().push(inst);
        }
        map
    }

    /// `(healthy, expired)` record counts as observed now.
    pub fn counts(&self) -> (usize, usize) {
        let now = self.clock.now_millis();
        self.records.iter().fold((0, 0), |(h, e), r| {
            if r.value().is_live(now) {
                (h + 1, e)
            } else {
                (h, e + 1)
            }
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// One sweep pass: demote lapsed records and evict those past `grace_millis`.
    ///
    /// Every decision re-reads the record and the clock inside the record's
    /// critical section, so a heartbeat that lands before the check always wins.
    /// Each record transitions independently; a pass may stop between records.
    pub fn sweep(&self, grace_millis: u64) -> SweepReport {
        let mut report = SweepReport::default();
        let ids: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();

        for id in ids {
            let Entry::Occupied(mut entry) = self.records.entry(id.clone()) else {
                debug!("Instance '{id}' vanished before sweep, skipping");
                continue;
            };

            if let Err(reason) = entry.get().check_consistency() {
                warn!("Skipping inconsistent record during sweep: {reason}");
                report.skipped.push(id);
                continue;
            }

            let now = self.clock.now_millis();
            let record = entry.get_mut();
            match record.status {
                InstanceStatus::Healthy if now > record.expires_at => {
                    record.status = InstanceStatus::Expired;
                    record.expired_at = Some(now);
                    debug!(
                        "Instance '{id}' expired (deadline {}, now {now})",
                        record.expires_at
                    );
                    report.expired.push(id);
                }
                InstanceStatus::Expired => {
                    let expired_at = record.expired_at.unwrap_or(now);
                    if now > expired_at.saturating_add(grace_millis) {
                        self.unindex(&record.image, &id);
                        entry.remove();
                        debug!("Instance '{id}' evicted after grace period");
                        report.evicted.push(id);
                    }
                }
                InstanceStatus::Healthy => {}
            }
        }

        report
    }

    fn observed(record: &ServiceInstance, now: u64) -> ServiceInstance {
        let mut inst = record.clone();
        if inst.status == InstanceStatus::Healthy && now > inst.expires_at {
            inst.status = InstanceStatus::Expired;
            inst.expired_at = Some(inst.expires_at);
        }
        inst
    }

    // Caller must hold the record's shard lock.
    fn unindex(&self, image: &str, instance_id: &str) {
        if let Some(mut ids) = self.by_image.get_mut(image) {
            ids.remove(instance_id);
        }
        self.by_image.remove_if(image, |_, ids| ids.is_empty());
    }
}
