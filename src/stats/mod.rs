//! Sliding-window traffic statistics per image and per instance.
//!
//! Every event updates each configured window size at once. Series are keyed
//! by image (and instance), so unrelated images never share a lock; counters
//! themselves are plain atomics.

pub mod window;

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::DashMap;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::core::{Clock, CoreError, CoreResult};

use window::{Bucket, WindowSlot};

/// Classification of a served request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    #[serde(rename = "error_4xx")]
    Error4xx,
    #[serde(rename = "error_5xx")]
    Error5xx,
}

impl Outcome {
    pub fn from_status(status: u16) -> Self {
        match status {
            400..=499 => Outcome::Error4xx,
            500..=599 => Outcome::Error5xx,
            _ => Outcome::Success,
        }
    }
}

/// Counter values of one window, read at a single instant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub window_seconds: u64,
    pub window_start: u64,
    pub req_count: u64,
    pub bytes_tx: u64,
    pub errors_4xx: u64,
    pub errors_5xx: u64,
    pub rps_avg: f64,
}

impl StatsSnapshot {
    /// Zero counters for a window that saw no traffic.
    pub fn empty(
        image: &str,
        instance_id: Option<&str>,
        window_seconds: u64,
        window_start: u64,
    ) -> Self {
        Self {
            image: image.to_string(),
            instance_id: instance_id.map(str::to_string),
            window_seconds,
            window_start,
            req_count: 0,
            bytes_tx: 0,
            errors_4xx: 0,
            errors_5xx: 0,
            rps_avg: 0.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SeriesKey {
    image: String,
    instance_id: Option<String>,
}

struct Series {
    slots: Vec<WindowSlot>,
    last_event: AtomicU64,
}

impl Series {
    fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_event.load(Ordering::Relaxed))
    }

    fn slot(&self, window_seconds: u64) -> Option<&WindowSlot> {
        self.slots
            .iter()
            .find(|s| s.duration_secs() == window_seconds)
    }
}

pub struct StatsAggregator {
    series: DashMap<SeriesKey, Arc<Series>>,
    windows: Vec<u64>,
    archive_depth: usize,
    clock: Arc<dyn Clock>,
}

impl StatsAggregator {
    pub fn new(windows_seconds: &[u64], archive_depth: usize, clock: Arc<dyn Clock>) -> Self {
        let mut windows: Vec<u64> = windows_seconds.iter().copied().filter(|w| *w > 0).collect();
        windows.sort_unstable();
        windows.dedup();
        Self {
            series: DashMap::new(),
            windows,
            archive_depth,
            clock,
        }
    }

    /// Configured window sizes in seconds, ascending.
    pub fn windows(&self) -> &[u64] {
        &self.windows
    }

    /// Count one request for `image` (and `instance_id`) in every window.
    pub fn record(&self, image: &str, instance_id: Option<&str>, outcome: Outcome, bytes: u64) {
        self.apply(image, instance_id, outcome, bytes, true);
    }

    /// Add the bytes and error class of a request that was already counted.
    pub fn record_completion(
        &self,
        image: &str,
        instance_id: Option<&str>,
        outcome: Outcome,
        bytes: u64,
    ) {
        self.apply(image, instance_id, outcome, bytes, false);
    }

    pub fn snapshot(&self, image: &str, window_seconds: u64) -> CoreResult<StatsSnapshot> {
        self.read_series(image, None, window_seconds)
    }

    pub fn instance_snapshot(
        &self,
        image: &str,
        instance_id: &str,
        window_seconds: u64,
    ) -> CoreResult<StatsSnapshot> {
        self.read_series(image, Some(instance_id), window_seconds)
    }

    /// Closed windows of `image`, newest first.
    pub fn archive(&self, image: &str, window_seconds: u64) -> CoreResult<Vec<StatsSnapshot>> {
        let series = self.lookup(image, None)?;
        let slot = self.slot_of(&series, window_seconds)?;
        // rotate first so a window that just closed shows up here
        slot.current(self.clock.now_millis());
        Ok(slot
            .archived()
            .iter()
            .map(|b| to_snapshot(image, None, window_seconds, b))
            .collect())
    }

    /// Images with recorded traffic, sorted.
    pub fn images(&self) -> Vec<String> {
        let images: BTreeSet<String> = self
            .series
            .iter()
            .filter(|e| e.key().instance_id.is_none())
            .map(|e| e.key().image.clone())
            .collect();
        images.into_iter().collect()
    }

    /// Instances of `image` with recorded traffic, sorted.
    pub fn instances(&self, image: &str) -> Vec<String> {
        let ids: BTreeSet<String> = self
            .series
            .iter()
            .filter(|e| e.key().image == image)
            .filter_map(|e| e.key().instance_id.clone())
            .collect();
        ids.into_iter().collect()
    }

    fn apply(
        &self,
        image: &str,
        instance_id: Option<&str>,
        outcome: Outcome,
        bytes: u64,
        count_request: bool,
    ) {
        let now = self.clock.now_millis();
        self.add_to(series_key(image, None), now, outcome, bytes, count_request);
        if let Some(id) = instance_id {
            self.add_to(series_key(image, Some(id)), now, outcome, bytes, count_request);
        }
    }

    /// Counts into the series while holding its map entry, so a concurrent
    /// [`StatsAggregator::prune_idle`] cannot drop it mid-update.
    fn add_to(
        &self,
        key: SeriesKey,
        now: u64,
        outcome: Outcome,
        bytes: u64,
        count_request: bool,
    ) {
        loop {
            if let Some(series) = self.series.get(&key) {
                series.last_event.fetch_max(now, Ordering::Relaxed);
                for slot in &series.slots {
                    slot.current(now).add(outcome, bytes, count_request);
                }
                return;
            }
            self.series.entry(key.clone()).or_insert_with(|| {
                Arc::new(Series {
                    slots: self
                        .windows
                        .iter()
                        .map(|w| WindowSlot::new(*w, self.archive_depth, now))
                        .collect(),
                    last_event: AtomicU64::new(now),
                })
            });
        }
    }

    /// How long a series may stay silent before it is dropped: by then every
    /// window it counted into has rolled out of the audit archive.
    pub fn retention_millis(&self) -> u64 {
        let longest = self.windows.last().copied().unwrap_or(1);
        longest
            .saturating_mul(1000)
            .saturating_mul(self.archive_depth as u64 + 1)
    }

    /// Drop series with no events within [`StatsAggregator::retention_millis`].
    /// Returns how many were removed.
    pub fn prune_idle(&self) -> usize {
        let now = self.clock.now_millis();
        let retention = self.retention_millis();
        let mut removed = 0;
        self.series.retain(|key, series| {
            let keep = series.idle_for(now) < retention;
            if !keep {
                debug!(
                    "Dropping idle stats series {}/{}",
                    key.image,
                    key.instance_id.as_deref().unwrap_or("*")
                );
                removed += 1;
            }
            keep
        });
        removed
    }

    /// Counters of the last fully elapsed `window_seconds` window.
    ///
    /// A window without traffic reads as zeros; `not_found` means the series
    /// itself is unknown.
    pub fn closed_snapshot(
        &self,
        image: &str,
        instance_id: Option<&str>,
        window_seconds: u64,
    ) -> CoreResult<StatsSnapshot> {
        let series = self.lookup(image, instance_id)?;
        let slot = self.slot_of(&series, window_seconds)?;
        let now = self.clock.now_millis();
        Ok(match slot.previous(now) {
            Some(bucket) => to_snapshot(image, instance_id, window_seconds, &bucket),
            None => {
                let start = slot.previous_start(now);
                StatsSnapshot::empty(image, instance_id, window_seconds, start)
            }
        })
    }

    fn lookup(&self, image: &str, instance_id: Option<&str>) -> CoreResult<Arc<Series>> {
        self.series
            .get(&series_key(image, instance_id))
            .map(|s| s.value().clone())
            .ok_or_else(|| match instance_id {
                Some(id) => CoreError::NotFound(format!("no traffic for instance '{id}' of '{image}'")),
                None => CoreError::NotFound(format!("no traffic for image '{image}'")),
            })
    }

    fn slot_of<'a>(&self, series: &'a Series, window_seconds: u64) -> CoreResult<&'a WindowSlot> {
        series.slot(window_seconds).ok_or_else(|| {
            CoreError::NotFound(format!(
                "window {window_seconds}s is not configured (available: {:?})",
                self.windows
            ))
        })
    }

    fn read_series(
        &self,
        image: &str,
        instance_id: Option<&str>,
        window_seconds: u64,
    ) -> CoreResult<StatsSnapshot> {
        let series = self.lookup(image, instance_id)?;
        let slot = self.slot_of(&series, window_seconds)?;
        let bucket = slot.current(self.clock.now_millis());
        Ok(to_snapshot(image, instance_id, window_seconds, &bucket))
    }
}

fn series_key(image: &str, instance_id: Option<&str>) -> SeriesKey {
    SeriesKey {
        image: image.to_string(),
        instance_id: instance_id.map(str::to_string),
    }
}

fn to_snapshot(
    image: &str,
    instance_id: Option<&str>,
    window_seconds: u64,
    bucket: &Bucket,
) -> StatsSnapshot {
    let counters = bucket.read();
    StatsSnapshot {
        image: image.to_string(),
        instance_id: instance_id.map(str::to_string),
        window_seconds,
        window_start: bucket.start_millis(),
        req_count: counters.req_count,
        bytes_tx: counters.bytes_tx,
        errors_4xx: counters.errors_4xx,
        errors_5xx: counters.errors_5xx,
        rps_avg: counters.req_count as f64 / window_seconds as f64,
    }
}
