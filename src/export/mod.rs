//! Billing snapshot export.
//!
//! An export is a read-only view of the stats aggregator for the last fully
//! elapsed window, sealed with a SHA-256 checksum over its serialized body.
//! Running the exporter at least once per window bills every window.

use std::{collections::BTreeSet, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use prometheus::{register_int_counter, IntCounter};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    core::{Clock, CoreError, CoreResult, ErrorContext},
    registry::InstanceStore,
    stats::{StatsAggregator, StatsSnapshot},
};

pub const SCHEMA_VERSION: u32 = 1;

static EXPORTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("pingmesh_exports_total", "Billing exports generated").unwrap()
});

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImageSummary {
    pub image: String,
    pub totals: StatsSnapshot,
    pub instances: Vec<StatsSnapshot>,
}

/// Everything covered by the checksum.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportBody {
    pub schema_version: u32,
    pub generated_at: String,
    pub generated_at_millis: u64,
    pub window_seconds: u64,
    /// Start of the billed window, epoch millis.
    pub window_start: u64,
    pub summaries: Vec<ImageSummary>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillingExport {
    #[serde(flatten)]
    pub body: ExportBody,
    pub checksum: String,
}

impl BillingExport {
    fn seal(body: ExportBody) -> CoreResult<Self> {
        let checksum = checksum(&body)?;
        Ok(Self { body, checksum })
    }

    /// Recompute the checksum and compare it with the stored one.
    pub fn verify(&self) -> bool {
        checksum(&self.body).is_ok_and(|sum| sum == self.checksum)
    }

    pub fn to_json(&self) -> CoreResult<String> {
        serde_json::to_string_pretty(self).with_context("serializing billing export")
    }
}

fn checksum(body: &ExportBody) -> CoreResult<String> {
    let bytes = serde_json::to_vec(body).with_context("serializing export body")?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

/// Counters the exporter bills from.
pub trait UsageSource: Send + Sync {
    fn windows(&self) -> Vec<u64>;
    fn images(&self) -> Vec<String>;
    fn instances(&self, image: &str) -> Vec<String>;
    fn closed_snapshot(
        &self,
        image: &str,
        instance_id: Option<&str>,
        window_seconds: u64,
    ) -> CoreResult<StatsSnapshot>;
}

impl UsageSource for StatsAggregator {
    fn windows(&self) -> Vec<u64> {
        StatsAggregator::windows(self).to_vec()
    }

    fn images(&self) -> Vec<String> {
        StatsAggregator::images(self)
    }

    fn instances(&self, image: &str) -> Vec<String> {
        StatsAggregator::instances(self, image)
    }

    fn closed_snapshot(
        &self,
        image: &str,
        instance_id: Option<&str>,
        window_seconds: u64,
    ) -> CoreResult<StatsSnapshot> {
        StatsAggregator::closed_snapshot(self, image, instance_id, window_seconds)
    }
}

pub struct BillingExporter {
    stats: Arc<dyn UsageSource>,
    registry: Option<Arc<InstanceStore>>,
    clock: Arc<dyn Clock>,
    window_seconds: u64,
}

impl BillingExporter {
    pub fn new(stats: Arc<dyn UsageSource>, clock: Arc<dyn Clock>, window_seconds: u64) -> Self {
        Self {
            stats,
            registry: None,
            clock,
            window_seconds,
        }
    }

    /// Also bill registered images that saw no traffic, with zero counters.
    pub fn with_registry(mut self, registry: Arc<InstanceStore>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Build an export of every known image over the last closed window.
    ///
    /// Never mutates the counters. An image or instance whose counters cannot
    /// be read is logged and left out; the rest of the export still goes out.
    pub fn export(&self) -> CoreResult<BillingExport> {
        let window = self.window_seconds;
        if !self.stats.windows().contains(&window) {
            return Err(CoreError::NotFound(format!(
                "export window {window}s is not a configured stats window"
            )));
        }

        let now = self.clock.now_millis();
        let window_millis = window.saturating_mul(1000);
        let window_start = (now - now % window_millis).saturating_sub(window_millis);

        let mut images: BTreeSet<String> = self.stats.images().into_iter().collect();
        if let Some(registry) = &self.registry {
            images.extend(registry.images());
        }

        let mut summaries = Vec::with_capacity(images.len());
        for image in images {
            let totals = match self.stats.closed_snapshot(&image, None, window) {
                Ok(totals) => totals,
                // registered, never routed
                Err(CoreError::NotFound(_)) => {
                    StatsSnapshot::empty(&image, None, window, window_start)
                }
                Err(e) => {
                    warn!("Leaving image '{image}' out of billing export: {e}");
                    continue;
                }
            };

            let mut instances = Vec::new();
            for id in self.stats.instances(&image) {
                match self.stats.closed_snapshot(&image, Some(&id), window) {
                    Ok(snapshot) => instances.push(snapshot),
                    Err(e) => {
                        warn!("Leaving instance '{id}' of '{image}' out of billing export: {e}")
                    }
                }
            }

            summaries.push(ImageSummary {
                image,
                totals,
                instances,
            });
        }

        let generated_at = DateTime::<Utc>::from_timestamp_millis(now as i64)
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default();

        let export = BillingExport::seal(ExportBody {
            schema_version: SCHEMA_VERSION,
            generated_at,
            generated_at_millis: now,
            window_seconds: window,
            window_start,
            summaries,
        })?;
        EXPORTS_TOTAL.inc();
        Ok(export)
    }
}

/// Destination of periodic exports.
#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn deliver(&self, export: &BillingExport) -> CoreResult<()>;
}

/// Writes a one-line summary of each export to the log.
pub struct LogSink;

#[async_trait]
impl ExportSink for LogSink {
    async fn deliver(&self, export: &BillingExport) -> CoreResult<()> {
        let requests: u64 = export
            .body
            .summaries
            .iter()
            .map(|s| s.totals.req_count)
            .sum();
        info!(
            "Billing export at {}: {} images, {} requests over {}s, checksum {}",
            export.body.generated_at,
            export.body.summaries.len(),
            requests,
            export.body.window_seconds,
            export.checksum
        );
        Ok(())
    }
}

/// Stores each export as `billing-<millis>.json` in a directory.
pub struct FileSink {
    directory: PathBuf,
}

impl FileSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }
}

#[async_trait]
impl ExportSink for FileSink {
    async fn deliver(&self, export: &BillingExport) -> CoreResult<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .with_context("creating export directory")?;
        let path = self
            .directory
            .join(format!("billing-{}.json", export.body.generated_at_millis));
        tokio::fs::write(&path, export.to_json()?)
            .await
            .with_context("writing billing export")?;
        info!("Billing export written to {}", path.display());
        Ok(())
    }
}

/// Periodic exporter running as a pingora background service.
pub struct ExportService {
    exporter: Arc<BillingExporter>,
    sink: Box<dyn ExportSink>,
    interval: Duration,
}

impl ExportService {
    pub fn new(exporter: Arc<BillingExporter>, sink: Box<dyn ExportSink>, interval: Duration) -> Self {
        Self {
            exporter,
            sink,
            interval,
        }
    }

    async fn run_once(&self) {
        match self.exporter.export() {
            Ok(export) => {
                if let Err(e) = self.sink.deliver(&export).await {
                    error!("Failed to deliver billing export: {e}");
                }
            }
            Err(e) => error!("Failed to build billing export: {e}"),
        }
    }
}

#[async_trait]
impl BackgroundService for ExportService {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        info!(
            "Starting billing exporter (interval {:?}, window {}s)",
            self.interval,
            self.exporter.window_seconds()
        );
        let mut ticker = tokio::time::interval(self.interval);
        // the first tick fires immediately; skip it so the first export covers real traffic
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Shutdown signal received, stopping billing exporter");
                        break;
                    }
                },
                _ = ticker.tick() => self.run_once().await,
            }
        }
    }
}
