//! Service registry: TTL-bound records of backend instances per image.

pub mod store;
pub mod sweeper;

use std::collections::BTreeMap;

use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

pub use store::{InstanceStore, SnapshotFilter, SweepReport};
pub use sweeper::Sweeper;

/// Metadata key carrying an instance's default routing weight.
pub const WEIGHT_METADATA_KEY: &str = "weight";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceStatus {
    #[default]
    Healthy,
    Expired,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Healthy => "HEALTHY",
            InstanceStatus::Expired => "EXPIRED",
        }
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HEALTHY" | "UP" => Ok(InstanceStatus::Healthy),
            "EXPIRED" | "DOWN" => Ok(InstanceStatus::Expired),
            other => Err(format!("unknown instance status '{other}'")),
        }
    }
}

/// Register payload sent by an instance owner.
#[derive(Clone, Debug, Default, Serialize, Deserialize, Validate)]
pub struct InstanceSpec {
    /// Generated when omitted.
    #[serde(default)]
    #[validate(length(min = 1))]
    pub instance_id: Option<String>,
    #[validate(length(min = 1))]
    pub name: String,
    #[validate(length(min = 1))]
    pub image: String,
    #[validate(custom(function = "InstanceSpec::validate_host"))]
    pub host: String,
    #[validate(range(min = 1))]
    pub port: u16,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    #[validate(custom(function = "InstanceSpec::validate_metadata"))]
    pub metadata: BTreeMap<String, String>,
    /// Falls back to the registry default when omitted.
    #[serde(default)]
    #[validate(range(min = 1, max = 86400))]
    pub ttl_seconds: Option<u64>,
}

impl InstanceSpec {
    fn validate_host(host: &str) -> Result<(), ValidationError> {
        let re = Regex::new(r"(?i)^(?:(?:\d{1,3}\.){3}\d{1,3}|\[[0-9a-f:]+\]|[0-9a-f]*:[0-9a-f:]+|[a-z0-9.-]+)$")
            .map_err(|_| ValidationError::new("invalid_host_pattern"))?;

        if re.is_match(host) {
            Ok(())
        } else {
            let mut err = ValidationError::new("invalid_host");
            err.add_param("host".into(), &host.to_string());
            Err(err)
        }
    }

    fn validate_metadata(metadata: &BTreeMap<String, String>) -> Result<(), ValidationError> {
        if let Some(weight) = metadata.get(WEIGHT_METADATA_KEY) {
            match weight.parse::<u32>() {
                Ok(w) if w >= 1 => {}
                _ => {
                    let mut err = ValidationError::new("weight_must_be_positive_integer");
                    err.add_param("weight".into(), weight);
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

/// A registered backend instance with its lifecycle bookkeeping.
///
/// All timestamps are wall-clock epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub name: String,
    pub image: String,
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub registered_at: u64,
    pub last_heartbeat: u64,
    pub ttl_seconds: u64,
    pub expires_at: u64,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<u64>,
}

impl ServiceInstance {
    pub(crate) fn from_spec(id: String, spec: InstanceSpec, ttl_seconds: u64, now: u64) -> Self {
        Self {
            instance_id: id,
            name: spec.name,
            image: spec.image,
            host: spec.host,
            port: spec.port,
            region: spec.region,
            metadata: spec.metadata,
            registered_at: now,
            last_heartbeat: now,
            ttl_seconds,
            expires_at: now.saturating_add(ttl_seconds.saturating_mul(1000)),
            status: InstanceStatus::Healthy,
            expired_at: None,
        }
    }

    /// `host:port` of the instance.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Weight advertised in the instance metadata, if any.
    pub fn metadata_weight(&self) -> Option<u32> {
        self.metadata
            .get(WEIGHT_METADATA_KEY)
            .and_then(|w| w.parse::<u32>().ok())
            .filter(|w| *w >= 1)
    }

    /// Status as observed at `now`: a healthy record past its deadline reads as expired
    /// even before the sweeper has demoted it.
    pub fn effective_status(&self, now: u64) -> InstanceStatus {
        match self.status {
            InstanceStatus::Healthy if now > self.expires_at => InstanceStatus::Expired,
            status => status,
        }
    }

    pub fn is_live(&self, now: u64) -> bool {
        self.effective_status(now) == InstanceStatus::Healthy
    }

    /// Refresh the deadline from a heartbeat observed at `now`.
    ///
    /// The latest timestamp wins: a heartbeat carrying an older time than the one
    /// already recorded never moves the deadline backwards.
    pub(crate) fn refresh(&mut self, now: u64) -> bool {
        let revived = self.status == InstanceStatus::Expired;
        self.last_heartbeat = self.last_heartbeat.max(now);
        self.expires_at = self
            .last_heartbeat
            .saturating_add(self.ttl_seconds.saturating_mul(1000));
        self.status = InstanceStatus::Healthy;
        self.expired_at = None;
        revived
    }

    /// Checks the bookkeeping invariants the sweeper relies on.
    pub(crate) fn check_consistency(&self) -> Result<(), String> {
        if self.ttl_seconds == 0 {
            return Err(format!("instance '{}' has a zero ttl", self.instance_id));
        }
        if self.last_heartbeat < self.registered_at {
            return Err(format!(
                "instance '{}' heartbeat precedes registration",
                self.instance_id
            ));
        }
        if self.status == InstanceStatus::Expired && self.expired_at.is_none() {
            return Err(format!(
                "instance '{}' expired without a timestamp",
                self.instance_id
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> InstanceSpec {
        InstanceSpec {
            instance_id: Some(id.to_string()),
            name: "web".to_string(),
            image: "demo-app".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9001,
            ..Default::default()
        }
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec("web-1").validate().is_ok());

        let mut bad = spec("web-1");
        bad.host = "not a host".to_string();
        assert!(bad.validate().is_err());

        let mut bad = spec("web-1");
        bad.port = 0;
        assert!(bad.validate().is_err());

        let mut bad = spec("web-1");
        bad.ttl_seconds = Some(0);
        assert!(bad.validate().is_err());

        let mut bad = spec("web-1");
        bad.metadata
            .insert(WEIGHT_METADATA_KEY.to_string(), "0".to_string());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_effective_status_and_refresh() {
        let mut inst = ServiceInstance::from_spec("web-1".into(), spec("web-1"), 10, 1_000);
        assert_eq!(inst.expires_at, 11_000);
        assert!(inst.is_live(11_000));
        assert!(!inst.is_live(11_001));

        inst.status = InstanceStatus::Expired;
        inst.expired_at = Some(11_500);
        assert!(inst.refresh(12_000));
        assert_eq!(inst.expires_at, 22_000);
        assert_eq!(inst.status, InstanceStatus::Healthy);

        // stale heartbeat never moves the deadline backwards
        assert!(!inst.refresh(5_000));
        assert_eq!(inst.expires_at, 22_000);
    }

    #[test]
    fn test_address_and_weight() {
        let mut s = spec("web-1");
        s.metadata.insert("weight".into(), "3".into());
        let inst = ServiceInstance::from_spec("web-1".into(), s, 10, 0);
        assert_eq!(inst.address(), "127.0.0.1:9001");
        assert_eq!(inst.metadata_weight(), Some(3));

        let mut s = spec("web-2");
        s.host = "::1".to_string();
        let inst = ServiceInstance::from_spec("web-2".into(), s, 10, 0);
        assert_eq!(inst.address(), "[::1]:9001");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("up".parse::<InstanceStatus>(), Ok(InstanceStatus::Healthy));
        assert_eq!(
            "EXPIRED".parse::<InstanceStatus>(),
            Ok(InstanceStatus::Expired)
        );
        assert!("degraded".parse::<InstanceStatus>().is_err());
    }
}
