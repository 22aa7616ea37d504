//! Per-image routing policies.
//!
//! One policy per image, replaced wholesale on every write. Readers get an
//! `Arc` snapshot, so a policy is never observed half written.

use std::{collections::BTreeMap, fmt, sync::Arc};

use dashmap::DashMap;
use log::{info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::{CoreError, CoreResult};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    LeastConn,
    WeightedRr,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::LeastConn => "least_conn",
            Algorithm::WeightedRr => "weighted_rr",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Algorithm {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "least_conn" => Ok(Algorithm::LeastConn),
            "weighted_rr" => Ok(Algorithm::WeightedRr),
            other => Err(CoreError::PolicyInvalid(format!(
                "unknown algorithm '{other}', expected one of round_robin, least_conn, weighted_rr"
            ))),
        }
    }
}

/// Routing configuration for one image.
#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = "RoutingPolicy::validate_weighted"))]
pub struct RoutingPolicy {
    #[serde(default)]
    pub algorithm: Algorithm,
    /// instance_id -> weight; unlisted instances weigh 1.
    #[serde(default)]
    #[validate(custom(function = "RoutingPolicy::validate_weights"))]
    pub weights: BTreeMap<String, u32>,
    /// Request attribute used for session affinity, e.g. `cookie_session` or `http_x-user`.
    #[serde(default)]
    #[validate(length(min = 1))]
    pub sticky_key: Option<String>,
}

impl RoutingPolicy {
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }

    pub fn with_weights<I, S>(mut self, weights: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        self.weights = weights.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    pub fn with_sticky_key(mut self, key: impl Into<String>) -> Self {
        self.sticky_key = Some(key.into());
        self
    }

    /// Weight configured for `instance_id`, if any.
    pub fn weight_of(&self, instance_id: &str) -> Option<u32> {
        self.weights.get(instance_id).copied()
    }

    /// Parse and validate a JSON payload.
    pub fn from_json(body: &[u8]) -> CoreResult<Self> {
        let policy: RoutingPolicy = serde_json::from_slice(body)
            .map_err(|e| CoreError::PolicyInvalid(format!("malformed policy: {e}")))?;
        policy.check()?;
        Ok(policy)
    }

    /// Run validation and convert failures into `policy_invalid`.
    pub fn check(&self) -> CoreResult<()> {
        self.validate()
            .map_err(|e| CoreError::PolicyInvalid(e.to_string()))
    }

    fn validate_weights(weights: &BTreeMap<String, u32>) -> Result<(), ValidationError> {
        for (id, weight) in weights {
            if *weight < 1 {
                let mut err = ValidationError::new("weight_must_be_at_least_one");
                err.add_param("instance_id".into(), id);
                return Err(err);
            }
        }
        Ok(())
    }

    fn validate_weighted(&self) -> Result<(), ValidationError> {
        if self.algorithm == Algorithm::WeightedRr && self.weights.is_empty() {
            Err(ValidationError::new("weighted_rr_requires_weights"))
        } else {
            Ok(())
        }
    }
}

static DEFAULT_POLICY: Lazy<Arc<RoutingPolicy>> = Lazy::new(|| Arc::new(RoutingPolicy::default()));

/// Last-write-wins store of routing policies keyed by image.
#[derive(Default)]
pub struct PolicyStore {
    policies: DashMap<String, Arc<RoutingPolicy>>,
}

impl PolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the policy of `image`.
    ///
    /// `authorized` is decided by the caller; the store only refuses when it is false.
    pub fn set(
        &self,
        image: &str,
        policy: RoutingPolicy,
        authorized: bool,
    ) -> CoreResult<Arc<RoutingPolicy>> {
        if !authorized {
            warn!("Rejected unauthorized policy update for image '{image}'");
            return Err(CoreError::Unauthorized(
                "policy mutation requires the admin credential".to_string(),
            ));
        }
        if image.is_empty() {
            return Err(CoreError::PolicyInvalid("image must not be empty".to_string()));
        }
        if let Err(e) = policy.check() {
            warn!("Rejected policy for image '{image}': {e}");
            return Err(e);
        }

        let policy = Arc::new(policy);
        self.policies.insert(image.to_string(), policy.clone());
        info!(
            "Routing policy for image '{image}' set to {} ({} weights, sticky: {:?})",
            policy.algorithm,
            policy.weights.len(),
            policy.sticky_key
        );
        Ok(policy)
    }

    /// Stored policy or the default round robin policy.
    pub fn get(&self, image: &str) -> Arc<RoutingPolicy> {
        self.policies
            .get(image)
            .map(|p| p.value().clone())
            .unwrap_or_else(|| DEFAULT_POLICY.clone())
    }

    pub fn contains(&self, image: &str) -> bool {
        self.policies.contains_key(image)
    }

    /// Explicitly set policies, sorted by image.
    pub fn list(&self) -> Vec<(String, Arc<RoutingPolicy>)> {
        let mut out: Vec<_> = self
            .policies
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
