//! Selection algorithms and the per-image cursor state they mutate.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use dashmap::DashMap;
use log::debug;
use serde::Serialize;

use crate::{
    policy::{Algorithm, RoutingPolicy},
    registry::ServiceInstance,
};

use super::sticky;

/// Instance picked for one request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub image: String,
    pub instance: ServiceInstance,
    pub algorithm: Algorithm,
    /// Chosen by the sticky layer rather than the algorithm.
    pub sticky: bool,
    /// Timestamp of the least_conn slot this request holds.
    #[serde(skip)]
    pub acquired_at: Option<u64>,
}

/// Cursor data of one image. Entries for instances that left the healthy set
/// are dropped lazily on the next selection.
#[derive(Clone, Debug, Default)]
struct ImageRoutingState {
    rr_cursor: usize,
    credits: HashMap<String, i64>,
    recent: HashMap<String, VecDeque<u64>>,
}

impl ImageRoutingState {
    fn round_robin(&mut self, candidates: &[ServiceInstance]) -> usize {
        let idx = self.rr_cursor % candidates.len();
        self.rr_cursor = self.rr_cursor.wrapping_add(1);
        idx
    }

    /// Smooth weighted round robin: every candidate earns its weight, the
    /// richest one wins and pays back the total.
    fn weighted(&mut self, candidates: &[ServiceInstance], policy: &RoutingPolicy) -> usize {
        self.credits
            .retain(|id, _| candidates.iter().any(|c| c.instance_id == *id));

        let mut total = 0i64;
        let mut best: Option<(usize, i64)> = None;
        for (idx, inst) in candidates.iter().enumerate() {
            let weight = instance_weight(inst, policy) as i64;
            total += weight;
            let credit = self.credits.entry(inst.instance_id.clone()).or_insert(0);
            *credit += weight;
            if best.map_or(true, |(_, c)| *credit > c) {
                best = Some((idx, *credit));
            }
        }

        let (idx, _) = best.unwrap_or((0, 0));
        if let Some(credit) = self.credits.get_mut(&candidates[idx].instance_id) {
            *credit -= total;
        }
        idx
    }

    fn least_conn(&mut self, candidates: &[ServiceInstance], now: u64, decay_ms: u64) -> usize {
        self.prune(candidates, now, decay_ms);
        let mut best = (0usize, usize::MAX);
        for (idx, inst) in candidates.iter().enumerate() {
            let load = self.recent.get(&inst.instance_id).map_or(0, |q| q.len());
            // candidates are sorted by id, strict `<` keeps the lowest id on ties
            if load < best.1 {
                best = (idx, load);
            }
        }
        best.0
    }

    fn prune(&mut self, candidates: &[ServiceInstance], now: u64, decay_ms: u64) {
        self.recent
            .retain(|id, _| candidates.iter().any(|c| c.instance_id == *id));
        for uses in self.recent.values_mut() {
            while uses.front().is_some_and(|t| now.saturating_sub(*t) >= decay_ms) {
                uses.pop_front();
            }
        }
    }

    fn acquire(&mut self, instance_id: &str, now: u64) {
        self.recent
            .entry(instance_id.to_string())
            .or_default()
            .push_back(now);
    }

    /// Drop the slot taken at `acquired_at`, unless it has decayed already and
    /// its place may belong to a later request.
    fn release(&mut self, instance_id: &str, acquired_at: u64, now: u64, decay_ms: u64) {
        if now.saturating_sub(acquired_at) >= decay_ms {
            return;
        }
        if let Some(uses) = self.recent.get_mut(instance_id) {
            if let Some(pos) = uses.iter().position(|t| *t == acquired_at) {
                uses.remove(pos);
            }
        }
    }

    fn load_of(&self, instance_id: &str) -> usize {
        self.recent.get(instance_id).map_or(0, |q| q.len())
    }
}

/// Weight of `inst` under `policy`: policy entry, then instance metadata, then 1.
pub fn instance_weight(inst: &ServiceInstance, policy: &RoutingPolicy) -> u32 {
    policy
        .weight_of(&inst.instance_id)
        .or_else(|| inst.metadata_weight())
        .unwrap_or(1)
        .max(1)
}

/// Per-image routing state behind one short lock per image.
pub struct RoutingEngine {
    states: DashMap<String, Arc<Mutex<ImageRoutingState>>>,
    decay_ms: u64,
}

impl RoutingEngine {
    pub fn new(decay_ms: u64) -> Self {
        Self {
            states: DashMap::new(),
            decay_ms: decay_ms.max(1),
        }
    }

    /// Pick one of `candidates` (healthy, sorted by id).
    ///
    /// With `commit` false the decision is computed on a copy of the cursor
    /// state, leaving the real cursors untouched.
    pub fn select(
        &self,
        image: &str,
        candidates: &[ServiceInstance],
        policy: &RoutingPolicy,
        sticky_value: Option<&str>,
        now: u64,
        commit: bool,
    ) -> Option<RouteDecision> {
        if candidates.is_empty() {
            return None;
        }

        let state = self.state(image);
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        let mut preview;
        let st: &mut ImageRoutingState = if commit {
            &mut *guard
        } else {
            preview = (*guard).clone();
            drop(guard);
            &mut preview
        };

        let sticky_idx = match (policy.sticky_key.as_ref(), sticky_value) {
            (Some(_), Some(value)) => sticky::pick(value, candidates),
            _ => None,
        };

        let idx = match sticky_idx {
            Some(idx) => idx,
            None => match policy.algorithm {
                Algorithm::RoundRobin => st.round_robin(candidates),
                Algorithm::WeightedRr => st.weighted(candidates, policy),
                Algorithm::LeastConn => st.least_conn(candidates, now, self.decay_ms),
            },
        };

        let mut acquired_at = None;
        if policy.algorithm == Algorithm::LeastConn {
            if sticky_idx.is_some() {
                st.prune(candidates, now, self.decay_ms);
            }
            st.acquire(&candidates[idx].instance_id, now);
            acquired_at = Some(now);
        }

        let decision = RouteDecision {
            image: image.to_string(),
            instance: candidates[idx].clone(),
            algorithm: policy.algorithm,
            sticky: sticky_idx.is_some(),
            acquired_at,
        };
        debug!(
            "Selected '{}' for image '{image}' via {}{}",
            decision.instance.instance_id,
            decision.algorithm,
            if decision.sticky { " (sticky)" } else { "" }
        );
        Some(decision)
    }

    /// Give back the least_conn slot of `decision` ahead of its decay, e.g.
    /// once a proxied response has completed.
    pub fn release(&self, decision: &RouteDecision, now: u64) {
        let Some(acquired_at) = decision.acquired_at else {
            return;
        };
        if let Some(state) = self.states.get(&decision.image).map(|s| s.value().clone()) {
            state.lock().unwrap_or_else(|e| e.into_inner()).release(
                &decision.instance.instance_id,
                acquired_at,
                now,
                self.decay_ms,
            );
        }
    }

    /// Recent-use count of an instance as tracked by least_conn.
    pub fn load_of(&self, image: &str, instance_id: &str) -> usize {
        let Some(state) = self.states.get(image).map(|s| s.value().clone()) else {
            return 0;
        };
        let guard = state.lock().unwrap_or_else(|e| e.into_inner());
        guard.load_of(instance_id)
    }

    fn state(&self, image: &str) -> Arc<Mutex<ImageRoutingState>> {
        if let Some(state) = self.states.get(image) {
            return state.value().clone();
        }
        self.states
            .entry(image.to_string())
            .or_default()
            .value()
            .clone()
    }
}
