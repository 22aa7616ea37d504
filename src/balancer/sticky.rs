//! Rendezvous (highest random weight) hashing for session affinity.
//!
//! Each candidate gets the score `hash(key, instance_id)` and the highest score
//! wins. Removing an instance only remaps the keys that ranked it first.

use sha2::{Digest, Sha256};

use crate::registry::ServiceInstance;

fn score(key: &str, instance_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(instance_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Index of the instance `key` maps to, ties broken by the lower `instance_id`.
pub fn pick(key: &str, instances: &[ServiceInstance]) -> Option<usize> {
    instances
        .iter()
        .enumerate()
        .map(|(idx, inst)| (score(key, &inst.instance_id), idx))
        .max_by(|(sa, ia), (sb, ib)| {
            sa.cmp(sb)
                .then_with(|| instances[*ib].instance_id.cmp(&instances[*ia].instance_id))
        })
        .map(|(_, idx)| idx)
}
