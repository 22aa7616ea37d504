//! pingmesh: a service registry with TTL-based liveness and a policy-driven
//! load balancer in front of it, built on pingora.
//!
//! The registry keeps instance records alive through heartbeats and sweeps the
//! ones that lapse. The balancer picks a healthy instance per request using the
//! routing policy of the image, counts the traffic in sliding windows and
//! exports sealed billing snapshots.

pub mod balancer;
pub mod config;
pub mod core;
pub mod export;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod service;
pub mod stats;
pub(crate) mod utils;
