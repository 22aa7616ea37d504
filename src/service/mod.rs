//! Network surfaces: the registry and balancer JSON APIs, the readiness
//! probe and the transparent proxy edge.

pub mod balancer;
pub mod edge;
pub mod registry;
pub mod router;
pub mod status;
