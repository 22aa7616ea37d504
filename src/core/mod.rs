//! Core building blocks shared by every pingmesh component.
//!
//! The error taxonomy, the injected clock and the readiness flag live here;
//! the stores and engines in the sibling modules are built on top of them.

pub mod clock;
pub mod error;
pub mod status;

#[cfg(test)]
mod tests;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult, ErrorContext};
pub use status::{ReadySource, Readiness};
