use std::sync::atomic::{AtomicBool, Ordering};

/// Readiness flag indicating whether the state stores are initialized.
///
/// This is used by the readiness probe endpoints and by the routing path to
/// tell "still starting" apart from "this image has no healthy instances".
/// Each platform owns its own handle; clone the `Arc` to share it.
#[derive(Debug, Default)]
pub struct Readiness {
    ready: AtomicBool,
}

/// What completed initialization, for log output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySource {
    Stores,
    StaticSeed,
}

impl ReadySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadySource::Stores => "stores",
            ReadySource::StaticSeed => "static seed",
        }
    }
}

impl Readiness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the platform as ready.
    ///
    /// Should be called once after the stores are constructed and any static
    /// instances/policies from the configuration have been applied.
    pub fn mark_ready(&self, source: ReadySource) {
        self.ready.store(true, Ordering::SeqCst);
        log::info!("Initialization finished ({}), service is ready", source.as_str());
    }

    /// Check if the platform is ready to handle traffic.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Flip back to not ready, e.g. during shutdown.
    pub fn reset(&self) {
        self.ready.store(false, Ordering::SeqCst);
        log::debug!("Readiness status reset");
    }
}
