//! Sampler lifecycle modes.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle mode of the sampler
///
/// Every mode except `Stopped` appends samples to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SamplerMode {
    Stopped = 0,
    /// Pre-collect: recording before the start trigger
    Armed = 1,
    Collecting = 2,
    /// Post-collect: recording until a deferred stop fires
    Stopping = 3,
}

impl SamplerMode {
    pub fn is_active(self) -> bool {
        self != SamplerMode::Stopped
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SamplerMode::Armed,
            2 => SamplerMode::Collecting,
            3 => SamplerMode::Stopping,
            _ => SamplerMode::Stopped,
        }
    }
}

impl fmt::Display for SamplerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SamplerMode::Stopped => "stopped",
            SamplerMode::Armed => "armed",
            SamplerMode::Collecting => "collecting",
            SamplerMode::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Mode cell; every transition is a single atomic update
#[derive(Debug)]
pub(crate) struct AtomicMode(AtomicU8);

impl AtomicMode {
    pub(crate) fn new(mode: SamplerMode) -> Self {
        Self(AtomicU8::new(mode as u8))
    }

    pub(crate) fn load(&self) -> SamplerMode {
        SamplerMode::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, mode: SamplerMode) {
        self.0.store(mode as u8, Ordering::Release);
    }

    /// Move `from -> to`; false if the mode was not `from`
    pub(crate) fn transition(&self, from: SamplerMode, to: SamplerMode) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
