//! Shared in-memory live model updated by a link handler.

use std::sync::{PoisonError, RwLock};

use super::{LiveModel, LiveSnapshot};

/// Live model backed by a lock-protected snapshot
///
/// The link handler writes through [`SharedLiveModel::update`]; the sampler
/// reads a full copy on every tick.
#[derive(Debug, Default)]
pub struct SharedLiveModel {
    state: RwLock<LiveSnapshot>,
}

impl SharedLiveModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate the snapshot in place
    pub fn update<F: FnOnce(&mut LiveSnapshot)>(&self, f: F) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut state);
    }

    pub fn set_connected(&self, connected: bool) {
        self.update(|s| s.connected = connected);
    }
}

impl LiveModel for SharedLiveModel {
    fn is_connected(&self) -> bool {
        self.state.read().unwrap_or_else(PoisonError::into_inner).connected
    }

    fn snapshot(&self) -> LiveSnapshot {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_visible_in_snapshot() {
        let model = SharedLiveModel::new();
        assert!(!model.is_connected());

        model.set_connected(true);
        model.update(|s| s.battery.voltage = 11.7);

        assert!(model.is_connected());
        assert_eq!(model.snapshot().battery.voltage, 11.7);
    }
}
