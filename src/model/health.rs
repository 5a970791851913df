//! # Vehicle Health Check
//!
//! Observes the live model for a short window after parameters are loaded
//! or the vehicle is disarmed, then reports pass/fail with the first
//! failure reason.
//!
//! Checks during the window:
//! - battery voltage above a floor
//! - IMU and LIDAR available
//! - attitude stable: max-min roll and max-min pitch below a threshold

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{error, info};

use super::{HealthMonitor, LiveSnapshot};
use crate::config::HealthConfig;
use crate::ulog::protocol::Value;

/// Circuit breaker parameter that disables the IO safety switch when non-zero
const SAFETY_BREAKER_PARAM: &str = "CBRK_IO_SAFETY";

/// Outcome of one observation window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub passed: bool,
    /// First failure reason, if any
    pub reason: Option<String>,
}

#[derive(Debug)]
struct HealthState {
    do_check: bool,
    healthy: bool,
    started: Option<Instant>,
    reason: Option<String>,
    roll: (f32, f32),
    pitch: (f32, f32),
    /// Armed flag of the last observation
    armed: Option<bool>,
    last: Option<HealthReport>,
}

const EMPTY_RANGE: (f32, f32) = (f32::MAX, -f32::MAX);

impl Default for HealthState {
    fn default() -> Self {
        Self {
            do_check: false,
            healthy: true,
            started: None,
            reason: None,
            roll: EMPTY_RANGE,
            pitch: EMPTY_RANGE,
            armed: None,
            last: None,
        }
    }
}

impl HealthState {
    fn open_window(&mut self, now: Instant) {
        self.do_check = true;
        self.healthy = true;
        self.reason = None;
        self.started = Some(now);
        self.roll = EMPTY_RANGE;
        self.pitch = EMPTY_RANGE;
    }

    /// Returns true when the armed flag changed since the last observation
    fn observe_armed(&mut self, armed: bool) -> bool {
        self.armed.replace(armed).is_some_and(|previous| previous != armed)
    }

    fn apply_armed(&mut self, armed: bool, now: Instant) {
        if armed {
            self.do_check = false;
            self.started = None;
        } else {
            info!("Performing health check");
            self.open_window(now);
        }
    }

    fn fail(&mut self, reason: &str) {
        if self.reason.is_none() {
            self.reason = Some(reason.to_string());
        }
        self.healthy = false;
    }
}

/// Returns false when `value` is NaN or widens `range` beyond `max_spread`
fn within_spread(range: &mut (f32, f32), value: f32, max_spread: f32) -> bool {
    if value.is_nan() {
        return false;
    }
    range.0 = range.0.min(value);
    range.1 = range.1.max(value);
    (range.1 - range.0).abs() < max_spread
}

/// Health check over the live model
#[derive(Debug)]
pub struct VehicleHealthCheck {
    config: HealthConfig,
    state: Mutex<HealthState>,
}

impl VehicleHealthCheck {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HealthState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HealthState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a window once vehicle parameters are available
    ///
    /// Fails immediately if the IO safety breaker is set.
    pub fn on_parameters_loaded(&self, params: &HashMap<String, Value>) {
        if !self.config.enabled {
            return;
        }
        info!("Performing health check");
        let mut state = self.lock();
        state.open_window(Instant::now());

        let breaker = params.get(SAFETY_BREAKER_PARAM).and_then(Value::as_f64);
        if breaker.is_some_and(|v| v != 0.0) {
            state.fail("IO SafetyBreaker set");
        }
    }

    /// Disarming opens a window; arming cancels a running one without a report
    ///
    /// [`check`](HealthMonitor::check) detects the same edges from the
    /// snapshot's armed flag, so calling this is only needed when the flag
    /// is known before the next tick.
    pub fn on_armed_changed(&self, armed: bool) {
        if !self.config.enabled {
            return;
        }
        let mut state = self.lock();
        state.observe_armed(armed);
        state.apply_armed(armed, Instant::now());
    }

    /// Report of the most recently closed window
    pub fn last_result(&self) -> Option<HealthReport> {
        self.lock().last.clone()
    }

    /// Whether an observation window is open
    pub fn is_checking(&self) -> bool {
        self.lock().do_check
    }

    fn check_at(&self, snapshot: &LiveSnapshot, now: Instant) {
        let window = Duration::from_millis(self.config.window_ms);
        let mut state = self.lock();

        // The first observation only records the flag
        if state.observe_armed(snapshot.armed) && self.config.enabled {
            state.apply_armed(snapshot.armed, now);
        }

        let in_window = state
            .started
            .is_some_and(|start| now.saturating_duration_since(start) < window);

        if state.do_check && state.healthy && in_window {
            if snapshot.battery.voltage < self.config.min_battery_voltage {
                state.fail("Battery too low");
            }
            if !snapshot.sensors.imu {
                state.fail("IMU not available");
            }
            if !snapshot.sensors.lidar {
                state.fail("LIDAR not available");
            }

            let spread = self.config.max_attitude_spread;
            let roll_ok = within_spread(&mut state.roll, snapshot.attitude.roll, spread);
            let pitch_ok = within_spread(&mut state.pitch, snapshot.attitude.pitch, spread);
            if !(roll_ok && pitch_ok) {
                state.fail("IMU: Pitch/Roll check failed");
            }
        } else if state.do_check {
            state.do_check = false;
            let report = HealthReport {
                passed: state.healthy,
                reason: state.reason.clone(),
            };
            match &report.reason {
                Some(reason) if !report.passed => error!("[health] {}", reason),
                _ => info!("[health] vehicle healthcheck passed"),
            }
            state.last = Some(report);
        }
    }
}

impl HealthMonitor for VehicleHealthCheck {
    fn check(&self, snapshot: &LiveSnapshot) {
        self.check_at(snapshot, Instant::now());
    }
}
