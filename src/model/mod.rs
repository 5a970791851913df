//! # Vehicle Model Module
//!
//! Interfaces to the collaborators the sampler reads from on every tick.
//!
//! This module handles:
//! - The live telemetry model (attitude, battery, sensors, link state)
//! - The derived-figure catalog computing virtual channels from raw ones
//! - The per-tick health check
//! - The decoded-log value source

pub mod health;
pub mod live;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use health::VehicleHealthCheck;
pub use live::SharedLiveModel;

/// Named numeric channels of one sample
pub type Channels = BTreeMap<String, f64>;

/// Vehicle attitude in radians
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Attitude {
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

/// Battery state
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Battery {
    /// Voltage in volts
    pub voltage: f32,
    /// Current draw in amperes
    pub current: f32,
    /// Remaining capacity (0-100%)
    pub remaining: f32,
}

/// Sensor availability flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sensors {
    pub imu: bool,
    pub lidar: bool,
    pub gps: bool,
}

/// Discrete status message or event reported by the vehicle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Vehicle time of the message in milliseconds
    pub tms: u64,
    pub severity: u8,
    pub text: String,
}

/// Position estimate from the mapping/SLAM subsystem
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpatialPayload {
    /// Local position (north, east, down) in meters
    pub position: [f32; 3],
    /// Heading in radians
    pub heading: f32,
    /// Estimate quality (0-100)
    pub quality: u8,
}

/// Point-in-time copy of the live telemetry model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveSnapshot {
    pub connected: bool,
    pub armed: bool,
    pub attitude: Attitude,
    pub battery: Battery,
    pub sensors: Sensors,
    pub message: Option<StatusMessage>,
    pub spatial: Option<SpatialPayload>,
    /// Additional raw channels published by the link
    pub channels: Channels,
}

impl LiveSnapshot {
    /// Raw keyed values of this snapshot
    pub fn raw_values(&self) -> Channels {
        let mut values = self.channels.clone();
        values.insert("attitude.roll".to_string(), self.attitude.roll as f64);
        values.insert("attitude.pitch".to_string(), self.attitude.pitch as f64);
        values.insert("attitude.yaw".to_string(), self.attitude.yaw as f64);
        values.insert("battery.voltage".to_string(), self.battery.voltage as f64);
        values.insert("battery.current".to_string(), self.battery.current as f64);
        values.insert("battery.remaining".to_string(), self.battery.remaining as f64);
        values.insert("status.armed".to_string(), if self.armed { 1.0 } else { 0.0 });
        values
    }
}

/// Live telemetry source. Fields may change between any two calls.
#[cfg_attr(test, mockall::automock)]
pub trait LiveModel: Send + Sync {
    /// Whether the telemetry link is up
    fn is_connected(&self) -> bool;

    /// Latest values of every field
    fn snapshot(&self) -> LiveSnapshot;
}

/// Computes derived ("virtual") channels from a set of raw channels
pub trait FigureCatalog: Send + Sync {
    fn compute(&self, raw: &Channels) -> Channels;
}

impl<F> FigureCatalog for F
where
    F: Fn(&Channels) -> Channels + Send + Sync,
{
    fn compute(&self, raw: &Channels) -> Channels {
        self(raw)
    }
}

/// Catalog without any derived figures
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDerivedFigures;

impl FigureCatalog for NoDerivedFigures {
    fn compute(&self, _raw: &Channels) -> Channels {
        Channels::new()
    }
}

/// Check invoked once per sampler tick with the live snapshot
pub trait HealthMonitor: Send + Sync {
    fn check(&self, snapshot: &LiveSnapshot);
}

/// Health monitor that never reports anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHealthCheck;

impl HealthMonitor for NoHealthCheck {
    fn check(&self, _snapshot: &LiveSnapshot) {}
}

/// Latest values decoded from an on-board log stream
pub trait LogValueSource: Send + Sync {
    /// Whether log ingestion is enabled
    fn is_logging(&self) -> bool;

    /// Enable or disable log ingestion
    fn set_logging(&self, enabled: bool);

    /// Numeric snapshot of the latest decoded values
    fn values(&self) -> Channels;
}

/// Log source for setups without an on-board log stream; never ingests
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLogSource;

impl LogValueSource for NoLogSource {
    fn is_logging(&self) -> bool {
        false
    }

    fn set_logging(&self, _enabled: bool) {}

    fn values(&self) -> Channels {
        Channels::new()
    }
}
