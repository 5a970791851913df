//! # Telemetry Recorder Library
//!
//! Decode ULog flight logs and record unified telemetry sessions.
//!
//! This library provides a streaming decoder for the ULog binary log format
//! and a fixed-rate sampler that merges live telemetry with decoded log
//! values into a session of samples.

pub mod config;
pub mod error;
pub mod model;
pub mod sampler;
pub mod telemetry;
pub mod ulog;
