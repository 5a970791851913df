//! # ULog Module
//!
//! Decoder for the ULog self-describing binary flight log format.
//!
//! This module handles:
//! - File header validation
//! - Record framing with streaming back-pressure
//! - Format, subscription, parameter and info records
//! - Flattening data records into a latest-value table
//! - Building the catalog of plottable fields

pub mod protocol;
pub mod decoder;
pub mod encoder;
pub mod stream;

pub use decoder::UlogDecoder;
pub use stream::UlogStream;
