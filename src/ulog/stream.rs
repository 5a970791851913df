//! # ULog Stream Ingest
//!
//! Wraps one [`UlogDecoder`] for a single log source. The transport thread
//! pushes chunks; the sampler reads the latest decoded values once per tick.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use super::decoder::{ParseStats, SystemInfo, UlogDecoder};
use super::protocol::{TypeTag, Value};
use crate::error::{RecorderError, Result};
use crate::model::{Channels, LogValueSource};

/// Thread-safe ingest of one ULog byte stream
#[derive(Debug, Default)]
pub struct UlogStream {
    decoder: Mutex<UlogDecoder>,
    header_ok: AtomicBool,
    logging: AtomicBool,
}

impl UlogStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn decoder(&self) -> MutexGuard<'_, UlogDecoder> {
        self.decoder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push a received chunk and decode every complete record
    ///
    /// The file header is validated on the first 16 bytes of the stream.
    ///
    /// # Arguments
    ///
    /// * `data` - Received chunk
    /// * `offset` - Start of the first complete record in `data`
    /// * `in_sequence` - False if chunks were lost since the previous push
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeader` if the stream is not a ULog stream. The
    /// stream must then be [`restart`](Self::restart)ed from a clean source.
    pub fn push(&self, data: &[u8], offset: usize, in_sequence: bool) -> Result<ParseStats> {
        let mut decoder = self.decoder();
        decoder.feed(data, offset, in_sequence);

        if !self.header_ok.load(Ordering::Acquire) {
            match decoder.check_header() {
                Ok(_) => self.header_ok.store(true, Ordering::Release),
                Err(RecorderError::Truncated { .. }) => return Ok(ParseStats::default()),
                Err(e) => return Err(e),
            }
        }

        Ok(decoder.parse_available())
    }

    /// Drop all decoder state and wait for a new header
    pub fn restart(&self) {
        info!("Restarting ULog stream");
        self.decoder().reset();
        self.header_ok.store(false, Ordering::Release);
    }

    /// Whether a valid header has been seen
    pub fn header_ok(&self) -> bool {
        self.header_ok.load(Ordering::Acquire)
    }

    pub fn field_catalog(&self) -> BTreeMap<String, TypeTag> {
        self.decoder().build_field_catalog()
    }

    pub fn system_info(&self) -> SystemInfo {
        self.decoder().system_info().clone()
    }

    pub fn parameters(&self) -> HashMap<String, Value> {
        self.decoder().parameters().clone()
    }

    /// Run `f` with shared access to the decoder
    pub fn with_decoder<R>(&self, f: impl FnOnce(&UlogDecoder) -> R) -> R {
        f(&self.decoder())
    }
}

impl LogValueSource for UlogStream {
    fn is_logging(&self) -> bool {
        self.logging.load(Ordering::Acquire)
    }

    fn set_logging(&self, enabled: bool) {
        let was = self.logging.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            info!("ULog ingestion {}", if enabled { "enabled" } else { "disabled" });
            if enabled && !self.header_ok() {
                warn!("ULog ingestion enabled before a valid header was received");
            }
        }
    }

    fn values(&self) -> Channels {
        self.decoder().numeric_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ulog::encoder::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_header_split_across_pushes() {
        let stream = UlogStream::new();
        let header = encode_header(5);

        assert_eq!(assert_ok!(stream.push(&header[..8], 0, true)), ParseStats::default());
        assert!(!stream.header_ok());

        assert_ok!(stream.push(&header[8..], 0, true));
        assert!(stream.header_ok());
    }

    #[test]
    fn test_invalid_header_reported() {
        let stream = UlogStream::new();
        let result = stream.push(b"definitely not a ulog file", 0, true);
        assert!(matches!(result, Err(RecorderError::InvalidHeader)));
        assert!(!stream.header_ok());
    }

    #[test]
    fn test_values_after_data() {
        let stream = UlogStream::new();
        let mut bytes = encode_header(0);
        bytes.extend(encode_format("battery", "uint64_t timestamp;float voltage;"));
        bytes.extend(encode_add_logged(0, 0, "battery"));
        let mut body = 10u64.to_le_bytes().to_vec();
        body.extend_from_slice(&12.5f32.to_le_bytes());
        bytes.extend(encode_data(0, &body));

        let stats = stream.push(&bytes, 0, true).unwrap();
        assert_eq!(stats.data, 1);
        assert_eq!(stream.values()["battery_0.voltage"], 12.5);
        assert!(stream.field_catalog().contains_key("battery_0.voltage"));
    }

    #[test]
    fn test_restart_requires_new_header() {
        let stream = UlogStream::new();
        stream.push(&encode_header(0), 0, true).unwrap();
        stream.restart();
        assert!(!stream.header_ok());
        assert_err!(stream.push(b"garbage garbage garbage", 0, true));
    }

    #[test]
    fn test_logging_flag() {
        let stream = UlogStream::new();
        assert!(!stream.is_logging());
        stream.set_logging(true);
        assert!(stream.is_logging());
        stream.set_logging(false);
        assert!(!stream.is_logging());
    }
}
