//! # ULog Stream Decoder
//!
//! Stateful parser that turns a ULog byte stream into typed, named values.
//!
//! The decoder owns:
//! - a pending byte buffer fed by the transport
//! - the format registry (`Format` records)
//! - the subscription table (`AddLogged` records)
//! - the parameter table and per-parameter update history
//! - the latest-value table fed by `Data` records
//!
//! Decode faults are local: a record that cannot be decoded is replaced by
//! [`Record::Placeholder`] and parsing continues with the next frame. Only a
//! bad file header is reported to the caller.
//!
//! A decoder is not meant to be fed from more than one thread.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bytes::{Buf, BytesMut};
use tracing::{debug, info, warn};

use super::protocol::*;
use crate::error::{RecorderError, Result};

/// Initial capacity of the pending byte buffer
const DEFAULT_BUFFER_CAPACITY: usize = 32 * 1024;

/// Subscription table entry: msg id -> (format, instance)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub format: String,
    pub multi_id: u8,
}

/// A parameter value received after the first one for the same name
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterUpdate {
    pub value: Value,
    /// Wall-clock receipt time in milliseconds since the Unix epoch
    pub received_ms: i64,
}

/// System identification captured from `Info` records
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub name: Option<String>,
    pub hw_version: Option<String>,
    pub sw_version: Option<String>,
    /// UTC time reference in microseconds
    pub utc_reference_us: Option<i64>,
}

impl fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let unknown = "n/a";
        write!(
            f,
            "Sys:{} HWVer:{} SWVer:{} UTCref:{}",
            self.name.as_deref().unwrap_or(unknown),
            self.hw_version.as_deref().unwrap_or(unknown),
            self.sw_version.as_deref().unwrap_or(unknown),
            self.utc_reference_us.unwrap_or(0)
        )
    }
}

/// Counters returned by [`UlogDecoder::parse_available`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub records: usize,
    pub data: usize,
    pub placeholders: usize,
}

/// ULog stream decoder
#[derive(Debug)]
pub struct UlogDecoder {
    buffer: BytesMut,
    start_timestamp: Option<u64>,
    formats: HashMap<String, MessageFormat>,
    subscriptions: Vec<Option<Subscription>>,
    parameters: HashMap<String, Value>,
    parameter_updates: HashMap<String, Vec<ParameterUpdate>>,
    latest: HashMap<String, Value>,
    system: SystemInfo,
    nested_parsing_done: bool,
    first_data_timestamp: Option<u64>,
    last_data_timestamp: Option<u64>,
}

impl Default for UlogDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl UlogDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_BUFFER_CAPACITY),
            start_timestamp: None,
            formats: HashMap::new(),
            subscriptions: Vec::new(),
            parameters: HashMap::new(),
            parameter_updates: HashMap::new(),
            latest: HashMap::new(),
            system: SystemInfo::default(),
            nested_parsing_done: false,
            first_data_timestamp: None,
            last_data_timestamp: None,
        }
    }

    /// Clear every table and the pending buffer
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Append bytes received from the transport
    ///
    /// # Arguments
    ///
    /// * `data` - Received chunk
    /// * `offset` - Start of the first complete record within `data`
    /// * `in_sequence` - False when chunks were lost; the pending buffer is
    ///   then discarded and refilled from `offset`, since any partial record
    ///   held in it can no longer be completed
    pub fn feed(&mut self, data: &[u8], offset: usize, in_sequence: bool) {
        if in_sequence {
            self.buffer.extend_from_slice(data);
        } else {
            self.buffer.clear();
            self.buffer.extend_from_slice(data.get(offset..).unwrap_or_default());
        }
    }

    /// Number of bytes buffered and not yet consumed
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }

    /// Consume and validate the file header
    ///
    /// # Returns
    ///
    /// * `Result<u64>` - Log start timestamp in microseconds
    ///
    /// # Errors
    ///
    /// - `Truncated` if fewer than 16 bytes are buffered (nothing consumed)
    /// - `InvalidHeader` if any of the 7 magic bytes differ; all pending
    ///   bytes are discarded and the stream must be restarted
    pub fn check_header(&mut self) -> Result<u64> {
        if self.buffer.len() < ULOG_HEADER_SIZE {
            return Err(RecorderError::Truncated {
                needed: ULOG_HEADER_SIZE,
                available: self.buffer.len(),
            });
        }

        if self.buffer[..ULOG_MAGIC.len()] != ULOG_MAGIC {
            warn!("ULog header mismatch, discarding {} pending bytes", self.buffer.len());
            self.buffer.clear();
            return Err(RecorderError::InvalidHeader);
        }

        let version = self.buffer[ULOG_MAGIC.len()];
        if version != ULOG_VERSION {
            info!("ULog version {} differs from expected {}, trying anyway", version, ULOG_VERSION);
        }

        self.buffer.advance(ULOG_MAGIC.len() + 1);
        let start = self.buffer.get_u64_le();
        info!("ULog logging started at {} us", start);
        self.start_timestamp = Some(start);
        Ok(start)
    }

    /// Pop one framed record
    ///
    /// Returns `None` when the buffered bytes do not yet hold a complete
    /// frame. Nothing is consumed in that case, so the caller re-invokes
    /// after feeding more bytes and no record is ever torn.
    pub fn read_message(&mut self) -> Option<Record> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let size = u16::from_le_bytes([self.buffer[0], self.buffer[1]]) as usize;
        let kind = MessageKind::from(self.buffer[2]);
        if size > self.buffer.len() - FRAME_HEADER_SIZE {
            return None;
        }

        self.buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.buffer.split_to(size);

        let record = self.decode_record(kind, &payload).unwrap_or_else(|e| {
            warn!("Substituting placeholder for {:?} record ({} bytes): {}", kind, size, e);
            Record::Placeholder { size }
        });
        Some(record)
    }

    fn decode_record(&self, kind: MessageKind, payload: &[u8]) -> Result<Record> {
        let record = match kind {
            MessageKind::Format => Record::Format(MessageFormat::parse(payload)?),
            MessageKind::Data => Record::Data(self.decode_data(payload)?),
            MessageKind::Info => {
                let (key, value) = parse_key_value(payload)?;
                Record::Info { key, value }
            }
            MessageKind::Parameter => {
                let (key, value) = parse_key_value(payload)?;
                Record::Parameter { key, value }
            }
            MessageKind::AddLogged => {
                check_len(payload, 3, "AddLogged")?;
                Record::AddLogged {
                    multi_id: payload[0],
                    msg_id: u16::from_le_bytes([payload[1], payload[2]]),
                    name: trimmed_string(&payload[3..]),
                }
            }
            MessageKind::Dropout => {
                check_len(payload, 2, "Dropout")?;
                Record::Dropout {
                    duration_ms: u16::from_le_bytes([payload[0], payload[1]]),
                }
            }
            MessageKind::Log => {
                check_len(payload, 9, "Log")?;
                let mut ts = [0u8; 8];
                ts.copy_from_slice(&payload[1..9]);
                Record::Log {
                    level: payload[0],
                    timestamp: u64::from_le_bytes(ts),
                    text: trimmed_string(&payload[9..]),
                }
            }
            MessageKind::RemoveLogged | MessageKind::Sync => Record::Skipped(kind),
            MessageKind::Unknown(tag) => Record::Unknown {
                tag,
                size: payload.len(),
            },
        };
        Ok(record)
    }

    fn decode_data(&self, payload: &[u8]) -> Result<DataRecord> {
        check_len(payload, 2, "Data")?;
        let msg_id = u16::from_le_bytes([payload[0], payload[1]]);

        let subscription = self
            .subscriptions
            .get(msg_id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| RecorderError::Format(format!("Unknown DATA subscription ID: {}", msg_id)))?;

        let format = self
            .formats
            .get(&subscription.format)
            .ok_or_else(|| RecorderError::Format(format!("No format for {}", subscription.format)))?;

        Ok(DataRecord {
            format: format.name.clone(),
            multi_id: subscription.multi_id,
            values: format.decode(&payload[2..])?,
        })
    }

    /// Apply a record to the decoder tables
    pub fn dispatch(&mut self, record: Record) {
        match record {
            Record::Format(format) => {
                debug!("Format {} with {} fields", format.name, format.fields.len());
                self.formats.insert(format.name.clone(), format);
            }
            Record::AddLogged { msg_id, multi_id, name } => {
                self.add_subscription(msg_id, multi_id, &name);
            }
            Record::Data(data) => self.apply_data(&data),
            Record::Info { key, value } => self.apply_info(&key, value),
            Record::Parameter { key, value: Some(value) } => {
                self.record_parameter(&key, value, chrono::Utc::now().timestamp_millis());
            }
            Record::Parameter { key, value: None } => {
                debug!("Ignoring parameter {} with unsupported type", key);
            }
            Record::Dropout { duration_ms } => {
                info!("ULog dropout of {} ms", duration_ms);
            }
            Record::Log { level, timestamp, text } => {
                debug!("ULog message [{}] at {}: {}", level, timestamp, text);
            }
            Record::Unknown { tag, size } => {
                debug!("Skipped unknown record type 0x{:02X} ({} bytes)", tag, size);
            }
            Record::Skipped(_) | Record::Placeholder { .. } => {}
        }
    }

    /// Read and dispatch every complete record currently buffered
    pub fn parse_available(&mut self) -> ParseStats {
        let mut stats = ParseStats::default();
        while let Some(record) = self.read_message() {
            stats.records += 1;
            match record {
                Record::Data(_) => stats.data += 1,
                Record::Placeholder { .. } => stats.placeholders += 1,
                _ => {}
            }
            self.dispatch(record);
        }
        stats
    }

    fn add_subscription(&mut self, msg_id: u16, multi_id: u8, name: &str) {
        // No Format may follow the first subscription, so nested references
        // can now be resolved.
        if !self.nested_parsing_done {
            self.resolve_formats();
            self.nested_parsing_done = true;
        }

        let Some(format) = self.formats.get_mut(name) else {
            warn!("Format of subscribed message not found: {}", name);
            return;
        };
        format.max_multi_id = format.max_multi_id.max(multi_id);

        let index = msg_id as usize;
        if index >= self.subscriptions.len() {
            self.subscriptions.resize(index + 1, None);
        }
        self.subscriptions[index] = Some(Subscription {
            format: name.to_string(),
            multi_id,
        });
        debug!("Subscribed {}_{} as id {}", name, multi_id, msg_id);
    }

    /// Resolve nested types, then strip trailing padding, for every known format.
    ///
    /// Both passes are idempotent.
    pub fn resolve_formats(&mut self) {
        let snapshot = self.formats.clone();
        for format in self.formats.values_mut() {
            format.resolve_nested(&snapshot);
        }
        for format in self.formats.values_mut() {
            format.remove_trailing_padding();
        }
    }

    /// Flatten a data record into the latest-value table
    ///
    /// Keys are `"{format}_{multi_id}.{field}"`, with `"[{i}]"` appended per
    /// array element. Padding and `timestamp` fields are not stored; the
    /// timestamp is tracked separately.
    pub fn apply_data(&mut self, record: &DataRecord) {
        let Some(format) = self.formats.get(&record.format) else {
            return;
        };

        let prefix = format!("{}_{}", record.format, record.multi_id);
        let mut values = record.values.iter();
        for field in &format.fields {
            let chunk: Vec<&Value> = values.by_ref().take(field.len()).collect();

            if field.name == TIMESTAMP_FIELD {
                if let Some(ts) = chunk.first().and_then(|v| v.as_f64()) {
                    self.first_data_timestamp.get_or_insert(ts as u64);
                    self.last_data_timestamp = Some(ts as u64);
                }
                continue;
            }
            if field.is_padding() {
                continue;
            }

            if field.is_array() {
                for (i, value) in chunk.into_iter().enumerate() {
                    self.latest
                        .insert(format!("{}.{}[{}]", prefix, field.name, i), value.clone());
                }
            } else if let Some(value) = chunk.into_iter().next() {
                self.latest.insert(format!("{}.{}", prefix, field.name), value.clone());
            }
        }
    }

    fn apply_info(&mut self, key: &str, value: Option<Value>) {
        match (key, value) {
            ("sys_name", Some(Value::Text(text))) => self.system.name = Some(text),
            ("ver_hw", Some(Value::Text(text))) => self.system.hw_version = Some(text),
            ("ver_sw", Some(Value::Text(text))) => self.system.sw_version = Some(text),
            ("time_ref_utc", Some(value)) => {
                if let Some(secs) = value.as_f64() {
                    self.system.utc_reference_us = Some(secs as i64 * 1_000_000);
                }
            }
            (other, _) => debug!("Info {}", other),
        }
    }

    /// Record a parameter value
    ///
    /// The first value seen for a name is authoritative. Later values are
    /// appended to that name's update history and never replace it.
    pub fn record_parameter(&mut self, name: &str, value: Value, received_ms: i64) {
        if self.parameters.contains_key(name) {
            debug!("Update to parameter {}: {:?} at t = {}", name, value, received_ms);
            self.parameter_updates
                .entry(name.to_string())
                .or_default()
                .push(ParameterUpdate { value, received_ms });
        } else {
            self.parameters.insert(name.to_string(), value);
        }
    }

    /// Build the list of plottable keys
    ///
    /// Covers every active, non-internal subscription, every instance id up
    /// to the highest one observed, every field except padding and
    /// `timestamp`, with arrays expanded per element.
    pub fn build_field_catalog(&self) -> BTreeMap<String, TypeTag> {
        let mut catalog = BTreeMap::new();

        for subscription in self.subscriptions.iter().flatten() {
            let Some(format) = self.formats.get(&subscription.format) else {
                continue;
            };
            if format.is_internal() {
                continue;
            }

            for field in &format.fields {
                if field.is_padding() || field.name == TIMESTAMP_FIELD {
                    continue;
                }
                let Some(tag) = field.type_tag() else { continue };

                for mid in 0..=format.max_multi_id {
                    let key = format!("{}_{}.{}", format.name, mid, field.name);
                    match field.array_len {
                        Some(n) => {
                            for j in 0..n {
                                catalog.insert(format!("{}[{}]", key, j), tag);
                            }
                        }
                        None => {
                            catalog.insert(key, tag);
                        }
                    }
                }
            }
        }
        catalog
    }

    /// Numeric snapshot of the latest-value table
    pub fn numeric_values(&self) -> BTreeMap<String, f64> {
        self.latest
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
            .collect()
    }

    pub fn latest_values(&self) -> &HashMap<String, Value> {
        &self.latest
    }

    pub fn formats(&self) -> &HashMap<String, MessageFormat> {
        &self.formats
    }

    pub fn subscription(&self, msg_id: u16) -> Option<&Subscription> {
        self.subscriptions.get(msg_id as usize).and_then(Option::as_ref)
    }

    pub fn parameters(&self) -> &HashMap<String, Value> {
        &self.parameters
    }

    /// Values received after the authoritative one, in arrival order
    pub fn parameter_updates(&self, name: &str) -> &[ParameterUpdate] {
        self.parameter_updates.get(name).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn system_info(&self) -> &SystemInfo {
        &self.system
    }

    /// Log start timestamp from the header, once checked
    pub fn start_timestamp(&self) -> Option<u64> {
        self.start_timestamp
    }

    /// (first, last) `timestamp` field values seen in data records
    pub fn data_time_range(&self) -> Option<(u64, u64)> {
        self.first_data_timestamp.zip(self.last_data_timestamp)
    }
}

fn check_len(payload: &[u8], needed: usize, what: &str) -> Result<()> {
    if payload.len() < needed {
        return Err(RecorderError::Format(format!(
            "{} payload too short: {} bytes",
            what,
            payload.len()
        )));
    }
    Ok(())
}

fn trimmed_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string()
}
