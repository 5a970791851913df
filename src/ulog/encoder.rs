//! # ULog Record Encoder
//!
//! Builds ULog headers and framed records. Used to synthesize streams for
//! replay tooling and tests.
//!
//! Frame structure: size(2, LE) + type(1) + payload(size bytes)

use bytes::{BufMut, BytesMut};

use super::protocol::{MessageKind, ULOG_MAGIC, ULOG_VERSION};

/// Encode the 16-byte file header
///
/// # Arguments
///
/// * `start_timestamp` - Log start time in microseconds
pub fn encode_header(start_timestamp: u64) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_slice(&ULOG_MAGIC);
    buf.put_u8(ULOG_VERSION);
    buf.put_u64_le(start_timestamp);
    buf.to_vec()
}

/// Frame an arbitrary payload with the given record type
///
/// Payloads longer than 65535 bytes are truncated to fit the size field.
pub fn encode_record(kind: MessageKind, payload: &[u8]) -> Vec<u8> {
    let size = payload.len().min(u16::MAX as usize);
    let mut buf = BytesMut::with_capacity(3 + size);
    buf.put_u16_le(size as u16);
    buf.put_u8(kind.into());
    buf.put_slice(&payload[..size]);
    buf.to_vec()
}

/// Encode a `Format` record, e.g. `encode_format("gyro", "uint64_t timestamp;float[3] xyz;")`
pub fn encode_format(name: &str, fields: &str) -> Vec<u8> {
    encode_record(MessageKind::Format, format!("{}:{}", name, fields).as_bytes())
}

/// Encode an `AddLogged` subscription record
pub fn encode_add_logged(msg_id: u16, multi_id: u8, name: &str) -> Vec<u8> {
    let mut payload = BytesMut::with_capacity(3 + name.len());
    payload.put_u8(multi_id);
    payload.put_u16_le(msg_id);
    payload.put_slice(name.as_bytes());
    encode_record(MessageKind::AddLogged, &payload)
}

/// Encode a `Data` record for a subscription id
pub fn encode_data(msg_id: u16, body: &[u8]) -> Vec<u8> {
    let mut payload = BytesMut::with_capacity(2 + body.len());
    payload.put_u16_le(msg_id);
    payload.put_slice(body);
    encode_record(MessageKind::Data, &payload)
}

fn key_value_payload(key: &str, value: &[u8]) -> BytesMut {
    let mut payload = BytesMut::with_capacity(1 + key.len() + value.len());
    payload.put_u8(key.len() as u8);
    payload.put_slice(key.as_bytes());
    payload.put_slice(value);
    payload
}

/// Encode a float `Parameter` record
pub fn encode_parameter_f32(name: &str, value: f32) -> Vec<u8> {
    let payload = key_value_payload(&format!("float {}", name), &value.to_le_bytes());
    encode_record(MessageKind::Parameter, &payload)
}

/// Encode an int32 `Parameter` record
pub fn encode_parameter_i32(name: &str, value: i32) -> Vec<u8> {
    let payload = key_value_payload(&format!("int32_t {}", name), &value.to_le_bytes());
    encode_record(MessageKind::Parameter, &payload)
}

/// Encode a text `Info` record (`char[N] key`)
pub fn encode_info_text(key: &str, text: &str) -> Vec<u8> {
    let payload = key_value_payload(&format!("char[{}] {}", text.len(), key), text.as_bytes());
    encode_record(MessageKind::Info, &payload)
}

/// Encode an int32 `Info` record
pub fn encode_info_i32(key: &str, value: i32) -> Vec<u8> {
    let payload = key_value_payload(&format!("int32_t {}", key), &value.to_le_bytes());
    encode_record(MessageKind::Info, &payload)
}

/// Encode a `Log` (logged string) record
pub fn encode_log(level: u8, timestamp: u64, text: &str) -> Vec<u8> {
    let mut payload = BytesMut::with_capacity(9 + text.len());
    payload.put_u8(level);
    payload.put_u64_le(timestamp);
    payload.put_slice(text.as_bytes());
    encode_record(MessageKind::Log, &payload)
}
