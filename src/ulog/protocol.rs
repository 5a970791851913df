//! # ULog Protocol Constants and Types
//!
//! Core definitions for the ULog binary log format: file header, record
//! framing, primitive field types and the message layouts declared by
//! `Format` records.

use std::collections::HashMap;

use crate::error::{RecorderError, Result};

/// Leading header bytes that must match exactly ("ULog" + 0x01 0x12 0x35)
pub const ULOG_MAGIC: [u8; 7] = [b'U', b'L', b'o', b'g', 0x01, 0x12, 0x35];

/// Expected file format version (8th header byte)
pub const ULOG_VERSION: u8 = 0x00;

/// Total header size: magic(7) + version(1) + start timestamp(8)
pub const ULOG_HEADER_SIZE: usize = 16;

/// Record frame header size: size(2) + type(1)
pub const FRAME_HEADER_SIZE: usize = 3;

/// Prefix of the padding fields the logger inserts for alignment
pub const PADDING_PREFIX: &str = "_padding";

/// Name of the per-message timestamp field
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Formats whose name starts with this are internal to the logger
pub const INTERNAL_FORMAT_PREFIX: char = '_';

/// Maximum depth when resolving nested message types
pub const MAX_NESTING_DEPTH: usize = 8;

/// Largest body a `Data` frame can carry after its 2-byte message id
pub const MAX_DATA_BODY_SIZE: usize = u16::MAX as usize - 2;

/// Record type tag, decoded once at the framing boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Format,
    Data,
    Info,
    Parameter,
    AddLogged,
    RemoveLogged,
    Sync,
    Dropout,
    Log,
    Unknown(u8),
}

impl From<u8> for MessageKind {
    fn from(tag: u8) -> Self {
        match tag {
            b'F' => MessageKind::Format,
            b'D' => MessageKind::Data,
            b'I' => MessageKind::Info,
            b'P' => MessageKind::Parameter,
            b'A' => MessageKind::AddLogged,
            b'R' => MessageKind::RemoveLogged,
            b'S' => MessageKind::Sync,
            b'O' => MessageKind::Dropout,
            b'L' => MessageKind::Log,
            other => MessageKind::Unknown(other),
        }
    }
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Format => b'F',
            MessageKind::Data => b'D',
            MessageKind::Info => b'I',
            MessageKind::Parameter => b'P',
            MessageKind::AddLogged => b'A',
            MessageKind::RemoveLogged => b'R',
            MessageKind::Sync => b'S',
            MessageKind::Dropout => b'O',
            MessageKind::Log => b'L',
            MessageKind::Unknown(tag) => tag,
        }
    }
}

/// Primitive field type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Bool,
    Char,
}

impl TypeTag {
    /// Parse a C type name as used in format definitions
    pub fn parse(name: &str) -> Option<Self> {
        let tag = match name {
            "int8_t" => TypeTag::Int8,
            "uint8_t" => TypeTag::UInt8,
            "int16_t" => TypeTag::Int16,
            "uint16_t" => TypeTag::UInt16,
            "int32_t" => TypeTag::Int32,
            "uint32_t" => TypeTag::UInt32,
            "int64_t" => TypeTag::Int64,
            "uint64_t" => TypeTag::UInt64,
            "float" => TypeTag::Float,
            "double" => TypeTag::Double,
            "bool" => TypeTag::Bool,
            "char" => TypeTag::Char,
            _ => return None,
        };
        Some(tag)
    }

    /// C type name of this tag
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::Int8 => "int8_t",
            TypeTag::UInt8 => "uint8_t",
            TypeTag::Int16 => "int16_t",
            TypeTag::UInt16 => "uint16_t",
            TypeTag::Int32 => "int32_t",
            TypeTag::UInt32 => "uint32_t",
            TypeTag::Int64 => "int64_t",
            TypeTag::UInt64 => "uint64_t",
            TypeTag::Float => "float",
            TypeTag::Double => "double",
            TypeTag::Bool => "bool",
            TypeTag::Char => "char",
        }
    }

    /// Size of one element in bytes
    pub fn size(&self) -> usize {
        match self {
            TypeTag::Int8 | TypeTag::UInt8 | TypeTag::Bool | TypeTag::Char => 1,
            TypeTag::Int16 | TypeTag::UInt16 => 2,
            TypeTag::Int32 | TypeTag::UInt32 | TypeTag::Float => 4,
            TypeTag::Int64 | TypeTag::UInt64 | TypeTag::Double => 8,
        }
    }

    /// Decode one little-endian element. `bytes` must hold at least `self.size()` bytes.
    pub fn decode(&self, bytes: &[u8]) -> Value {
        let mut buf = [0u8; 8];
        buf[..self.size()].copy_from_slice(&bytes[..self.size()]);
        match self {
            TypeTag::Int8 => Value::Int(buf[0] as i8 as i64),
            TypeTag::UInt8 => Value::UInt(buf[0] as u64),
            TypeTag::Int16 => Value::Int(i16::from_le_bytes([buf[0], buf[1]]) as i64),
            TypeTag::UInt16 => Value::UInt(u16::from_le_bytes([buf[0], buf[1]]) as u64),
            TypeTag::Int32 => Value::Int(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as i64),
            TypeTag::UInt32 => Value::UInt(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as u64),
            TypeTag::Int64 => Value::Int(i64::from_le_bytes(buf)),
            TypeTag::UInt64 => Value::UInt(u64::from_le_bytes(buf)),
            TypeTag::Float => Value::Float(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64),
            TypeTag::Double => Value::Float(f64::from_le_bytes(buf)),
            TypeTag::Bool => Value::Bool(buf[0] != 0),
            TypeTag::Char => Value::Char(buf[0] as char),
        }
    }
}

/// A decoded value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
    Char(char),
    Text(String),
}

impl Value {
    /// Numeric view of the value, `None` for text
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            Value::Char(c) => Some(*c as u32 as f64),
            Value::Text(_) => None,
        }
    }
}

/// Type of a field as declared in a format definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    /// Primitive type
    Scalar(TypeTag),
    /// Reference to another format by name, resolved lazily
    Nested(String),
}

/// One field of a message layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Element count for array fields
    pub array_len: Option<usize>,
    /// Byte offset within the payload (meaningful once nested types are resolved)
    pub offset: usize,
}

impl FieldDescriptor {
    /// Parse a `"type name"` or `"type[N] name"` declaration
    pub fn parse(declaration: &str) -> Result<Self> {
        let (type_decl, name) = declaration
            .trim()
            .split_once(' ')
            .ok_or_else(|| RecorderError::Format(format!("Bad field declaration: {:?}", declaration)))?;

        let (type_name, array_len) = parse_type_decl(type_decl)?;
        let kind = match TypeTag::parse(type_name) {
            Some(tag) => FieldKind::Scalar(tag),
            None => FieldKind::Nested(type_name.to_string()),
        };

        Ok(Self {
            name: name.trim().to_string(),
            kind,
            array_len,
            offset: 0,
        })
    }

    /// Primitive type, `None` while still referencing a nested format
    pub fn type_tag(&self) -> Option<TypeTag> {
        match self.kind {
            FieldKind::Scalar(tag) => Some(tag),
            FieldKind::Nested(_) => None,
        }
    }

    pub fn is_array(&self) -> bool {
        self.array_len.is_some()
    }

    /// Number of scalar elements
    pub fn len(&self) -> usize {
        self.array_len.unwrap_or(1)
    }

    /// Total byte size, `None` for unresolved nested fields
    pub fn byte_size(&self) -> Option<usize> {
        self.type_tag().map(|tag| tag.size() * self.len())
    }

    pub fn is_padding(&self) -> bool {
        self.name.contains(PADDING_PREFIX)
    }
}

/// Split `"float[4]"` into `("float", Some(4))`
fn parse_type_decl(type_decl: &str) -> Result<(&str, Option<usize>)> {
    match type_decl.split_once('[') {
        Some((base, rest)) => {
            let len = rest
                .trim_end_matches(']')
                .parse::<usize>()
                .map_err(|_| RecorderError::Format(format!("Bad array length in {:?}", type_decl)))?;
            if len > MAX_DATA_BODY_SIZE {
                return Err(RecorderError::Format(format!("Array too long in {:?}", type_decl)));
            }
            Ok((base, Some(len)))
        }
        None => Ok((type_decl, None)),
    }
}

/// A named record layout declared by a `Format` message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFormat {
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
    /// True once no field references another format
    pub nested_resolved: bool,
    /// Highest multi-instance id seen in a subscription
    pub max_multi_id: u8,
}

impl MessageFormat {
    /// Parse a `Format` payload: `"name:type field;type field;..."`
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(payload);
        let (name, body) = text
            .split_once(':')
            .ok_or_else(|| RecorderError::Format(format!("Format without ':' separator: {:?}", text)))?;

        let fields = body
            .split(';')
            .filter(|decl| !decl.trim().is_empty())
            .map(FieldDescriptor::parse)
            .collect::<Result<Vec<_>>>()?;

        let mut format = Self {
            name: name.to_string(),
            nested_resolved: fields.iter().all(|f| f.type_tag().is_some()),
            fields,
            max_multi_id: 0,
        };
        format.assign_offsets();
        Ok(format)
    }

    /// Payload size in bytes, `None` while nested fields remain
    pub fn size(&self) -> Option<usize> {
        self.fields.iter().map(FieldDescriptor::byte_size).sum()
    }

    /// Internal logger formats are never offered to consumers
    pub fn is_internal(&self) -> bool {
        self.name.starts_with(INTERNAL_FORMAT_PREFIX)
    }

    /// Recompute byte offsets. Fields after an unresolved nested field keep offset 0.
    pub fn assign_offsets(&mut self) {
        let mut offset = Some(0usize);
        for field in &mut self.fields {
            field.offset = offset.unwrap_or(0);
            offset = match (offset, field.byte_size()) {
                (Some(o), Some(size)) => Some(o + size),
                _ => None,
            };
        }
    }

    /// Drop padding fields at the end of the layout; the logger does not write them.
    pub fn remove_trailing_padding(&mut self) {
        while self.fields.last().is_some_and(|f| f.name.starts_with(PADDING_PREFIX)) {
            self.fields.pop();
        }
    }

    /// Expand every nested field into the referenced format's scalar fields.
    ///
    /// Nested fields become `outer.inner` (or `outer[i].inner` for arrays).
    /// A reference that cannot be resolved, or a layout that would not fit in
    /// one data frame, is left in place, so records of this format will fail
    /// to decode and be replaced by placeholders.
    pub fn resolve_nested(&mut self, formats: &HashMap<String, MessageFormat>) {
        if self.nested_resolved {
            return;
        }
        match flatten_fields(&self.fields, formats, 0) {
            Some(fields) => {
                self.fields = fields;
                self.nested_resolved = true;
            }
            None => {
                tracing::warn!("Unresolvable or oversized nested type in format {}", self.name);
            }
        }
        self.assign_offsets();
    }

    /// Decode a data payload into scalars in field order (arrays expanded).
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<Value>> {
        let size = self
            .size()
            .ok_or_else(|| RecorderError::Format(format!("Format {} has unresolved nested types", self.name)))?;
        if payload.len() < size {
            return Err(RecorderError::Format(format!(
                "Payload of {} is {} bytes, layout needs {}",
                self.name,
                payload.len(),
                size
            )));
        }

        let mut values = Vec::with_capacity(self.fields.iter().map(FieldDescriptor::len).sum());
        for field in &self.fields {
            // size() succeeded, so every field is scalar
            let Some(tag) = field.type_tag() else { continue };
            for i in 0..field.len() {
                let start = field.offset + i * tag.size();
                values.push(tag.decode(&payload[start..]));
            }
        }
        Ok(values)
    }
}

fn flatten_fields(
    fields: &[FieldDescriptor],
    formats: &HashMap<String, MessageFormat>,
    depth: usize,
) -> Option<Vec<FieldDescriptor>> {
    if depth > MAX_NESTING_DEPTH {
        return None;
    }

    let mut flat = Vec::with_capacity(fields.len());
    let mut size = 0usize;
    for field in fields {
        match &field.kind {
            FieldKind::Scalar(_) => {
                size = size.checked_add(field.byte_size()?)?;
                flat.push(field.clone());
            }
            FieldKind::Nested(type_name) => {
                let nested = formats.get(type_name)?;
                let inner = flatten_fields(&nested.fields, formats, depth + 1)?;
                let inner_size: usize = inner.iter().filter_map(FieldDescriptor::byte_size).sum();
                size = size.checked_add(inner_size.checked_mul(field.len())?)?;
                // Checked before the copies are made
                if size > MAX_DATA_BODY_SIZE {
                    return None;
                }
                let prefixes: Vec<String> = match field.array_len {
                    Some(n) => (0..n).map(|i| format!("{}[{}]", field.name, i)).collect(),
                    None => vec![field.name.clone()],
                };
                for prefix in prefixes {
                    flat.extend(inner.iter().map(|f| FieldDescriptor {
                        name: format!("{}.{}", prefix, f.name),
                        ..f.clone()
                    }));
                }
            }
        }
        if size > MAX_DATA_BODY_SIZE {
            return None;
        }
    }
    Some(flat)
}

/// A decoded `Data` record
#[derive(Debug, Clone, PartialEq)]
pub struct DataRecord {
    pub format: String,
    pub multi_id: u8,
    /// Scalars in field order, arrays expanded
    pub values: Vec<Value>,
}

/// One framed record popped from the byte stream
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Format(MessageFormat),
    Data(DataRecord),
    Info { key: String, value: Option<Value> },
    Parameter { key: String, value: Option<Value> },
    AddLogged { msg_id: u16, multi_id: u8, name: String },
    Dropout { duration_ms: u16 },
    Log { level: u8, timestamp: u64, text: String },
    /// Record consumed by its declared length without interpretation
    Skipped(MessageKind),
    /// Stand-in for a record that could not be decoded
    Placeholder { size: usize },
    /// Unrecognized type tag, skipped by declared length
    Unknown { tag: u8, size: usize },
}

/// Parse the `key_len, "type name", value` layout shared by Info and Parameter records
pub fn parse_key_value(payload: &[u8]) -> Result<(String, Option<Value>)> {
    let key_len = *payload
        .first()
        .ok_or_else(|| RecorderError::Format("Empty key/value record".to_string()))? as usize;
    if payload.len() < 1 + key_len {
        return Err(RecorderError::Format(format!("Key of {} bytes exceeds record", key_len)));
    }

    let key = String::from_utf8_lossy(&payload[1..1 + key_len]).to_string();
    let raw = &payload[1 + key_len..];
    let field = FieldDescriptor::parse(&key)?;

    let value = match (field.type_tag(), field.array_len) {
        (Some(TypeTag::Char), Some(_)) => {
            let text = String::from_utf8_lossy(raw);
            Some(Value::Text(text.trim_end_matches('\0').to_string()))
        }
        (Some(tag), None) if raw.len() >= tag.size() => Some(tag.decode(raw)),
        _ => None,
    };

    Ok((field.name, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_round_trip_tags() {
        for tag in [b'F', b'D', b'I', b'P', b'A', b'R', b'S', b'O', b'L'] {
            let kind = MessageKind::from(tag);
            assert!(!matches!(kind, MessageKind::Unknown(_)));
            assert_eq!(u8::from(kind), tag);
        }
        assert_eq!(MessageKind::from(b'Q'), MessageKind::Unknown(b'Q'));
    }

    #[test]
    fn test_parse_format() {
        let format = MessageFormat::parse(b"sensor_gyro:uint64_t timestamp;float[3] xyz;uint8_t[4] _padding0;").unwrap();
        assert_eq!(format.name, "sensor_gyro");
        assert_eq!(format.fields.len(), 3);
        assert!(format.nested_resolved);
        assert_eq!(format.fields[1].name, "xyz");
        assert_eq!(format.fields[1].array_len, Some(3));
        assert_eq!(format.fields[1].offset, 8);
        assert_eq!(format.fields[2].offset, 20);
        assert_eq!(format.size(), Some(24));
    }

    #[test]
    fn test_parse_format_with_nested_type() {
        let format = MessageFormat::parse(b"outer:uint64_t timestamp;inner_t child;").unwrap();
        assert!(!format.nested_resolved);
        assert_eq!(format.size(), None);
        assert_eq!(format.fields[1].kind, FieldKind::Nested("inner_t".to_string()));
    }

    #[test]
    fn test_parse_format_missing_separator() {
        assert!(MessageFormat::parse(b"no separator here").is_err());
    }

    #[test]
    fn test_bad_array_length() {
        assert!(FieldDescriptor::parse("float[x] bad").is_err());
    }

    #[test]
    fn test_resolve_nested_flattens_arrays() {
        let mut formats = HashMap::new();
        formats.insert(
            "point".to_string(),
            MessageFormat::parse(b"point:float x;float y;").unwrap(),
        );
        let mut outer = MessageFormat::parse(b"path:uint64_t timestamp;point[2] pts;").unwrap();
        outer.resolve_nested(&formats);

        assert!(outer.nested_resolved);
        let names: Vec<_> = outer.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["timestamp", "pts[0].x", "pts[0].y", "pts[1].x", "pts[1].y"]);
        assert_eq!(outer.size(), Some(8 + 16));
        assert_eq!(outer.fields[4].offset, 20);
    }

    #[test]
    fn test_resolve_nested_unknown_reference_stays_unresolved() {
        let mut outer = MessageFormat::parse(b"outer:missing_t child;").unwrap();
        outer.resolve_nested(&HashMap::new());
        assert!(!outer.nested_resolved);
        assert!(outer.decode(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_resolve_nested_refuses_oversized_layout() {
        let mut formats = HashMap::new();
        for decl in [&b"b:c[200] y;"[..], &b"c:float[200] v;"[..]] {
            let format = MessageFormat::parse(decl).unwrap();
            formats.insert(format.name.clone(), format);
        }
        let mut outer = MessageFormat::parse(b"a:b[200] x;").unwrap();
        outer.resolve_nested(&formats);

        assert!(!outer.nested_resolved);
        assert_eq!(outer.fields.len(), 1);
        assert_eq!(outer.size(), None);
        assert!(outer.decode(&[0u8; 64]).is_err());
    }

    #[test]
    fn test_resolve_nested_at_frame_limit() {
        let mut formats = HashMap::new();
        formats.insert("c".to_string(), MessageFormat::parse(b"c:uint8_t[255] v;").unwrap());
        let mut fits = MessageFormat::parse(b"fits:c[256] x;uint8_t[253] tail;").unwrap();
        fits.resolve_nested(&formats);
        assert!(fits.nested_resolved);
        assert_eq!(fits.size(), Some(MAX_DATA_BODY_SIZE));

        let mut over = MessageFormat::parse(b"over:c[256] x;uint8_t[254] tail;").unwrap();
        over.resolve_nested(&formats);
        assert!(!over.nested_resolved);
    }

    #[test]
    fn test_array_longer_than_frame_rejected() {
        assert!(FieldDescriptor::parse("float[18446744073709551615] v").is_err());
        assert!(FieldDescriptor::parse("uint8_t[65534] v").is_err());
        assert!(FieldDescriptor::parse("uint8_t[65533] v").is_ok());
    }

    #[test]
    fn test_remove_trailing_padding_only_at_end() {
        let mut format =
            MessageFormat::parse(b"m:uint8_t[3] _padding0;float a;uint8_t[4] _padding1;").unwrap();
        format.remove_trailing_padding();
        assert_eq!(format.fields.len(), 2);
        assert_eq!(format.fields[0].name, "_padding0");
        format.remove_trailing_padding();
        assert_eq!(format.fields.len(), 2);
    }

    #[test]
    fn test_decode_values() {
        let format = MessageFormat::parse(b"m:int16_t a;float b;bool c;").unwrap();
        let mut payload = Vec::new();
        payload.extend_from_slice(&(-5i16).to_le_bytes());
        payload.extend_from_slice(&1.5f32.to_le_bytes());
        payload.push(1);

        let values = format.decode(&payload).unwrap();
        assert_eq!(values, vec![Value::Int(-5), Value::Float(1.5), Value::Bool(true)]);
    }

    #[test]
    fn test_decode_short_payload_fails() {
        let format = MessageFormat::parse(b"m:uint32_t a;").unwrap();
        assert!(format.decode(&[1, 2]).is_err());
    }

    #[test]
    fn test_parse_key_value_text_and_scalar() {
        let key = b"char[5] sys_name";
        let mut payload = vec![key.len() as u8];
        payload.extend_from_slice(key);
        payload.extend_from_slice(b"PX4\0\0");
        let (name, value) = parse_key_value(&payload).unwrap();
        assert_eq!(name, "sys_name");
        assert_eq!(value, Some(Value::Text("PX4".to_string())));

        let key = b"float GAIN";
        let mut payload = vec![key.len() as u8];
        payload.extend_from_slice(key);
        payload.extend_from_slice(&2.5f32.to_le_bytes());
        let (name, value) = parse_key_value(&payload).unwrap();
        assert_eq!(name, "GAIN");
        assert_eq!(value, Some(Value::Float(2.5)));
    }

    #[test]
    fn test_value_as_f64() {
        assert_eq!(Value::Bool(true).as_f64(), Some(1.0));
        assert_eq!(Value::UInt(7).as_f64(), Some(7.0));
        assert_eq!(Value::Text("x".into()).as_f64(), None);
    }
}
