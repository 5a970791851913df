//! Sample type: one tick's flattened snapshot.

use serde::{Deserialize, Serialize};

use crate::model::{Channels, FigureCatalog, SpatialPayload, StatusMessage};

/// One tick's snapshot of every channel
///
/// Immutable once appended to a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Microseconds since session start
    pub tms_us: u64,
    /// Seconds since session start
    pub dt_sec: f64,
    /// Raw and derived channels
    #[serde(with = "channel_values")]
    pub channels: Channels,
    /// Status message first seen in this tick
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<StatusMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spatial: Option<SpatialPayload>,
}

impl Sample {
    /// Replace all channels with a fresh raw set
    pub fn set_raw(&mut self, raw: Channels) {
        self.channels = raw;
    }

    /// Merge in the derived figures computed from the current channels
    pub fn compute_derived(&mut self, catalog: &dyn FigureCatalog) {
        let derived = catalog.compute(&self.channels);
        self.channels.extend(derived);
    }

    /// Stamp elapsed time since session start
    pub fn stamp(&mut self, elapsed_us: u64) {
        self.tms_us = elapsed_us;
        self.dt_sec = elapsed_us as f64 / 1e6;
    }

    pub fn value(&self, key: &str) -> Option<f64> {
        self.channels.get(key).copied()
    }
}

/// Channel maps with non-finite values
///
/// JSON has no NaN or infinity. Finite values are written as numbers, the
/// others as the strings `"NaN"`, `"inf"` and `"-inf"`. A `null` reads back
/// as NaN.
mod channel_values {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::model::Channels;

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum ChannelValue {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(channels: &Channels, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(channels.iter().map(|(key, &value)| {
            let value = if value.is_finite() {
                ChannelValue::Number(value)
            } else {
                ChannelValue::Text(value.to_string())
            };
            (key, value)
        }))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Channels, D::Error> {
        let raw = std::collections::BTreeMap::<String, Option<ChannelValue>>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, value)| -> Result<(String, f64), D::Error> {
                let value = match value {
                    Some(ChannelValue::Number(v)) => v,
                    Some(ChannelValue::Text(text)) => text.parse::<f64>().map_err(|_| {
                        D::Error::custom(format!("invalid value {:?} for channel {}", text, key))
                    })?,
                    None => f64::NAN,
                };
                Ok((key, value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stamp_derives_seconds() {
        let mut sample = Sample::default();
        sample.stamp(1_500_000);
        assert_eq!(sample.tms_us, 1_500_000);
        assert_eq!(sample.dt_sec, 1.5);
    }

    #[test]
    fn test_compute_derived_merges() {
        let mut raw = Channels::new();
        raw.insert("a".to_string(), 2.0);
        let mut sample = Sample::default();
        sample.set_raw(raw);

        let double = |raw: &Channels| {
            raw.iter().map(|(k, v)| (format!("{}_x2", k), v * 2.0)).collect::<Channels>()
        };
        sample.compute_derived(&double);

        assert_eq!(sample.value("a"), Some(2.0));
        assert_eq!(sample.value("a_x2"), Some(4.0));
    }

    #[test]
    fn test_non_finite_channels_survive_json() {
        let mut sample = Sample::default();
        sample.channels.insert("attitude.roll".to_string(), f64::NAN);
        sample.channels.insert("rate".to_string(), f64::INFINITY);
        sample.channels.insert("sink".to_string(), f64::NEG_INFINITY);
        sample.channels.insert("battery.voltage".to_string(), 12.5);

        let line = serde_json::to_string(&sample).unwrap();
        assert!(line.contains(r#""attitude.roll":"NaN""#), "{}", line);
        let back: Sample = serde_json::from_str(&line).unwrap();

        assert!(back.value("attitude.roll").unwrap().is_nan());
        assert_eq!(back.value("rate"), Some(f64::INFINITY));
        assert_eq!(back.value("sink"), Some(f64::NEG_INFINITY));
        assert_eq!(back.value("battery.voltage"), Some(12.5));
    }

    #[test]
    fn test_null_channel_reads_as_nan() {
        let back: Sample =
            serde_json::from_str(r#"{"tms_us":0,"dt_sec":0.0,"channels":{"attitude.roll":null}}"#).unwrap();
        assert!(back.value("attitude.roll").unwrap().is_nan());
    }

    #[test]
    fn test_bad_channel_text_is_rejected() {
        let result = serde_json::from_str::<Sample>(
            r#"{"tms_us":0,"dt_sec":0.0,"channels":{"attitude.roll":"level"}}"#,
        );
        assert!(result.is_err());
    }
}
