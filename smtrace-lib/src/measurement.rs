//! Decoded meter values and their accumulation between reports.
use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};

use crate::obis::ObisLookup;
use crate::sml::SmlEntry;

/// Timestamp format used when rendering measurements.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

/// A scaled measurement value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Decimal(f64),
    Bool(bool),
    /// Printable octet string, rendered quoted.
    Text(String),
    /// Non-printable octet string as space separated hex bytes.
    Hex(String),
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{v}"),
            Value::Decimal(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "\"{v}\""),
            Value::Hex(v) => write!(f, "{v}"),
        }
    }
}

/// Value and unit of one key as decoded from a frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reading {
    pub value: Option<Value>,
    pub unit: Option<String>,
}

/// All readings decoded from a single frame, by key.
pub type MeasurementBatch = BTreeMap<String, Reading>;

/// Build a batch from decoded entries, naming keys and units with `lookup`.
///
/// Entries sharing a description overwrite each other in frame order.
pub fn from_entries(entries: &[SmlEntry], lookup: &dyn ObisLookup) -> MeasurementBatch {
    entries
        .iter()
        .map(|entry| {
            (
                lookup.describe(&entry.object_id),
                Reading {
                    value: entry.scaled_value(),
                    unit: entry.unit.and_then(|u| lookup.unit_name(u)),
                },
            )
        })
        .collect()
}

/// The latest observation of a key.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub key: String,
    pub value: Option<Value>,
    pub unit: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Latest-value table of measurements.
///
/// Keys are unique; a merge overwrites value, unit and observation time of the keys
/// it contains and leaves every other key untouched.
#[derive(Debug, Default, Clone)]
pub struct MeasurementSink {
    entries: BTreeMap<String, (Reading, DateTime<Utc>)>,
}

impl MeasurementSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, observed_at: DateTime<Utc>, batch: &MeasurementBatch) {
        for (key, reading) in batch {
            self.entries
                .insert(key.clone(), (reading.clone(), observed_at));
        }
    }

    /// Current contents sorted by observation time, then key.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Measurement> {
        let mut snapshot: Vec<Measurement> = self
            .entries
            .iter()
            .map(|(key, (reading, observed_at))| Measurement {
                key: key.clone(),
                value: reading.value.clone(),
                unit: reading.unit.clone(),
                observed_at: *observed_at,
            })
            .collect();
        // entries are already in key order, a stable sort keeps it for equal times
        snapshot.sort_by_key(|m| m.observed_at);
        snapshot
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove the entries of a snapshot that have not been merged again since it
    /// was taken.
    pub fn remove_reported(&mut self, reported: &[Measurement]) {
        for m in reported {
            if let Some((reading, observed_at)) = self.entries.get(&m.key) {
                if *observed_at == m.observed_at && reading.value == m.value && reading.unit == m.unit
                {
                    self.entries.remove(&m.key);
                }
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obis::ObisRegistry;
    use crate::sml::{ObisCode, RawValue};
    use chrono::TimeZone;

    fn reading(value: i64, unit: &str) -> Reading {
        Reading {
            value: Some(Value::Integer(value)),
            unit: Some(unit.to_string()),
        }
    }

    #[test]
    fn merge_keeps_latest_and_leaves_other_keys() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap();
        let mut sink = MeasurementSink::new();

        sink.merge(
            t0,
            &MeasurementBatch::from([
                ("energy".to_string(), reading(1, "Wh")),
                ("power".to_string(), reading(10, "W")),
            ]),
        );
        sink.merge(
            t1,
            &MeasurementBatch::from([("energy".to_string(), reading(2, "kWh"))]),
        );

        let snapshot = sink.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].key, "power");
        assert_eq!(snapshot[0].value, Some(Value::Integer(10)));
        assert_eq!(snapshot[0].observed_at, t0);
        assert_eq!(snapshot[1].key, "energy");
        assert_eq!(snapshot[1].value, Some(Value::Integer(2)));
        assert_eq!(snapshot[1].unit.as_deref(), Some("kWh"));
        assert_eq!(snapshot[1].observed_at, t1);
    }

    #[test]
    fn snapshot_orders_equal_times_by_key() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut sink = MeasurementSink::new();
        sink.merge(
            ts,
            &MeasurementBatch::from([
                ("b".to_string(), Reading::default()),
                ("a".to_string(), Reading::default()),
            ]),
        );
        let keys: Vec<String> = sink.snapshot().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["a", "b"]);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn remove_reported_keeps_newer_merges() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 5).unwrap();
        let mut sink = MeasurementSink::new();
        sink.merge(
            t0,
            &MeasurementBatch::from([
                ("energy".to_string(), reading(1, "Wh")),
                ("power".to_string(), reading(10, "W")),
            ]),
        );
        let reported = sink.snapshot();

        sink.merge(
            t1,
            &MeasurementBatch::from([
                ("energy".to_string(), reading(2, "Wh")),
                ("voltage".to_string(), reading(230, "V")),
            ]),
        );
        sink.remove_reported(&reported);

        let keys: Vec<String> = sink.snapshot().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["energy", "voltage"]);
        assert_eq!(sink.snapshot()[0].value, Some(Value::Integer(2)));
    }

    #[test]
    fn batch_from_entries() {
        let entries = vec![
            SmlEntry {
                object_id: ObisCode::new(1, 0, 1, 8, 0, 255),
                value: Some(RawValue::Uint(12_345)),
                scaler: Some(-1),
                unit: Some(30),
            },
            SmlEntry {
                object_id: ObisCode::new(1, 0, 96, 1, 0, 255),
                value: Some(RawValue::Bytes(b"EMH".to_vec())),
                scaler: None,
                unit: None,
            },
        ];
        let batch = from_entries(&entries, &ObisRegistry::new());

        let energy = &batch["Positive active energy, total"];
        assert_eq!(energy.value, Some(Value::Decimal(1234.5)));
        assert_eq!(energy.unit.as_deref(), Some("Wh"));
        let serial = &batch["Meter serial number"];
        assert_eq!(serial.value.as_ref().map(ToString::to_string).as_deref(), Some("\"EMH\""));
        assert_eq!(serial.unit, None);
    }
}
