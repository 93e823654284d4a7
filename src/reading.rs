use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One observation reported by an edge node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub node_id: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    /// Accepts RFC 3339, ISO 8601 without an offset (read as UTC) or epoch
    /// seconds. Defaults to time of receipt.
    #[serde(default = "Utc::now", deserialize_with = "lenient_timestamp::deserialize")]
    pub timestamp: DateTime<Utc>,
}

mod lenient_timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::de::{self, Deserializer, Unexpected, Visitor};
    use std::fmt;

    const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(TimestampVisitor)
    }

    fn parse_str(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }
        for format in NAIVE_FORMATS {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(naive.and_utc());
            }
        }
        raw.parse::<f64>().ok().and_then(from_epoch_secs)
    }

    fn from_epoch_secs(secs: f64) -> Option<DateTime<Utc>> {
        if !secs.is_finite() {
            return None;
        }
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1e9).round().min(999_999_999.0) as u32;
        DateTime::from_timestamp(whole as i64, nanos)
    }

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = DateTime<Utc>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an ISO 8601 timestamp or epoch seconds")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            parse_str(v).ok_or_else(|| E::invalid_value(Unexpected::Str(v), &self))
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            DateTime::from_timestamp(v, 0)
                .ok_or_else(|| E::invalid_value(Unexpected::Signed(v), &self))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            i64::try_from(v)
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or_else(|| E::invalid_value(Unexpected::Unsigned(v), &self))
        }

        fn visit_f64<E: de::Error>(self, v: f64) -> Result<Self::Value, E> {
            from_epoch_secs(v).ok_or_else(|| E::invalid_value(Unexpected::Float(v), &self))
        }
    }
}

impl Reading {
    /// Builds a reading stamped with the current time.
    pub fn new(
        node_id: impl Into<String>,
        sensor_type: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            sensor_type: sensor_type.into(),
            value,
            unit: unit.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Readings grouped for a single upstream upload, in ingest order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub gateway_id: String,
    pub readings: Vec<Reading>,
    pub batch_timestamp: DateTime<Utc>,
}

impl Batch {
    pub fn new(gateway_id: impl Into<String>, readings: Vec<Reading>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            readings,
            batch_timestamp: Utc::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Key upstream can use to drop replays of a batch it already stored.
    pub fn dedupe_key(&self) -> String {
        format!(
            "{}:{}",
            self.gateway_id,
            self.batch_timestamp
                .to_rfc3339_opts(SecondsFormat::Micros, true)
        )
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            gateway_id: self.gateway_id.clone(),
            reading_count: self.readings.len(),
            timestamp: self.batch_timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub gateway_id: String,
    pub reading_count: usize,
    pub timestamp: DateTime<Utc>,
}
