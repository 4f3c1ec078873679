//! Canonical time-series point model shared by every producer and the store.
//!
//! A [`Point`] is one named measurement with a single float value, a
//! timestamp and a set of string tags. Points are grouped into a
//! [`PointBatch`] that is written to one database atomically.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Tag key -> tag value. Keys are unique per point; ordering carries no meaning.
pub type Tags = BTreeMap<String, String>;

pub mod tag_keys {
    pub const DEVICE_ID: &str = "device-id";
    pub const HARDWARE_SERIAL: &str = "hardware-serial";
    pub const PORT: &str = "port";
    pub const MODULATION: &str = "modulation";
    pub const DATA_RATE: &str = "data_rate";
    pub const CODING_RATE: &str = "coding_rate";
    pub const GATEWAY_ID: &str = "gtw_id";
    pub const CHANNEL: &str = "channel";
    pub const FREQUENCY: &str = "frequency";
}

/// The fixed measurement vocabulary persisted as series names.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Measurement {
    Temperature,
    Humidity,
    BatteryVoltage,
    RainTips,
    Pressure,
    Frequency,
    Rssi,
    Snr,
    Altitude,
    Latitude,
    Longitude,
}

impl Measurement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Measurement::Temperature => "temperature",
            Measurement::Humidity => "humidity",
            Measurement::BatteryVoltage => "battery-voltage",
            Measurement::RainTips => "rain-tips",
            Measurement::Pressure => "pressure",
            Measurement::Frequency => "frequency",
            Measurement::Rssi => "rssi",
            Measurement::Snr => "snr",
            Measurement::Altitude => "altitude",
            Measurement::Latitude => "latitude",
            Measurement::Longitude => "longitude",
        }
    }
}

impl Display for Measurement {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timestamp resolution a batch is written with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Precision {
    #[default]
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl Precision {
    fn step(&self) -> TimeDelta {
        match self {
            Precision::Nanoseconds => TimeDelta::nanoseconds(1),
            Precision::Microseconds => TimeDelta::microseconds(1),
            Precision::Milliseconds => TimeDelta::milliseconds(1),
            Precision::Seconds => TimeDelta::seconds(1),
        }
    }

    /// Truncate `ts` to this precision. Out-of-range instants are returned unchanged.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        if *self == Precision::Nanoseconds {
            return ts;
        }
        ts.duration_trunc(self.step()).unwrap_or(ts)
    }
}

/// One immutable measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    measurement: Measurement,
    value: f64,
    time: DateTime<Utc>,
    tags: Tags,
}

impl Point {
    pub fn new(measurement: Measurement, value: f64, time: DateTime<Utc>, tags: Tags) -> Self {
        Point {
            measurement,
            value,
            time,
            tags,
        }
    }

    pub fn measurement(&self) -> Measurement {
        self.measurement
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Where a batch is going: database name and timestamp precision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTarget {
    pub database: String,
    pub precision: Precision,
}

impl BatchTarget {
    pub fn new(database: impl Into<String>, precision: Precision) -> Self {
        BatchTarget {
            database: database.into(),
            precision,
        }
    }
}

/// Points destined for one atomic write.
#[derive(Debug, Clone, PartialEq)]
pub struct PointBatch {
    target: BatchTarget,
    points: Vec<Point>,
}

impl PointBatch {
    pub fn new(target: BatchTarget) -> Self {
        PointBatch {
            target,
            points: Vec::new(),
        }
    }

    pub fn database(&self) -> &str {
        &self.target.database
    }

    /// Add a point, truncating its timestamp to the batch precision.
    pub fn add(&mut self, measurement: Measurement, value: f64, time: DateTime<Utc>, tags: &Tags) {
        let time = self.target.precision.truncate(time);
        self.points.push(Point::new(measurement, value, time, tags.clone()));
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn into_points(self) -> Vec<Point> {
        self.points
    }

    /// Points with the given measurement, in insertion order.
    pub fn series(&self, measurement: Measurement) -> impl Iterator<Item = &Point> {
        self.points.iter().filter(move |p| p.measurement == measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn series_names() {
        assert_eq!(Measurement::BatteryVoltage.as_str(), "battery-voltage");
        assert_eq!(Measurement::RainTips.to_string(), "rain-tips");
        assert_eq!(Measurement::Snr.as_str(), "snr");
    }

    #[test]
    fn precision_truncation() {
        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap() + TimeDelta::nanoseconds(123_456_789);

        assert_eq!(Precision::Nanoseconds.truncate(ts), ts);
        assert_eq!(Precision::Microseconds.truncate(ts).nanosecond(), 123_456_000);
        assert_eq!(Precision::Milliseconds.truncate(ts).nanosecond(), 123_000_000);
        assert_eq!(Precision::Seconds.truncate(ts).nanosecond(), 0);
    }

    #[test]
    fn batch_applies_precision_and_copies_tags() {
        let target = BatchTarget::new("weather", Precision::Microseconds);
        let mut batch = PointBatch::new(target);
        let ts = Utc.with_ymd_and_hms(2021, 6, 1, 12, 0, 0).unwrap() + TimeDelta::nanoseconds(999);

        let mut tags = Tags::new();
        tags.insert(tag_keys::DEVICE_ID.into(), "node1".into());
        batch.add(Measurement::Temperature, 21.5, ts, &tags);
        tags.insert(tag_keys::PORT.into(), "1".into());
        batch.add(Measurement::Humidity, 55.0, ts, &tags);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.database(), "weather");
        let first = &batch.points()[0];
        assert_eq!(first.time().nanosecond(), 0);
        assert_eq!(first.tag(tag_keys::DEVICE_ID), Some("node1"));
        assert_eq!(first.tag(tag_keys::PORT), None);
        assert_eq!(batch.series(Measurement::Humidity).count(), 1);
    }
}
