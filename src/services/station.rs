//! Weather-station readings: body parsing, normalization and the poll loop.

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use log::{debug, error, info};
use std::time::{Duration, Instant};

use crate::client::{ClientError, StationClient};
use crate::db::store::PointStore;
use crate::models::point::{tag_keys, BatchTarget, Measurement, PointBatch, Tags};
use crate::models::station::StationReading;
use crate::shutdown::CancellationToken;

const FIELD_SEPARATOR: &str = "<br />";
const FIELD_COUNT: usize = 4;

/// Parse `temperature<br />humidity<br />HH:MM<br />YYYY-MM-DD<br />`.
///
/// The page reports station-local time; `utc_offset_hours` is subtracted.
pub fn parse_live_data(body: &str, station: &str, utc_offset_hours: i32) -> Result<StationReading, ClientError> {
    let mut fields: Vec<&str> = body.trim().split(FIELD_SEPARATOR).map(str::trim).collect();
    if fields.last() == Some(&"") {
        fields.pop();
    }
    if fields.len() != FIELD_COUNT {
        return Err(ClientError::Body(format!(
            "expected {} fields, got {}",
            FIELD_COUNT,
            fields.len()
        )));
    }

    let number = |raw: &str| {
        raw.parse::<f64>()
            .map_err(|e| ClientError::Body(format!("invalid number {:?}: {}", raw, e)))
    };
    let temperature = number(fields[0])?;
    let humidity = number(fields[1])?;

    let stamp = format!("{} {}", fields[3], fields[2]);
    let local = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M")
        .map_err(|e| ClientError::Body(format!("invalid time {:?}: {}", stamp, e)))?;
    let timestamp = (local - ChronoDuration::hours(i64::from(utc_offset_hours))).and_utc();

    Ok(StationReading {
        temperature,
        humidity,
        timestamp,
        station: station.to_string(),
    })
}

/// Temperature and humidity, tagged with the station name as `device-id`.
pub fn normalize(reading: &StationReading, target: &BatchTarget) -> PointBatch {
    let mut batch = PointBatch::new(target.clone());
    let mut tags = Tags::new();
    tags.insert(tag_keys::DEVICE_ID.to_string(), reading.station.clone());
    batch.add(Measurement::Temperature, reading.temperature, reading.timestamp, &tags);
    batch.add(Measurement::Humidity, reading.humidity, reading.timestamp, &tags);
    batch
}

/// Poll the station every `rate` until cancelled. Fetch and write failures
/// are logged and the next tick proceeds as usual.
pub fn run_loop<P: PointStore>(client: &StationClient, store: &mut P, rate: Duration, cancel: &CancellationToken) {
    let target = store.target();
    loop {
        let tick_start = Instant::now();

        match client.fetch() {
            Ok(reading) => {
                info!(
                    "Station {} at {}: temperature={} humidity={}",
                    reading.station, reading.timestamp, reading.temperature, reading.humidity
                );
                match store.write(normalize(&reading, &target)) {
                    Ok(n) => debug!("Station: {} point(s) inserted", n),
                    Err(e) => error!("Station {} at {}: write failed: {}", reading.station, reading.timestamp, e),
                }
            }
            Err(e) => error!("Station: fetch failed: {}", e),
        }

        // Maintain steady cadence
        let elapsed = tick_start.elapsed();
        if cancel.wait_timeout(rate.saturating_sub(elapsed)) {
            info!("Station: poll loop stopped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::memory::MemoryStore;
    use chrono::{TimeZone, Utc};

    #[test]
    fn parses_live_data_and_shifts_to_utc() {
        let body = "21.3<br />55<br />14:30<br />2020-01-01<br />";
        let r = parse_live_data(body, "Sonbesie", 2).expect("parse");
        assert_eq!(r.temperature, 21.3);
        assert_eq!(r.humidity, 55.0);
        assert_eq!(r.timestamp, Utc.with_ymd_and_hms(2020, 1, 1, 12, 30, 0).unwrap());
        assert_eq!(r.station, "Sonbesie");
    }

    #[test]
    fn offset_can_cross_midnight() {
        let r = parse_live_data("9.5<br />80<br />01:05<br />2020-03-01<br />", "s", 2).expect("parse");
        assert_eq!(r.timestamp, Utc.with_ymd_and_hms(2020, 2, 29, 23, 5, 0).unwrap());
    }

    #[test]
    fn rejects_malformed_bodies() {
        for body in [
            "",
            "21.3<br />55<br />14:30<br />",
            "21.3<br />55<br />14:30<br />2020-01-01<br />extra<br />",
            "warm<br />55<br />14:30<br />2020-01-01<br />",
            "21.3<br />55<br />noon<br />2020-01-01<br />",
        ] {
            assert!(
                matches!(parse_live_data(body, "s", 2), Err(ClientError::Body(_))),
                "{:?} must be rejected",
                body
            );
        }
    }

    #[test]
    fn normalizes_to_two_points_tagged_with_station() {
        let reading = StationReading {
            temperature: 18.0,
            humidity: 40.0,
            timestamp: Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap(),
            station: "Sonbesie".to_string(),
        };
        let store = MemoryStore::new("weather");
        let batch = normalize(&reading, &store.target());

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.database(), "weather");
        for p in batch.points() {
            assert_eq!(p.tags().len(), 1);
            assert_eq!(p.tag("device-id"), Some("Sonbesie"));
            assert_eq!(p.time(), reading.timestamp);
        }
        assert_eq!(batch.series(Measurement::Temperature).next().map(|p| p.value()), Some(18.0));
        assert_eq!(batch.series(Measurement::Humidity).next().map(|p| p.value()), Some(40.0));
    }
}
