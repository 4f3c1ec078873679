//! Turns one uplink into canonical points.
//!
//! Layout of a batch for one message at instant `t`:
//! - payload points (`temperature`, `humidity`, `battery-voltage`, and
//!   `rain-tips` / `pressure` when the device reported them), only when the
//!   payload is present and flagged valid; tags `device-id`, `hardware-serial`, `port`
//! - one `frequency` point; base tags plus `modulation`, `data_rate`, `coding_rate`
//! - per gateway `rssi`, `snr`, `altitude`, `latitude`, `longitude`; the
//!   frequency-point tags plus `gtw_id`, `channel` and `frequency` (one decimal)

use std::error::Error;
use std::fmt::{self, Display, Formatter};

use chrono::{DateTime, Utc};

use crate::models::point::{tag_keys, BatchTarget, Measurement, PointBatch, Tags};
use crate::models::things::{GatewayRecord, Payload, SensorMessage};
use crate::utils::{format_frequency_tag, parse_rfc3339_utc, TimestampError};

#[derive(Debug)]
pub enum NormalizeError {
    Timestamp {
        device_id: String,
        time: String,
        source: TimestampError,
    },
}

impl Display for NormalizeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NormalizeError::Timestamp { device_id, time, source } => {
                write!(f, "device {}: invalid metadata time {:?}: {}", device_id, time, source)
            }
        }
    }
}

impl Error for NormalizeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NormalizeError::Timestamp { source, .. } => Some(source),
        }
    }
}

pub fn normalize(message: &SensorMessage, target: &BatchTarget) -> Result<PointBatch, NormalizeError> {
    let meta = &message.metadata;
    let ts = parse_rfc3339_utc(&meta.time).map_err(|source| NormalizeError::Timestamp {
        device_id: message.dev_id.clone(),
        time: meta.time.clone(),
        source,
    })?;

    let mut batch = PointBatch::new(target.clone());
    let mut tags = Tags::new();
    tags.insert(tag_keys::DEVICE_ID.to_string(), message.dev_id.clone());
    tags.insert(tag_keys::HARDWARE_SERIAL.to_string(), message.hardware_serial.clone());
    tags.insert(tag_keys::PORT.to_string(), message.port.to_string());

    if let Some(payload) = message.payload_fields.as_ref().filter(|p| p.valid) {
        add_payload_points(&mut batch, payload, ts, &tags);
    }

    tags.insert(tag_keys::MODULATION.to_string(), meta.modulation.clone());
    tags.insert(tag_keys::DATA_RATE.to_string(), meta.data_rate.clone());
    tags.insert(tag_keys::CODING_RATE.to_string(), meta.coding_rate.clone());
    batch.add(Measurement::Frequency, meta.frequency, ts, &tags);

    let frequency_tag = format_frequency_tag(meta.frequency);
    for gw in &meta.gateways {
        add_gateway_points(&mut batch, gw, &frequency_tag, ts, &tags);
    }

    Ok(batch)
}

/// Temperature, humidity and battery voltage.
pub(crate) fn add_sensor_points(batch: &mut PointBatch, payload: &Payload, ts: DateTime<Utc>, tags: &Tags) {
    batch.add(Measurement::Temperature, payload.temp, ts, tags);
    batch.add(Measurement::Humidity, payload.humd, ts, tags);
    batch.add(Measurement::BatteryVoltage, payload.bat, ts, tags);
}

/// Sensor points always; rain and pressure only when reported.
fn add_payload_points(batch: &mut PointBatch, payload: &Payload, ts: DateTime<Utc>, tags: &Tags) {
    add_sensor_points(batch, payload, ts, tags);
    if let Some(rain) = payload.rain {
        batch.add(Measurement::RainTips, rain, ts, tags);
    }
    if let Some(pres) = payload.pres {
        batch.add(Measurement::Pressure, pres, ts, tags);
    }
}

fn add_gateway_points(batch: &mut PointBatch, gw: &GatewayRecord, frequency: &str, ts: DateTime<Utc>, tags: &Tags) {
    let mut gw_tags = tags.clone();
    gw_tags.insert(tag_keys::GATEWAY_ID.to_string(), gw.gtw_id.clone());
    gw_tags.insert(tag_keys::CHANNEL.to_string(), gw.channel.to_string());
    gw_tags.insert(tag_keys::FREQUENCY.to_string(), frequency.to_string());

    batch.add(Measurement::Rssi, gw.rssi, ts, &gw_tags);
    batch.add(Measurement::Snr, gw.snr, ts, &gw_tags);
    batch.add(Measurement::Altitude, gw.altitude, ts, &gw_tags);
    batch.add(Measurement::Latitude, gw.latitude, ts, &gw_tags);
    batch.add(Measurement::Longitude, gw.longitude, ts, &gw_tags);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::point::Precision;
    use crate::models::things::Metadata;
    use chrono::TimeZone;

    const PAYLOAD_SERIES: [Measurement; 5] = [
        Measurement::Temperature,
        Measurement::Humidity,
        Measurement::BatteryVoltage,
        Measurement::RainTips,
        Measurement::Pressure,
    ];

    fn target() -> BatchTarget {
        BatchTarget::new("weather", Precision::Nanoseconds)
    }

    fn gateway(id: &str, channel: u32) -> GatewayRecord {
        GatewayRecord {
            gtw_id: id.to_string(),
            timestamp: 0,
            gtw_trusted: false,
            channel,
            rssi: -100.0,
            snr: 7.25,
            rf_chain: 0,
            latitude: -33.9,
            longitude: 18.8,
            altitude: 110.0,
        }
    }

    fn message(payload: Option<Payload>, gateways: Vec<GatewayRecord>) -> SensorMessage {
        SensorMessage {
            payload_fields: payload,
            dev_id: "node1".to_string(),
            app_id: "weather-app".to_string(),
            hardware_serial: "AABBCC".to_string(),
            port: 1,
            counter: 1,
            payload_raw: None,
            metadata: Metadata {
                time: "2020-01-01T00:00:00Z".to_string(),
                frequency: 868.1,
                modulation: "LORA".to_string(),
                data_rate: "SF7BW125".to_string(),
                coding_rate: "4/5".to_string(),
                gateways,
            },
        }
    }

    fn full_payload() -> Payload {
        Payload {
            bat: 3.7,
            humd: 55.0,
            temp: 21.5,
            rain: Some(2.0),
            pres: Some(1012.5),
            valid: true,
        }
    }

    fn value_of(batch: &PointBatch, m: Measurement) -> Option<f64> {
        batch.series(m).next().map(|p| p.value())
    }

    #[test]
    fn valid_payload_without_optional_fields() {
        let payload = Payload {
            rain: None,
            pres: None,
            ..full_payload()
        };
        let batch = normalize(&message(Some(payload), vec![]), &target()).expect("normalize");

        assert_eq!(batch.len(), 4);
        assert_eq!(value_of(&batch, Measurement::Temperature), Some(21.5));
        assert_eq!(value_of(&batch, Measurement::Humidity), Some(55.0));
        assert_eq!(value_of(&batch, Measurement::BatteryVoltage), Some(3.7));
        assert_eq!(value_of(&batch, Measurement::RainTips), None);
        assert_eq!(value_of(&batch, Measurement::Pressure), None);
        assert_eq!(value_of(&batch, Measurement::Frequency), Some(868.1));

        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        for p in batch.points() {
            assert_eq!(p.time(), ts);
            assert_eq!(p.tag("device-id"), Some("node1"));
            assert_eq!(p.tag("hardware-serial"), Some("AABBCC"));
            assert_eq!(p.tag("port"), Some("1"));
        }
    }

    #[test]
    fn explicit_zero_rain_is_written() {
        let payload = Payload {
            rain: Some(0.0),
            pres: None,
            ..full_payload()
        };
        let batch = normalize(&message(Some(payload), vec![]), &target()).expect("normalize");
        assert_eq!(value_of(&batch, Measurement::RainTips), Some(0.0));
        assert_eq!(batch.len(), 5);
    }

    #[test]
    fn point_count_is_five_plus_one_plus_five_per_gateway() {
        for gateways in 0..4u32 {
            let gws = (0..gateways).map(|i| gateway(&format!("gw{}", i), i)).collect();
            let batch = normalize(&message(Some(full_payload()), gws), &target()).expect("normalize");
            assert_eq!(batch.len(), 5 + 1 + 5 * gateways as usize);
        }
    }

    #[test]
    fn invalid_or_missing_payload_keeps_radio_points_only() {
        let invalid = Payload {
            valid: false,
            ..full_payload()
        };
        for payload in [Some(invalid), None] {
            let batch = normalize(&message(payload, vec![gateway("gw0", 2)]), &target()).expect("normalize");
            for m in PAYLOAD_SERIES {
                assert_eq!(batch.series(m).count(), 0, "{} must be absent", m);
            }
            assert_eq!(batch.series(Measurement::Frequency).count(), 1);
            assert_eq!(batch.len(), 6);
        }
    }

    #[test]
    fn payload_points_do_not_carry_radio_tags() {
        let batch = normalize(&message(Some(full_payload()), vec![gateway("gw0", 0)]), &target()).expect("normalize");
        for m in PAYLOAD_SERIES {
            let p = batch.series(m).next().expect("payload point");
            assert_eq!(p.tags().len(), 3);
            assert_eq!(p.tag("modulation"), None);
        }

        let freq = batch.series(Measurement::Frequency).next().expect("frequency point");
        assert_eq!(freq.tag("modulation"), Some("LORA"));
        assert_eq!(freq.tag("data_rate"), Some("SF7BW125"));
        assert_eq!(freq.tag("coding_rate"), Some("4/5"));
        assert_eq!(freq.tag("gtw_id"), None);
        assert_eq!(freq.tag("frequency"), None);
    }

    #[test]
    fn gateway_points_carry_their_own_gateway_tags() {
        let gws = vec![gateway("eui-1", 0), gateway("eui-2", 5)];
        let batch = normalize(&message(None, gws), &target()).expect("normalize");

        let rssi: Vec<_> = batch.series(Measurement::Rssi).collect();
        assert_eq!(rssi.len(), 2);
        assert_eq!(rssi[0].tag("gtw_id"), Some("eui-1"));
        assert_eq!(rssi[0].tag("channel"), Some("0"));
        assert_eq!(rssi[1].tag("gtw_id"), Some("eui-2"));
        assert_eq!(rssi[1].tag("channel"), Some("5"));

        for m in [
            Measurement::Rssi,
            Measurement::Snr,
            Measurement::Altitude,
            Measurement::Latitude,
            Measurement::Longitude,
        ] {
            for p in batch.series(m) {
                assert_eq!(p.tag("frequency"), Some("868.1"));
                assert_eq!(p.tag("device-id"), Some("node1"));
                assert_eq!(p.tag("modulation"), Some("LORA"));
            }
        }
        assert_eq!(value_of(&batch, Measurement::Snr), Some(7.25));
    }

    #[test]
    fn malformed_timestamp_produces_no_batch() {
        let mut msg = message(Some(full_payload()), vec![gateway("gw0", 0)]);
        msg.metadata.time = "01/01/2020 00:00".to_string();

        let err = normalize(&msg, &target()).expect_err("must fail");
        assert!(err.to_string().contains("node1"));
        assert!(matches!(err, NormalizeError::Timestamp { .. }));
    }

    #[test]
    fn padded_or_space_separated_time_is_rejected() {
        for time in [" 2020-01-01T00:00:00Z\n", "2020-01-01 00:00:00Z"] {
            let mut msg = message(Some(full_payload()), vec![]);
            msg.metadata.time = time.to_string();
            assert!(normalize(&msg, &target()).is_err(), "{:?} must be rejected", time);
        }
    }

    #[test]
    fn fixture_uplink_normalizes() {
        let json = std::fs::read_to_string("tests/data/uplink.json").expect("fixture present");
        let msg: SensorMessage = serde_json::from_str(&json).expect("parse uplink");
        let batch = normalize(&msg, &BatchTarget::new("weather", Precision::Microseconds)).expect("normalize");

        // temp, humd, bat, rain (no pres) + frequency + 2 gateways
        assert_eq!(batch.len(), 4 + 1 + 10);
        assert_eq!(batch.points()[0].time().timestamp_subsec_nanos(), 123_456_000);
    }
}
