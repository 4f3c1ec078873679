//! Wire types for the LoRaWAN application server.
//!
//! - [`SensorMessage`]: one uplink as published on `+/devices/+/up`.
//! - [`HistoricalRecord`]: one row of the data-storage `query?last=7d` response.
//!
//! Numeric fields the server omits decode as zero, except `rain` and `pres`
//! which stay `None` so that sensors without those channels never produce points.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorMessage {
    #[serde(default)]
    pub payload_fields: Option<Payload>,
    pub dev_id: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub hardware_serial: String,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub counter: u64,
    #[serde(default)]
    pub payload_raw: Option<String>,
    pub metadata: Metadata,
}

/// Decoded device payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub bat: f64,
    #[serde(default)]
    pub humd: f64,
    #[serde(default)]
    pub temp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rain: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pres: Option<f64>,
    #[serde(default)]
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// RFC3339 with optional fractional seconds; parsed by the normalizer.
    pub time: String,
    #[serde(default)]
    pub frequency: f64,
    #[serde(default)]
    pub modulation: String,
    #[serde(default)]
    pub data_rate: String,
    #[serde(default)]
    pub coding_rate: String,
    #[serde(default)]
    pub gateways: Vec<GatewayRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub gtw_id: String,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub gtw_trusted: bool,
    #[serde(default)]
    pub channel: u32,
    #[serde(default)]
    pub rssi: f64,
    #[serde(default)]
    pub snr: f64,
    #[serde(default)]
    pub rf_chain: u32,
    #[serde(default)]
    pub latitude: f64,
    #[serde(default)]
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalRecord {
    pub time: String,
    pub device_id: String,
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub bat: f64,
    #[serde(default)]
    pub humd: f64,
    #[serde(default)]
    pub temp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rain: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pres: Option<f64>,
    #[serde(default)]
    pub valid: bool,
}

impl HistoricalRecord {
    /// The payload this row was recorded from.
    pub fn payload(&self) -> Payload {
        Payload {
            bat: self.bat,
            humd: self.humd,
            temp: self.temp,
            rain: self.rain,
            pres: self.pres,
            valid: self.valid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_uplink_fixture() {
        let json = std::fs::read_to_string("tests/data/uplink.json").expect("fixture present");
        let msg: SensorMessage = serde_json::from_str(&json).expect("parse uplink");

        assert_eq!(msg.dev_id, "node1");
        assert_eq!(msg.port, 1);
        assert_eq!(msg.metadata.gateways.len(), 2);
        assert_eq!(msg.metadata.gateways[1].gtw_id, "eui-b827ebfffe000002");

        let payload = msg.payload_fields.expect("payload present");
        assert!(payload.valid);
        assert_eq!(payload.rain, Some(3.0));
        assert_eq!(payload.pres, None);
    }

    #[test]
    fn missing_payload_fields_is_none() {
        let json = r#"{"dev_id":"n","hardware_serial":"AA","port":2,"metadata":{"time":"2020-01-01T00:00:00Z"}}"#;
        let msg: SensorMessage = serde_json::from_str(json).expect("parse");
        assert!(msg.payload_fields.is_none());
        assert!(msg.metadata.gateways.is_empty());
    }

    #[test]
    fn decodes_history_fixture() {
        let json = std::fs::read_to_string("tests/data/history.json").expect("fixture present");
        let rows: Vec<HistoricalRecord> = serde_json::from_str(&json).expect("parse history");

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].device_id, "node1");
        assert!(!rows[2].valid);
        assert_eq!(rows[1].payload().rain, Some(0.0));
    }
}
