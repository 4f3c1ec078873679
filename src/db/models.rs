//! Diesel row types for the `points` hypertable.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::models::point::{Point, Tags};
use crate::schema;

#[derive(Debug, Clone, Insertable, Serialize, Deserialize)]
#[diesel(table_name = schema::points)]
pub struct NewPoint {
    pub time: DateTime<Utc>,
    pub measurement: String,
    pub value: f64,
    pub tags: serde_json::Value,
}

impl From<&Point> for NewPoint {
    fn from(p: &Point) -> Self {
        NewPoint {
            time: p.time(),
            measurement: p.measurement().as_str().to_string(),
            value: p.value(),
            tags: tags_to_json(p.tags()),
        }
    }
}

pub fn tags_to_json(tags: &Tags) -> serde_json::Value {
    serde_json::Value::Object(
        tags.iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::point::Measurement;
    use chrono::TimeZone;

    #[test]
    fn new_point_carries_series_name_and_tags() {
        let mut tags = Tags::new();
        tags.insert("device-id".into(), "node1".into());
        tags.insert("port".into(), "1".into());
        let ts = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let point = Point::new(Measurement::BatteryVoltage, 3.7, ts, tags);

        let row = NewPoint::from(&point);
        assert_eq!(row.time, ts);
        assert_eq!(row.measurement, "battery-voltage");
        assert_eq!(row.value, 3.7);
        assert_eq!(row.tags, serde_json::json!({"device-id": "node1", "port": "1"}));
    }
}
