use chrono::{DateTime, Utc};

/// One reading scraped from the weather-station live-data page.
#[derive(Debug, Clone, PartialEq)]
pub struct StationReading {
    pub temperature: f64,
    pub humidity: f64,
    pub timestamp: DateTime<Utc>,
    pub station: String,
}
