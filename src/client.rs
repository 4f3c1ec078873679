//! Blocking HTTP clients.
//!
//! - [`HistoryClient`]: the application's data-storage endpoint, used once at
//!   startup to fetch the recent uplink history for reconciliation.
//! - [`StationClient`]: the weather-station live-data page.
//!
//! Both use `ureq` with status-as-error disabled so that every non-2xx answer
//! is turned into [`ClientError::Http`] with its body attached.

use http::StatusCode;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

use crate::config::{MqttConfig, StationConfig};
use crate::models::station::StationReading;
use crate::models::things::HistoricalRecord;
use crate::services::station::parse_live_data;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum ClientError {
    Transport(String),
    Http { status: u16, message: String },
    Json(serde_path_to_error::Error<serde_json::Error>),
    /// Response body did not have the expected shape.
    Body(String),
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(s) => write!(f, "transport error: {}", s),
            ClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            ClientError::Json(e) => write!(f, "json error at {}: {}", e.path(), e.inner()),
            ClientError::Body(s) => write!(f, "unexpected body: {}", s),
        }
    }
}

impl Error for ClientError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ClientError::Json(e) => Some(e.inner()),
            _ => None,
        }
    }
}

impl From<serde_path_to_error::Error<serde_json::Error>> for ClientError {
    fn from(value: serde_path_to_error::Error<serde_json::Error>) -> Self {
        ClientError::Json(value)
    }
}

impl From<ureq::Error> for ClientError {
    fn from(value: ureq::Error) -> Self {
        ClientError::Transport(value.to_string())
    }
}

fn agent() -> ureq::Agent {
    let config = ureq::Agent::config_builder()
        .timeout_global(Some(REQUEST_TIMEOUT))
        .http_status_as_error(false)
        .build();
    ureq::Agent::new_with_config(config)
}

/// Read the body of a response, mapping non-2xx statuses to [`ClientError::Http`].
fn read_body(mut resp: http::Response<ureq::Body>) -> Result<(StatusCode, String), ClientError> {
    let status = resp.status();
    let body = resp.body_mut().read_to_string()?;
    if !status.is_success() {
        return Err(ClientError::Http {
            status: status.as_u16(),
            message: body,
        });
    }
    Ok((status, body))
}

pub struct HistoryClient {
    agent: ureq::Agent,
    url: String,
    access_key: String,
}

impl HistoryClient {
    pub fn new(cfg: &MqttConfig) -> Self {
        HistoryClient {
            agent: agent(),
            url: cfg.history_url(),
            access_key: cfg.password.clone(),
        }
    }

    /// All stored uplinks within `window` (e.g. `7d`), oldest first.
    pub fn get_history(&self, window: &str) -> Result<Vec<HistoricalRecord>, ClientError> {
        let resp = self
            .agent
            .get(&self.url)
            .header("Accept", "application/json")
            .header("Authorization", &format!("key {}", self.access_key))
            .query("last", window)
            .call()?;
        let (status, body) = read_body(resp)?;
        parse_history(status, &body)
    }
}

fn parse_history(status: StatusCode, body: &str) -> Result<Vec<HistoricalRecord>, ClientError> {
    if status == StatusCode::NO_CONTENT || body.trim().is_empty() {
        return Ok(Vec::new());
    }
    let de = &mut serde_json::Deserializer::from_str(body);
    Ok(serde_path_to_error::deserialize(de)?)
}

pub struct StationClient {
    agent: ureq::Agent,
    url: String,
    name: String,
    utc_offset_hours: i32,
}

impl StationClient {
    pub fn new(cfg: &StationConfig) -> Self {
        StationClient {
            agent: agent(),
            url: cfg.url.clone(),
            name: cfg.name.clone(),
            utc_offset_hours: cfg.utc_offset_hours,
        }
    }

    pub fn fetch(&self) -> Result<StationReading, ClientError> {
        let resp = self.agent.get(&self.url).call()?;
        let (_, body) = read_body(resp)?;
        parse_live_data(&body, &self.name, self.utc_offset_hours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_content_means_no_history() {
        assert!(parse_history(StatusCode::NO_CONTENT, "").expect("204").is_empty());
        assert!(parse_history(StatusCode::OK, "  \n").expect("blank").is_empty());
    }

    #[test]
    fn history_fixture_parses() {
        let json = std::fs::read_to_string("tests/data/history.json").expect("fixture present");
        let rows = parse_history(StatusCode::OK, &json).expect("parse");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].pres, Some(1013.2));
    }

    #[test]
    fn history_errors_name_the_path() {
        let err = parse_history(StatusCode::OK, r#"[{"time":"2020-01-01T00:00:00Z","device_id":7}]"#)
            .expect_err("must fail");
        let text = err.to_string();
        assert!(text.contains("[0].device_id"), "{}", text);
    }

    #[test]
    fn history_url_carries_application_id() {
        let cfg = crate::config::Config::sample();
        let client = HistoryClient::new(&cfg.m_config);
        assert!(client.url.contains(&cfg.m_config.username));
        assert!(!client.url.contains("{app}"));
    }
}
