use chrono::{DateTime, Utc};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
    /// Leading or trailing whitespace.
    Padded,
    /// Date and time not joined by `T`.
    Separator,
    Parse(chrono::ParseError),
}

impl Display for TimestampError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            TimestampError::Padded => write!(f, "surrounding whitespace"),
            TimestampError::Separator => write!(f, "date and time must be separated by 'T'"),
            TimestampError::Parse(e) => write!(f, "{}", e),
        }
    }
}

impl Error for TimestampError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TimestampError::Parse(e) => Some(e),
            _ => None,
        }
    }
}

/// Parse a strict RFC3339 timestamp (fractional seconds up to nanoseconds) into UTC.
pub fn parse_rfc3339_utc(raw: &str) -> Result<DateTime<Utc>, TimestampError> {
    if raw.trim() != raw {
        return Err(TimestampError::Padded);
    }
    // chrono also takes ' ' and 't' here
    if raw.len() > 10 && raw.as_bytes()[10] != b'T' {
        return Err(TimestampError::Separator);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(TimestampError::Parse)
}

/// Radio frequency as a tag value: fixed point, one decimal (`868.1`).
pub fn format_frequency_tag(frequency: f64) -> String {
    format!("{:.1}", frequency)
}
