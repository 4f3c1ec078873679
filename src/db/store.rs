//! Store-write collaborator backed by a TimescaleDB `points` hypertable.
//!
//! The ingestion services only see the [`PointStore`] trait: batched writes,
//! an existence query for one series at one instant, and `close`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::PgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use log::{debug, info};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::config::DbConfig;
use crate::db::models::{tags_to_json, NewPoint};
use crate::models::point::{tag_keys, BatchTarget, Measurement, PointBatch, Precision};
use crate::schema;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// PostgreSQL stores microseconds; anything finer is truncated on the way in.
pub const STORE_PRECISION: Precision = Precision::Microseconds;

// 4 bind parameters per row, PostgreSQL allows 65535 per statement
const MAX_ROWS_PER_INSERT: usize = 10_000;

#[derive(Debug)]
pub enum StoreError {
    Connect(String),
    Migrate(String),
    Query(diesel::result::Error),
    Write(diesel::result::Error),
    DatabaseMismatch { expected: String, actual: String },
    Closed,
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Connect(e) => write!(f, "connection failed: {}", e),
            StoreError::Migrate(e) => write!(f, "applying migrations failed: {}", e),
            StoreError::Query(e) => write!(f, "query failed: {}", e),
            StoreError::Write(e) => write!(f, "write failed: {}", e),
            StoreError::DatabaseMismatch { expected, actual } => {
                write!(f, "batch targets database {} but store is connected to {}", actual, expected)
            }
            StoreError::Closed => write!(f, "store connection is closed"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Query(e) | StoreError::Write(e) => Some(e),
            _ => None,
        }
    }
}

/// "Is there already a `series` point at `time`?", optionally scoped to one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExistsQuery {
    pub series: Measurement,
    pub time: DateTime<Utc>,
    pub device_id: Option<String>,
}

impl ExistsQuery {
    pub fn at(series: Measurement, time: DateTime<Utc>) -> Self {
        ExistsQuery {
            series,
            time,
            device_id: None,
        }
    }

    pub fn for_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

pub trait PointStore {
    /// Database and precision that batches for this store must carry.
    fn target(&self) -> BatchTarget;

    /// Write the whole batch atomically. Returns the number of new rows.
    fn write(&mut self, batch: PointBatch) -> Result<usize, StoreError>;

    fn exists(&mut self, query: &ExistsQuery) -> Result<bool, StoreError>;

    fn close(&mut self);
}

pub struct TimescaleStore {
    conn: Option<PgConnection>,
    database: String,
}

impl TimescaleStore {
    /// Connect and bring the schema up to date.
    pub fn connect(cfg: &DbConfig) -> Result<Self, StoreError> {
        let mut conn =
            PgConnection::establish(&connection_string(cfg)).map_err(|e| StoreError::Connect(e.to_string()))?;
        apply_migrations(&mut conn)?;
        Ok(TimescaleStore {
            conn: Some(conn),
            database: cfg.database.clone(),
        })
    }

    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::Closed)
    }
}

impl PointStore for TimescaleStore {
    fn target(&self) -> BatchTarget {
        BatchTarget::new(self.database.clone(), STORE_PRECISION)
    }

    fn write(&mut self, batch: PointBatch) -> Result<usize, StoreError> {
        if batch.database() != self.database {
            return Err(StoreError::DatabaseMismatch {
                expected: self.database.clone(),
                actual: batch.database().to_string(),
            });
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let rows: Vec<NewPoint> = batch
            .points()
            .iter()
            .map(|p| {
                let mut row = NewPoint::from(p);
                row.time = STORE_PRECISION.truncate(row.time);
                row
            })
            .collect();

        use schema::points::dsl as P;

        let conn = self.conn()?;
        let inserted = conn
            .transaction::<usize, diesel::result::Error, _>(|conn| {
                let mut inserted = 0;
                for chunk in rows.chunks(MAX_ROWS_PER_INSERT) {
                    inserted += diesel::insert_into(P::points)
                        .values(chunk)
                        .on_conflict((P::measurement, P::time, P::tags))
                        .do_nothing()
                        .execute(conn)?;
                }
                Ok(inserted)
            })
            .map_err(StoreError::Write)?;

        debug!("Store: wrote {} of {} point(s)", inserted, rows.len());
        Ok(inserted)
    }

    fn exists(&mut self, query: &ExistsQuery) -> Result<bool, StoreError> {
        use schema::points::dsl as P;

        let time = STORE_PRECISION.truncate(query.time);
        let mut select = P::points
            .filter(P::measurement.eq(query.series.as_str()))
            .filter(P::time.eq(time))
            .select(P::time)
            .into_boxed();
        if let Some(device_id) = query.device_id.as_deref() {
            let mut tags = crate::models::point::Tags::new();
            tags.insert(tag_keys::DEVICE_ID.to_string(), device_id.to_string());
            select = select.filter(P::tags.contains(tags_to_json(&tags)));
        }

        let conn = self.conn()?;
        let found: Option<DateTime<Utc>> = select.first(conn).optional().map_err(StoreError::Query)?;
        Ok(found.is_some())
    }

    fn close(&mut self) {
        if self.conn.take().is_some() {
            info!("Store: connection to {} closed", self.database);
        }
    }
}

fn apply_migrations(conn: &mut PgConnection) -> Result<(), StoreError> {
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| StoreError::Migrate(e.to_string()))?;
    if applied.is_empty() {
        info!("Database schema is up to date; no migrations were applied");
    } else {
        let names = applied.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", ");
        info!("Applied {} database migration(s): {}", applied.len(), names);
    }
    Ok(())
}

/// libpq key/value connection string for `cfg`.
///
/// `HostAddress` is `host[:port]`; any `scheme://` prefix and trailing path are ignored.
pub fn connection_string(cfg: &DbConfig) -> String {
    let address = cfg.host_address.trim();
    let address = address.split_once("://").map(|(_, rest)| rest).unwrap_or(address);
    let address = address.split('/').next().unwrap_or_default();

    let (host, port) = match address.rsplit_once(':') {
        Some((h, p)) if !h.contains(':') && p.parse::<u16>().is_ok() => (h, Some(p)),
        _ => (address, None),
    };

    let mut parts = vec![format!("host={}", quote_value(host))];
    if let Some(port) = port {
        parts.push(format!("port={}", port));
    }
    parts.push(format!("dbname={}", quote_value(&cfg.database)));
    if !cfg.username.is_empty() {
        parts.push(format!("user={}", quote_value(&cfg.username)));
    }
    if !cfg.password.is_empty() {
        parts.push(format!("password={}", quote_value(&cfg.password)));
    }
    parts.join(" ")
}

fn quote_value(raw: &str) -> String {
    format!("'{}'", raw.replace('\\', "\\\\").replace('\'', "\\'"))
}
