//! Startup backfill: diff the data-storage history against the store and
//! write only the instants that are missing.
//!
//! Existence is decided per record by an [`ExistenceCheck`]. The default
//! check looks for a `temperature` point at the record's exact instant,
//! relying on all series of one instant being written in one batch.
//! [`DedupKey::DeviceInstant`] narrows that to the record's device.

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

use crate::db::store::{ExistsQuery, PointStore, StoreError, STORE_PRECISION};
use crate::models::point::{tag_keys, BatchTarget, Measurement, PointBatch, Tags};
use crate::models::things::HistoricalRecord;
use crate::services::normalize::add_sensor_points;
use crate::utils::{parse_rfc3339_utc, TimestampError};

#[derive(Debug)]
pub enum ReconcileError {
    /// A history row had an unparseable time; the whole run is abandoned.
    Timestamp {
        index: usize,
        device_id: String,
        time: String,
        source: TimestampError,
    },
    Store(StoreError),
}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileError::Timestamp {
                index,
                device_id,
                time,
                source,
            } => write!(
                f,
                "history record {} (device {}) has invalid time {:?}: {}",
                index, device_id, time, source
            ),
            ReconcileError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl Error for ReconcileError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReconcileError::Timestamp { source, .. } => Some(source),
            ReconcileError::Store(e) => Some(e),
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(value: StoreError) -> Self {
        ReconcileError::Store(value)
    }
}

pub trait ExistenceCheck {
    fn exists(&mut self, record: &HistoricalRecord, ts: DateTime<Utc>) -> Result<bool, StoreError>;
}

impl<F> ExistenceCheck for F
where
    F: FnMut(&HistoricalRecord, DateTime<Utc>) -> Result<bool, StoreError>,
{
    fn exists(&mut self, record: &HistoricalRecord, ts: DateTime<Utc>) -> Result<bool, StoreError> {
        self(record, ts)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum DedupKey {
    /// Any `temperature` point at the instant.
    #[default]
    Instant,
    /// A `temperature` point at the instant tagged with the record's device id.
    DeviceInstant,
}

/// [`ExistenceCheck`] backed by store queries. Each distinct query is sent
/// to the store once per check; nothing is written while a check is alive.
pub struct StoreCheck<'a, P: PointStore> {
    store: &'a mut P,
    key: DedupKey,
    seen: HashMap<ExistsQuery, bool>,
}

impl<'a, P: PointStore> StoreCheck<'a, P> {
    pub fn new(store: &'a mut P, key: DedupKey) -> Self {
        StoreCheck {
            store,
            key,
            seen: HashMap::new(),
        }
    }
}

impl<P: PointStore> ExistenceCheck for StoreCheck<'_, P> {
    fn exists(&mut self, record: &HistoricalRecord, ts: DateTime<Utc>) -> Result<bool, StoreError> {
        let query = ExistsQuery::at(Measurement::Temperature, STORE_PRECISION.truncate(ts));
        let query = match self.key {
            DedupKey::Instant => query,
            DedupKey::DeviceInstant => query.for_device(record.device_id.clone()),
        };
        if let Some(found) = self.seen.get(&query) {
            return Ok(*found);
        }
        let found = self.store.exists(&query)?;
        self.seen.insert(query, found);
        Ok(found)
    }
}

#[derive(Debug)]
pub struct Reconciled {
    pub batch: PointBatch,
    /// Records whose points were added to the batch.
    pub added: usize,
    pub already_stored: usize,
    pub invalid: usize,
}

/// Build the batch of missing history points. Nothing is written here; on
/// error no batch is returned at all.
pub fn reconcile<C: ExistenceCheck>(
    history: &[HistoricalRecord],
    target: &BatchTarget,
    check: &mut C,
) -> Result<Reconciled, ReconcileError> {
    let mut out = Reconciled {
        batch: PointBatch::new(target.clone()),
        added: 0,
        already_stored: 0,
        invalid: 0,
    };

    for (index, record) in history.iter().enumerate() {
        let ts = parse_rfc3339_utc(&record.time).map_err(|source| ReconcileError::Timestamp {
            index,
            device_id: record.device_id.clone(),
            time: record.time.clone(),
            source,
        })?;

        if check.exists(record, ts)? {
            out.already_stored += 1;
            continue;
        }
        if !record.valid {
            out.invalid += 1;
            debug!("Sync: skipping invalid record for device {} at {}", record.device_id, record.time);
            continue;
        }

        let mut tags = Tags::new();
        tags.insert(tag_keys::DEVICE_ID.to_string(), record.device_id.clone());
        add_sensor_points(&mut out.batch, &record.payload(), ts, &tags);
        out.added += 1;
    }

    Ok(out)
}

/// Reconcile `history` against `store` and write the result in one batch.
/// Returns the number of records synced.
pub fn run<P: PointStore>(store: &mut P, history: &[HistoricalRecord], key: DedupKey) -> Result<usize, ReconcileError> {
    info!("Sync: {} history entries", history.len());
    let target = store.target();
    let reconciled = {
        let mut check = StoreCheck::new(store, key);
        reconcile(history, &target, &mut check)?
    };

    info!(
        "Sync: {} record(s) to add, {} already stored, {} invalid",
        reconciled.added, reconciled.already_stored, reconciled.invalid
    );
    if !reconciled.batch.is_empty() {
        let written = store.write(reconciled.batch)?;
        debug!("Sync: {} point(s) inserted", written);
    }
    info!("Sync: points synced for {} record(s)", reconciled.added);
    Ok(reconciled.added)
}
