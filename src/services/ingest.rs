use log::{debug, error, info, warn};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use crate::db::store::PointStore;
use crate::models::things::SensorMessage;
use crate::services::normalize::normalize;
use crate::shutdown::CancellationToken;
use crate::transport::MessageSource;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestStats {
    pub received: u64,
    pub written: u64,
    pub decode_errors: u64,
    pub normalize_errors: u64,
    pub write_errors: u64,
}

/// Pull messages until the source closes or `cancel` fires.
///
/// Every failure is logged and the message dropped; nothing is retried.
pub fn run_loop<S, P>(source: &mut S, store: &mut P, cancel: &CancellationToken) -> IngestStats
where
    S: MessageSource,
    P: PointStore,
{
    let target = store.target();
    let mut stats = IngestStats::default();

    while !cancel.is_cancelled() {
        let msg = match source.next() {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                info!("Ingest: transport closed");
                break;
            }
            Err(e) => {
                stats.decode_errors += 1;
                warn!("Ingest: {}", e);
                continue;
            }
        };
        stats.received += 1;
        log_message(&msg);

        let batch = match normalize(&msg, &target) {
            Ok(batch) => batch,
            Err(e) => {
                stats.normalize_errors += 1;
                warn!("Ingest: dropping message: {}", e);
                continue;
            }
        };

        let points = batch.len();
        match store.write(batch) {
            Ok(_) => {
                stats.written += 1;
                debug!("Ingest: device {} wrote {} point(s)", msg.dev_id, points);
            }
            Err(e) => {
                stats.write_errors += 1;
                error!(
                    "Ingest: write of {} point(s) for device {} at {} failed: {}",
                    points, msg.dev_id, msg.metadata.time, e
                );
            }
        }
    }

    stats
}

fn log_message(msg: &SensorMessage) {
    match msg.payload_fields.as_ref() {
        Some(p) if p.valid => info!(
            "Node {} at {}: temperature={} humidity={} battery={} rain={} pressure={}",
            msg.dev_id,
            msg.metadata.time,
            p.temp,
            p.humd,
            p.bat,
            p.rain.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            p.pres.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
        ),
        Some(_) => info!("Node {} at {}: invalid payload", msg.dev_id, msg.metadata.time),
        None => info!("Node {} at {}: no decoded payload", msg.dev_id, msg.metadata.time),
    }
    for gw in &msg.metadata.gateways {
        debug!("  gateway {} rssi={} snr={}", gw.gtw_id, gw.rssi, gw.snr);
    }
}

/// Run [`run_loop`] on a dedicated thread that owns `source` and `store`.
///
/// When the loop ends the store is closed and `cancel` is fired, so a thread
/// waiting on the token also learns that the worker stopped. The stats arrive
/// on the returned receiver.
pub fn spawn<S, P>(mut source: S, mut store: P, cancel: CancellationToken) -> std::io::Result<Receiver<IngestStats>>
where
    S: MessageSource + Send + 'static,
    P: PointStore + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new().name("ingest".into()).spawn(move || {
        let stats = run_loop(&mut source, &mut store, &cancel);
        store.close();
        cancel.cancel();
        info!(
            "Ingest: stopped (received={}, written={}, decode_errors={}, normalize_errors={}, write_errors={})",
            stats.received, stats.written, stats.decode_errors, stats.normalize_errors, stats.write_errors
        );
        let _ = tx.send(stats);
    })?;
    Ok(rx)
}
