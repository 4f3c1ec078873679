use log::{error, info, warn};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use things_weather::cli::{self, Args};
use things_weather::client::HistoryClient;
use things_weather::config::{self, Config};
use things_weather::db::store::{PointStore, TimescaleStore};
use things_weather::services::ingest;
use things_weather::services::reconcile::{self, DedupKey};
use things_weather::shutdown::{self, await_worker, CancellationToken};
use things_weather::transport::MqttTransport;

fn sync_history<P: PointStore>(cfg: &Config, store: &mut P) -> Result<(), String> {
    let client = HistoryClient::new(&cfg.m_config);
    let history = match client.get_history(&cfg.m_config.history_window) {
        Ok(history) => history,
        Err(e) => {
            warn!("Fetching history failed, skipping sync: {}", e);
            return Ok(());
        }
    };
    let key = if cfg.sync.dedup_by_device {
        DedupKey::DeviceInstant
    } else {
        DedupKey::Instant
    };
    reconcile::run(store, &history, key).map_err(|e| format!("Sync failed: {}", e))?;
    Ok(())
}

/// Log and report true once a termination signal arrived during startup.
fn interrupted(cancel: &CancellationToken, stage: &'static str) -> bool {
    match cancel.checkpoint(stage) {
        Ok(()) => false,
        Err(e) => {
            info!("Termination signal received: {}, shutting down", e);
            true
        }
    }
}

fn run(args: &Args) -> Result<(), String> {
    // 1) Load config
    let cfg = Config::from_file(&args.config)
        .map_err(|e| format!("Loading config {} failed: {}", args.config.display(), e))?;
    info!(
        "Config loaded (db={}@{}, application={}, broker={}, sync_enabled={}, dedup_by_device={}, grace={}s)",
        cfg.db_config.database,
        cfg.db_config.host_address,
        cfg.m_config.username,
        cfg.m_config.broker,
        cfg.sync.enabled,
        cfg.sync.dedup_by_device,
        cfg.shutdown_grace_secs
    );

    // 2) Catch SIGINT/SIGTERM from here on
    let cancel = CancellationToken::new();
    let signalled = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let signalled = Arc::clone(&signalled);
        ctrlc::set_handler(move || {
            signalled.store(true, Ordering::SeqCst);
            cancel.cancel();
        })
        .map_err(|e| format!("Installing signal handler failed: {}", e))?;
    }

    // 3) Connect store and apply migrations
    let mut store = TimescaleStore::connect(&cfg.db_config).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");
    if interrupted(&cancel, "database connect") {
        store.close();
        return Ok(());
    }

    // 4) Connect transport
    let (source, transport) =
        MqttTransport::connect(&cfg.m_config).map_err(|e| format!("MQTT connection failed: {}", e))?;
    if interrupted(&cancel, "MQTT connect") {
        transport.close();
        store.close();
        return Ok(());
    }

    // 5) Reconcile stored history before streaming
    if cfg.sync.enabled {
        if let Err(e) = sync_history(&cfg, &mut store) {
            transport.close();
            store.close();
            return Err(e);
        }
    } else {
        info!("History sync disabled via Sync.Enabled={}", cfg.sync.enabled);
    }
    if interrupted(&cancel, "history sync") {
        transport.close();
        store.close();
        return Ok(());
    }

    // 6) Stream until a termination signal or the worker stops
    let worker = ingest::spawn(source, store, cancel.clone())
        .map_err(|e| format!("Spawning ingest worker failed: {}", e))?;
    info!("Streaming uplinks on {}", cfg.m_config.topic);
    shutdown::notify_ready();

    cancel.wait();
    let signal = signalled.load(Ordering::SeqCst);
    if signal {
        info!("Termination signal received, shutting down");
    }
    transport.close();

    let stats = await_worker(&worker, cfg.shutdown_grace()).map_err(|e| e.to_string())?;
    info!(
        "Shutdown complete: {} message(s) received, {} written",
        stats.received, stats.written
    );
    if !signal {
        return Err("transport closed unexpectedly".into());
    }
    Ok(())
}

fn main() {
    let args = match cli::parse(std::env::args_os().skip(1), false) {
        Ok(args) => args,
        Err(err) => {
            eprintln!("fatal: {}", err);
            std::process::exit(1);
        }
    };

    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    if args.template {
        match config::write_template(Path::new(config::TEMPLATE_FILE)) {
            Ok(()) => info!("Template configuration written to {}", config::TEMPLATE_FILE),
            Err(e) => {
                error!("fatal: writing {} failed: {}", config::TEMPLATE_FILE, e);
                std::process::exit(1);
            }
        }
        return;
    }

    info!(
        "things-weather {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&args) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
