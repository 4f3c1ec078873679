//! Polls the weather-station live-data page and stores each reading.

use log::{error, info};
use std::path::Path;
use std::time::Duration;

use things_weather::cli::{self, Args};
use things_weather::client::StationClient;
use things_weather::config::{self, Config};
use things_weather::db::store::{PointStore, TimescaleStore};
use things_weather::services::station;
use things_weather::shutdown::CancellationToken;

fn run(args: &Args) -> Result<(), String> {
    let cfg = Config::from_file(&args.config)
        .map_err(|e| format!("Loading config {} failed: {}", args.config.display(), e))?;
    let rate = Duration::from_secs(args.rate.unwrap_or(cfg.station.rate_secs));
    info!(
        "Config loaded (db={}@{}, station={}, url={}, rate={}s, utc_offset={}h)",
        cfg.db_config.database,
        cfg.db_config.host_address,
        cfg.station.name,
        cfg.station.url,
        rate.as_secs(),
        cfg.station.utc_offset_hours
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || cancel.cancel())
            .map_err(|e| format!("Installing signal handler failed: {}", e))?;
    }

    let mut store = TimescaleStore::connect(&cfg.db_config).map_err(|e| format!("DB connection failed: {}", e))?;
    info!("Connected to database");

    if let Err(e) = cancel.checkpoint("database connect") {
        info!("Termination signal received: {}, shutting down", e);
        store.close();
        return Ok(());
    }

    let client = StationClient::new(&cfg.station);
    station::run_loop(&client, &mut store, rate, &cancel);
    store.close();
    Ok(())
}

fn main() {
    let args = match cli::parse(std::env::args_os().skip(1), true) {
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
        if let Err(e) = config::write_template(Path::new(config::TEMPLATE_FILE)) {
            error!("fatal: writing {} failed: {}", config::TEMPLATE_FILE, e);
            std::process::exit(1);
        }
        info!("Template configuration written to {}", config::TEMPLATE_FILE);
        return;
    }

    info!(
        "stbstation {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );
    if let Err(e) = run(&args) {
        error!("fatal: {}", e);
        std::process::exit(1);
    }
}
