use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use caldaia_control::{
    supervise, ControlError, OverheatingController, RestartPolicy, RuleTimingController,
    SwitchController,
};
use caldaia_core::config::CaldaiaConfig;
use caldaia_store::{Boiler, SensorHistory};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "caldaia", version, about = "Home boiler controller")]
struct Args {
    /// Config file (default: $CALDAIA_CONFIG, then ~/.caldaia/caldaia.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "caldaia_daemon=info,caldaia_control=info,caldaia_store=info".into()
            }),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("CALDAIA_GIT_SHA"),
        "caldaia starting"
    );

    // load config: --config > CALDAIA_CONFIG env > ~/.caldaia/caldaia.toml
    let config_path = args.config.or_else(|| std::env::var("CALDAIA_CONFIG").ok());
    let config = CaldaiaConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        CaldaiaConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");

    // each handle gets its own connection
    let boiler = Boiler::open(open_db(db_path)?, config.boiler.clone())?;
    let sensor = SensorHistory::open(open_db(db_path)?, &config.sensor.key())?;

    let info = boiler.info()?;
    info!(
        boiler = %boiler.name(),
        state = %info.state,
        rules = info.rules.len(),
        protection = info.is_overheating_protection_active,
        "boiler loaded"
    );
    // Rule weekdays and times of day are read in the process zone (TZ).
    info!(utc_offset = %chrono::Local::now().offset(), "planning in local time");

    let shutdown = CancellationToken::new();
    let policy = RestartPolicy {
        max_restarts: config.control.max_restarts,
        delay: Duration::from_secs(config.control.restart_delay_secs),
    };
    let mut loops: JoinSet<caldaia_control::Result<()>> = JoinSet::new();

    {
        let sensor = sensor.clone();
        let every = Duration::from_secs(config.sensor.poll_interval_secs.max(1));
        let token = shutdown.clone();
        loops.spawn(supervise("sensor follower", policy, shutdown.clone(), move || {
            let (sensor, token) = (sensor.clone(), token.clone());
            async move { sensor.follow(every, token).await.map_err(ControlError::from) }
        }));
    }

    {
        let timing = Arc::new(RuleTimingController::new(boiler.clone()));
        let token = shutdown.clone();
        loops.spawn(supervise("rule timing", policy, shutdown.clone(), move || {
            let (timing, token) = (timing.clone(), token.clone());
            async move { timing.run(token).await }
        }));
    }

    {
        let switch = Arc::new(SwitchController::new(
            boiler.clone(),
            Arc::new(sensor),
            config.control.average_window(),
        ));
        let token = shutdown.clone();
        loops.spawn(supervise("boiler switch", policy, shutdown.clone(), move || {
            let (switch, token) = (switch.clone(), token.clone());
            async move { switch.run(token).await }
        }));
    }

    {
        let overheating = Arc::new(OverheatingController::new(
            boiler.clone(),
            Duration::from_secs(config.control.overheating_tick_secs.max(1)),
        ));
        let token = shutdown.clone();
        loops.spawn(supervise("overheating", policy, shutdown.clone(), move || {
            let (overheating, token) = (overheating.clone(), token.clone());
            async move { overheating.run(token).await }
        }));
    }

    info!("control loops running");

    // Supervised loops only return early once their restart budget is spent.
    let fatal = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            None
        }
        Some(joined) = loops.join_next() => Some(joined),
    };

    shutdown.cancel();
    while let Some(joined) = loops.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "control loop failed during shutdown"),
            Err(e) => error!(error = %e, "control loop panicked during shutdown"),
        }
    }

    if let Some(joined) = fatal {
        joined
            .context("control loop panicked")?
            .context("control loop gave up")?;
        anyhow::bail!("control loop exited unexpectedly");
    }

    info!("caldaia stopped");
    Ok(())
}

fn open_db(path: &str) -> anyhow::Result<rusqlite::Connection> {
    let conn = rusqlite::Connection::open(path)
        .with_context(|| format!("opening database at {path}"))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
    Ok(conn)
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
