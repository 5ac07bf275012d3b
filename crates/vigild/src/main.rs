use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tracing_subscriber::EnvFilter;
use vigil_core::{PersistedState, SecurityStateMachine};
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::{BusKind, Config};
use dbus_interface::{VigilService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("vigild starting");

    let config = Config::load()?;
    tracing::info!(
        db = %config.db_path.display(),
        tick_ms = config.tick_interval_ms,
        bus = ?config.bus,
        "configuration loaded"
    );

    let store = store::Store::open(&config.db_path)?;
    let mut machine =
        SecurityStateMachine::new(config.settings).with_gesture_config(config.gesture);
    if let Some(persisted) = store.load_state()? {
        let settings = store::merge_settings(config.settings, &persisted.settings);
        machine.restore(
            Utc::now(),
            PersistedState {
                settings,
                ..persisted
            },
        );
    }

    let (intent_tx, mut intent_rx) = mpsc::unbounded_channel();
    let engine = engine::spawn_engine(machine, store, intent_tx);

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, VigilService::new(engine.clone()))?
        .build()
        .await?;
    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "D-Bus interface registered");

    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?.into_owned();
    tokio::spawn(async move {
        while let Some(intent) = intent_rx.recv().await {
            if let Err(e) = VigilService::action(&emitter, &intent.to_json()).await {
                tracing::warn!(error = %e, "failed to emit action signal");
            }
        }
    });

    let ticker = engine.clone();
    let period = Duration::from_millis(config.tick_interval_ms);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if ticker.tick().await.is_err() {
                tracing::error!("engine stopped; tick task exiting");
                break;
            }
        }
    });

    tracing::info!("vigild ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("vigild shutting down");

    Ok(())
}
