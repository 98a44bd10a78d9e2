//! Controller entry point: reads env/config, opens the store, builds the
//! core, and wires up the loops, the wireless surface and signal handling.
//!
//! Safety features:
//! - Signal handler: SIGTERM/SIGINT → all valves off before exit
//! - A dead task loop or scheduler loop is fatal (exit closes valves)
//! - Valves fail-safe de-energised at startup

use std::env;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use controller::auto::ReferenceModel;
use controller::channel::CHANNEL_COUNT;
use controller::clock::SystemRtc;
use controller::config::{self, SystemSettings};
use controller::core::{Core, CoreOptions};
use controller::store::{keys, Store};
use controller::{executor, scheduler, surface};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Structured logging ──────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── Config file + env overrides ─────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "controller.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    config::apply_env_overrides(&mut cfg);

    // ── Persistent store ────────────────────────────────────────────
    let store = Store::open(&cfg.db_url).await?;
    store.migrate().await?;

    // Settings: the store wins after first boot.
    let settings = match store.load::<SystemSettings>(keys::SYSTEM).await? {
        Some(s) => s,
        None => {
            let s = SystemSettings {
                power_mode: cfg.power_mode,
                rain_integration: cfg.rain_integration,
                master: cfg.master,
            };
            store.save(keys::SYSTEM, &s).await?;
            s
        }
    };

    // First-boot channel seeding from the config file.
    for seed in &cfg.channels {
        if !store.exists(&keys::channel(seed.index)).await? {
            let channel_cfg = seed.to_channel_config()?;
            store
                .save(&keys::channel(seed.index), &channel_cfg)
                .await
                .with_context(|| format!("failed to seed channel {}", seed.index))?;
            info!(channel = seed.index, name = %channel_cfg.name, "seeded channel from config");
        }
    }
    // A seeded deployment counts as onboarded; a factory wipe clears this.
    if !cfg.channels.is_empty() && !store.exists(keys::ONBOARDING).await? {
        store.save(keys::ONBOARDING, &true).await?;
    }

    // ── Drivers ─────────────────────────────────────────────────────
    #[cfg(feature = "sim")]
    let scenario = controller::sim::Scenario::from_str_lossy(
        &env::var("SIM_SCENARIO").unwrap_or_default(),
    );
    #[cfg(feature = "sim")]
    let env_sensor: Box<dyn controller::weather::EnvSensor> =
        Box::new(controller::sim::SimEnv::new(scenario));
    #[cfg(not(feature = "sim"))]
    let env_sensor: Box<dyn controller::weather::EnvSensor> =
        Box::new(controller::weather::ManualEnv::new(20.0));

    // ── Core ────────────────────────────────────────────────────────
    let core = Arc::new(
        Core::new(CoreOptions {
            store,
            rtc: Box::new(SystemRtc),
            env_sensor,
            model: Box::new(ReferenceModel),
            channel_pins: cfg.channel_pins,
            master_pin: cfg.master_pin,
            relay_active_low: cfg.relay_active_low,
            settings,
            rain_mm_per_tip: cfg.rain_mm_per_tip,
        })
        .context("core construction failed")?,
    );
    core.boot().await?;
    info!(
        channels = CHANNEL_COUNT,
        power_mode = ?settings.power_mode,
        surface = cfg.surface_enabled,
        "controller ready"
    );

    // ── Loops + surface ─────────────────────────────────────────────
    let mut task_handle = tokio::spawn(executor::run_task_loop(Arc::clone(&core)));
    let mut scheduler_handle = tokio::spawn(scheduler::run_scheduler_loop(Arc::clone(&core)));
    let mut surface_handle = {
        let core = Arc::clone(&core);
        let host = cfg.mqtt_host.clone();
        let port = cfg.mqtt_port;
        let enabled = cfg.surface_enabled;
        tokio::spawn(async move {
            surface::run(core, &host, port, enabled).await;
            // A disabled surface returns immediately; park so the monitor
            // below does not treat that as a crash.
            std::future::pending::<()>().await;
        })
    };

    #[cfg(feature = "sim")]
    {
        tokio::spawn(controller::sim::run_flow_sim(Arc::clone(&core)));
        tokio::spawn(controller::sim::run_rain_sim(Arc::clone(&core), scenario));
        info!(?scenario, "simulated drivers running");
    }

    // ── Signal handling ─────────────────────────────────────────────
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let exit_reason;
    loop {
        tokio::select! {
            result = &mut task_handle => {
                error!("CRITICAL: task loop exited unexpectedly: {result:?}");
                exit_reason = "task loop died";
                break;
            }
            result = &mut scheduler_handle => {
                error!("CRITICAL: scheduler loop exited unexpectedly: {result:?}");
                exit_reason = "scheduler loop died";
                break;
            }
            result = &mut surface_handle => {
                // Not safety-critical; the core keeps running headless.
                warn!("wireless surface exited: {result:?}");
            }
            _ = &mut ctrl_c => {
                exit_reason = "SIGINT";
                break;
            }
            _ = sigterm.recv() => {
                exit_reason = "SIGTERM";
                break;
            }
        }
    }

    // ── Graceful shutdown ───────────────────────────────────────────
    warn!(signal = exit_reason, "shutting down, closing all valves");
    core.request_shutdown();
    core.emergency_all_off(exit_reason).await;
    info!("shutdown complete");
    Ok(())
}
