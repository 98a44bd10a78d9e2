//! The scheduling loop: once per clock tick it refreshes the calendar,
//! gates on freeze/fault, and synthesises tasks from per-channel schedules.
//! Guard cascade first, decisions after; every early return leaves state
//! untouched.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auto::effective_start;
use crate::channel::{Schedule, SkipReason, CHANNEL_COUNT};
use crate::clock::MAX_RTC_ERRORS;
use crate::core::{Core, SystemStatus};
use crate::events::AlarmCode;
use crate::store::keys;
use crate::task::{Task, Trigger, WaterTarget};

/// Rainfall lookback window for rain compensation.
const RAIN_WINDOW_SECS: i64 = 24 * 3600;

/// Cap on offline-gap catch-up so a wildly wrong clock cannot explode the
/// deficit.
const MAX_MISSED_DAYS: i64 = 30;

impl Core {
    /// One scheduler pass.  Public so tests and the loop share one path.
    pub async fn scheduler_tick(self: &Arc<Self>) {
        // ── 1. Clock refresh (RTC or monotonic fallback) ────────────
        let outcome = self.clock.refresh();
        if outcome.degraded_now {
            self.raise_alarm(AlarmCode::RtcError, MAX_RTC_ERRORS as u16);
        }

        // The scheduler tick is also the environmental sampling cadence;
        // the cache keeps its last good value on failure.
        let _ = self.weather.refresh();

        let now_unix = self.clock.now_unix();
        self.rain.sample(now_unix);

        if outcome.day_changed {
            if let Err(e) = self
                .store
                .save(keys::DAYS_SINCE_START, &self.clock.days_since_start())
                .await
            {
                warn!("persist days_since_start failed: {e:#}");
            }
            if let Err(e) = self.store.save(keys::RAIN_HISTORY, &self.rain.history()).await {
                warn!("persist rain history failed: {e:#}");
            }
            if let Err(e) = self.append_env_history(now_unix).await {
                warn!("persist environmental history failed: {e:#}");
            }
        }

        let Ok(mut state) = self.lock_state().await else {
            return; // contended; next tick retries
        };

        if outcome.day_changed {
            for ch in state.channels.iter_mut() {
                ch.runtime.auto_check_ran_today = false;
            }
        }

        self.refresh_status(&mut state);

        // ── 3. Freeze lockout vetoes everything ─────────────────────
        if self.check_freeze(&mut state) {
            return;
        }

        // ── 4. Fault gating.  An uncleared leak gates like a fault.
        // An RTC counting failures has unreliable time, so scheduling
        // waits; once degraded, monotonic fallback time is authoritative
        // again and scheduling resumes. ────────────────────────────────
        if matches!(
            state.status,
            SystemStatus::Fault | SystemStatus::UnexpectedFlow | SystemStatus::Locked
        ) {
            return;
        }
        if self.clock.rtc_errors() > 0 && !self.clock.degraded() {
            return;
        }

        // ── 5. Per-channel matching, index order ────────────────────
        let now = self.clock.now();
        let julian = now.julian_day();
        let minute = now.hour as u16 * 60 + now.minute as u16;

        for i in 0..CHANNEL_COUNT {
            let cfg = state.channels[i].config.clone();
            if !cfg.auto_enabled {
                continue;
            }

            let start = effective_start(&cfg, &now);
            if (start.hour, start.minute) != (now.hour, now.minute) {
                continue;
            }
            if state.channels[i].runtime.fired_at == Some((julian, minute)) {
                continue; // already handled this minute
            }

            let fire = match cfg.schedule {
                Schedule::Daily { days_mask } => days_mask & now.weekday_bit() != 0,
                Schedule::Periodic { interval_days } => {
                    let days = self.clock.days_since_start();
                    days > 0 && days % interval_days as u32 == 0
                }
                Schedule::Auto => {
                    self.auto_check(&mut state, i, julian, now_unix).await;
                    false // auto enqueues internally
                }
            };

            if !fire {
                continue;
            }

            // Queue headroom keeps manual slots free.
            if !state.queue.has_scheduler_headroom() {
                warn!(channel = i, "queue has no scheduler headroom, skipping");
                state.channels[i].runtime.last_skip = Some(SkipReason::QueueFull);
                continue;
            }

            // Rain gating: skip outright or shrink the target.
            let (target, trigger) = match self.rain_gate(&state, i, cfg.target, now_unix) {
                Some(adjusted) => adjusted,
                None => {
                    info!(channel = i, "skipped: recent rainfall over threshold");
                    state.channels[i].runtime.last_skip = Some(SkipReason::Rain);
                    state.channels[i].runtime.fired_at = Some((julian, minute));
                    continue;
                }
            };
            let target = self.temp_compensate(&state, i, target);

            let task = Task {
                channel: i as u8,
                trigger,
                target,
            };
            match state.queue.enqueue(task) {
                Ok(()) => {
                    info!(channel = i, ?trigger, ?target, "scheduled task enqueued");
                    let rt = &mut state.channels[i].runtime;
                    rt.last_watering_unix = rt.last_watering_unix.max(now_unix);
                    rt.last_skip = None;
                    rt.fired_at = Some((julian, minute));
                    self.persist_channel_runtime(&state, i).await;
                }
                Err(e) => {
                    warn!(channel = i, "enqueue failed: {e}");
                    state.channels[i].runtime.last_skip = Some(SkipReason::QueueFull);
                }
            }
        }
    }

    /// Append one day's environmental reading to the history blob.  A
    /// year of samples is retained.
    async fn append_env_history(&self, now_unix: i64) -> anyhow::Result<()> {
        const MAX_ENV_SAMPLES: usize = 366;

        let Some((reading, _)) = self.weather.cached() else {
            return Ok(());
        };
        let mut history: Vec<(i64, f32)> = self
            .store
            .load(keys::ENV_HISTORY)
            .await?
            .unwrap_or_default();
        history.push((now_unix, reading.temp_c));
        if history.len() > MAX_ENV_SAMPLES {
            let excess = history.len() - MAX_ENV_SAMPLES;
            history.drain(..excess);
        }
        self.store.save(keys::ENV_HISTORY, &history).await
    }

    /// Rain compensation for a configured event.  `None` means skip; a
    /// reduced target keeps a floor of 1 minute / 1 litre.
    fn rain_gate(
        &self,
        state: &crate::core::CoreState,
        index: usize,
        target: WaterTarget,
        now_unix: i64,
    ) -> Option<(WaterTarget, Trigger)> {
        let comp = &state.channels[index].config.compensation;
        if !state.settings.rain_integration || !comp.rain_enabled {
            return Some((target, Trigger::Scheduled));
        }

        let rain = self.rain.rainfall_mm(RAIN_WINDOW_SECS, now_unix);
        if rain < comp.rain_threshold_mm {
            return Some((target, Trigger::Scheduled));
        }
        if comp.rain_skip {
            return None;
        }

        let keep = 1.0 - comp.rain_reduction_pct.min(100) as f32 / 100.0;
        let adjusted = match target {
            WaterTarget::Duration { minutes } => WaterTarget::Duration {
                minutes: ((minutes as f32 * keep).round() as u16).max(1),
            },
            WaterTarget::Volume { litres } => WaterTarget::Volume {
                litres: ((litres as f32 * keep).round() as u16).max(1),
            },
        };
        debug!(channel = index, rain, ?adjusted, "rain-reduced target");
        Some((adjusted, Trigger::RainAdjusted))
    }

    /// Temperature compensation: scale the target around the configured
    /// base temperature, clamped to ±50%.
    fn temp_compensate(
        &self,
        state: &crate::core::CoreState,
        index: usize,
        target: WaterTarget,
    ) -> WaterTarget {
        let comp = &state.channels[index].config.compensation;
        if !comp.temp_enabled {
            return target;
        }
        let Some((reading, _)) = self.weather.cached() else {
            return target;
        };
        let factor = (1.0
            + comp.temp_pct_per_deg * (reading.temp_c - comp.temp_base_c) / 100.0)
            .clamp(0.5, 1.5);

        match target {
            WaterTarget::Duration { minutes } => WaterTarget::Duration {
                minutes: ((minutes as f32 * factor).round() as u16).max(1),
            },
            WaterTarget::Volume { litres } => WaterTarget::Volume {
                litres: ((litres as f32 * factor).round() as u16).max(1),
            },
        }
    }

    /// Deficit-driven auto check: at most once per julian day, with catch-up
    /// accumulation over offline gaps.
    async fn auto_check(
        &self,
        state: &mut crate::core::CoreState,
        index: usize,
        julian: u16,
        now_unix: i64,
    ) {
        let cfg = state.channels[index].config.clone();
        if !cfg.growing.auto_ready() {
            debug!(channel = index, "auto: plant/soil/install date incomplete");
            return;
        }
        {
            let rt = &state.channels[index].runtime;
            if rt.auto_check_ran_today && rt.last_auto_check_julian == julian {
                return;
            }
        }

        let temp = self.weather.cached().map(|(r, _)| r.temp_c);
        let rain_today = self.rain.rainfall_mm(RAIN_WINDOW_SECS, now_unix);
        let today_epoch_day = now_unix / 86_400;

        let mut deficit = state.channels[index].runtime.deficit_mm;

        // Offline gap: intervening days accumulate with no rain knowledge.
        let last_day = state.channels[index].runtime.last_auto_check_epoch_day;
        if last_day > 0 {
            let gap = (today_epoch_day - last_day - 1).clamp(0, MAX_MISSED_DAYS);
            for _ in 0..gap {
                deficit += self.model.daily_deficit_mm(&cfg, temp, 0.0);
            }
        }
        deficit = (deficit + self.model.daily_deficit_mm(&cfg, temp, rain_today)).max(0.0);

        let decision = self.model.decide(&cfg, deficit);
        info!(
            channel = index,
            deficit_mm = decision.current_deficit_mm,
            should_water = decision.should_water,
            volume_l = decision.volume_litres,
            "auto check"
        );

        let mut watered_litres = 0.0f32;
        if decision.should_water
            && decision.volume_litres >= 1.0
            && state.queue.has_scheduler_headroom()
        {
            let litres = decision.volume_litres.round().min(u16::MAX as f32) as u16;
            let task = Task {
                channel: index as u8,
                trigger: Trigger::AutoDeficit,
                target: WaterTarget::Volume { litres },
            };
            match state.queue.enqueue(task) {
                Ok(()) => {
                    watered_litres = litres as f32;
                    let rt = &mut state.channels[index].runtime;
                    rt.last_watering_unix = rt.last_watering_unix.max(now_unix);
                    rt.last_skip = None;
                }
                Err(e) => {
                    warn!(channel = index, "auto enqueue failed: {e}");
                    state.channels[index].runtime.last_skip = Some(SkipReason::QueueFull);
                }
            }
        }

        let rt = &mut state.channels[index].runtime;
        let area = cfg.growing.area_m2.max(1.0);
        rt.deficit_mm = (deficit - watered_litres / area).max(0.0);
        rt.last_auto_check_julian = julian;
        rt.last_auto_check_epoch_day = today_epoch_day;
        rt.auto_check_ran_today = true;
        self.persist_channel_runtime(state, index).await;
    }
}

// ---------------------------------------------------------------------------
// Scheduler loop
// ---------------------------------------------------------------------------

/// Run the scheduler until shutdown.  Intended to be `tokio::spawn`-ed.
pub async fn run_scheduler_loop(core: Arc<Core>) {
    info!("scheduler loop started");
    loop {
        if core.shutting_down() {
            break;
        }
        let started = Instant::now();
        core.scheduler_tick().await;

        let period = match core.lock_state().await {
            Ok(state) => state.settings.power_mode.scheduler_period(),
            Err(_) => crate::config::PowerMode::Normal.scheduler_period(),
        };
        tokio::time::sleep(period.saturating_sub(started.elapsed())).await;
    }
    info!("scheduler loop stopped");
}

// ===========================================================================
// Tests
// ===========================================================================
