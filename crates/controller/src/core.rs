//! The `Core` aggregate: one state block behind one mutex, shared by the
//! task loop, the scheduler loop and the delayed-work sleepers.  Adapters
//! receive a handle to the core and talk to it through the public API here;
//! the core talks back only through the event bus.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::auto::DeficitModel;
use crate::channel::{
    ChannelConfig, ChannelState, ChannelTotals, SkipReason, CHANNEL_COUNT,
};
use crate::clock::{Clock, Rtc, RtcTime};
use crate::config::SystemSettings;
use crate::error::{Error, FlowAnomaly, Result};
use crate::events::{AlarmCode, CoreEvent, EventBus};
use crate::executor::ActiveTask;
use crate::flow::{FlowMeter, DEFAULT_PULSES_PER_LITRE};
use crate::master::MasterState;
use crate::monitor::MonitorState;
use crate::safety::FreezeState;
use crate::store::{keys, Store};
use crate::task::{Task, TaskQueue, TaskResult, Trigger, WaterTarget};
use crate::valve::ValveBank;
use crate::weather::{EnvSensor, RainGauge, RainSample, Weather};
use crate::wipe::WipeControl;

/// Bounded wait for the state mutex; contention surfaces as `Busy` instead
/// of blocking a loop past its period.
pub(crate) const LOCK_TIMEOUT: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// System status
// ---------------------------------------------------------------------------

/// Aggregated worst-condition status, mirrored to the SystemStatus record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SystemStatus {
    Ok = 0,
    NoFlow = 1,
    UnexpectedFlow = 2,
    Fault = 3,
    RtcError = 4,
    LowPower = 5,
    FreezeLockout = 6,
    Locked = 7,
}

// ---------------------------------------------------------------------------
// Shared state block
// ---------------------------------------------------------------------------

/// Snapshot of a finished task, retained for one reporting cycle.
#[derive(Debug, Clone, Copy)]
pub struct CompletedTask {
    pub task: Task,
    pub result: TaskResult,
    pub effective_secs: u64,
    pub delivered_ml: u64,
    pub ended_unix: i64,
    /// Set once the task loop has published it; cleared the cycle after.
    pub reported: bool,
}

pub struct CoreState {
    pub channels: [ChannelState; CHANNEL_COUNT],
    pub queue: TaskQueue,
    pub active: Option<ActiveTask>,
    pub last_completed: Option<CompletedTask>,
    pub bank: ValveBank,
    pub master: MasterState,
    pub monitor: MonitorState,
    pub freeze: FreezeState,
    pub wipe: WipeControl,
    pub settings: SystemSettings,
    pub status: SystemStatus,
}

impl CoreState {
    /// Worst-condition aggregation.  Order encodes severity.
    fn compute_status(&self, clock_degraded: bool) -> SystemStatus {
        if self.monitor.faulted {
            return SystemStatus::Fault;
        }
        match self.monitor.latched {
            Some(FlowAnomaly::UnexpectedFlow) => return SystemStatus::UnexpectedFlow,
            Some(FlowAnomaly::NoFlow) => return SystemStatus::NoFlow,
            None => {}
        }
        if clock_degraded {
            return SystemStatus::RtcError;
        }
        if self.freeze.locked {
            return SystemStatus::FreezeLockout;
        }
        if self.wipe.in_progress() {
            return SystemStatus::Locked;
        }
        if self.settings.power_mode != crate::config::PowerMode::Normal {
            return SystemStatus::LowPower;
        }
        SystemStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Core
// ---------------------------------------------------------------------------

pub struct CoreOptions {
    pub store: Store,
    pub rtc: Box<dyn Rtc>,
    pub env_sensor: Box<dyn EnvSensor>,
    pub model: Box<dyn DeficitModel>,
    pub channel_pins: [u8; CHANNEL_COUNT],
    pub master_pin: Option<u8>,
    pub relay_active_low: bool,
    pub settings: SystemSettings,
    pub rain_mm_per_tip: f32,
}

pub struct Core {
    pub(crate) state: Mutex<CoreState>,
    pub(crate) flow: FlowMeter,
    pub(crate) clock: Clock,
    pub(crate) weather: Weather,
    pub(crate) rain: RainGauge,
    pub(crate) store: Store,
    pub(crate) bus: EventBus,
    pub(crate) model: Box<dyn DeficitModel>,
    pub(crate) booted_at: Instant,
    booted: AtomicBool,
    shutdown: AtomicBool,
    error_count: AtomicU16,
    last_error: AtomicU8,
}

impl Core {
    pub fn new(opts: CoreOptions) -> Result<Self> {
        let bus = EventBus::default();
        let flow = FlowMeter::new(DEFAULT_PULSES_PER_LITRE);
        let bank = ValveBank::new(
            &opts.channel_pins,
            opts.relay_active_low,
            flow.clone(),
            bus.clone(),
        )?;
        let master = MasterState::new(
            opts.master_pin,
            opts.relay_active_low,
            opts.settings.master,
            bus.clone(),
        )?;

        let state = CoreState {
            channels: std::array::from_fn(ChannelState::factory_default),
            queue: TaskQueue::default(),
            active: None,
            last_completed: None,
            bank,
            master,
            monitor: MonitorState::default(),
            freeze: FreezeState::default(),
            wipe: WipeControl::default(),
            settings: opts.settings,
            status: SystemStatus::Ok,
        };

        Ok(Self {
            state: Mutex::new(state),
            flow,
            clock: Clock::new(opts.rtc, 0),
            weather: Weather::new(opts.env_sensor),
            rain: RainGauge::new(opts.rain_mm_per_tip),
            store: opts.store,
            bus,
            model: opts.model,
            booted_at: Instant::now(),
            booted: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            error_count: AtomicU16::new(0),
            last_error: AtomicU8::new(0),
        })
    }

    // ----------------------------
    // Boot / shutdown
    // ----------------------------

    /// Load-all from the store, then resume an unfinished wipe if one was
    /// interrupted by the reboot.
    pub async fn boot(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().await;

            for i in 0..CHANNEL_COUNT {
                if let Some(cfg) = self.store.load::<ChannelConfig>(&keys::channel(i)).await? {
                    state.channels[i].config = cfg;
                }
                if let Some(rt) = self
                    .store
                    .load::<crate::channel::ChannelRuntime>(&keys::channel_runtime(i))
                    .await?
                {
                    state.channels[i].runtime = rt;
                    state.channels[i].runtime.is_active = false;
                }
            }

            if let Some(settings) = self
                .store
                .load::<SystemSettings>(keys::SYSTEM)
                .await?
            {
                state.settings = settings;
                state.master.cfg = settings.master;
            }

            if let Some(ppl) = self.store.load::<u32>(keys::CALIBRATION).await? {
                self.flow.set_calibration(ppl)?;
            }
            if let Some(days) = self.store.load::<u32>(keys::DAYS_SINCE_START).await? {
                self.clock.set_days_since_start(days);
            }
            if let Some(samples) = self
                .store
                .load::<Vec<RainSample>>(keys::RAIN_HISTORY)
                .await?
            {
                self.rain.restore(samples);
            }
            if let Some(progress) = self
                .store
                .load::<crate::wipe::WipeProgress>(keys::WIPE_PROGRESS)
                .await?
            {
                state.wipe.progress = progress;
            }

            self.refresh_status(&mut state);
        }

        self.booted.store(true, Ordering::SeqCst);
        info!("core boot complete");

        self.resume_wipe_if_pending().await?;
        Ok(())
    }

    pub fn is_booted(&self) -> bool {
        self.booted.load(Ordering::SeqCst)
    }

    /// Raise the exit flag; loops observe it at the top of each iteration.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Close everything now.  Used on signal-driven shutdown and fatal
    /// faults; safe to call repeatedly.
    pub async fn emergency_all_off(&self, reason: &str) {
        warn!(reason, "all valves off");
        let mut state = self.state.lock().await;
        state.bank.close_all();
        let _ = state.master.close_now();
        if let Some(active) = state.active.take() {
            state.channels[active.task.channel as usize].runtime.is_active = false;
        }
    }

    // ----------------------------
    // State access helpers
    // ----------------------------

    /// Bounded-wait acquisition of the state block.
    pub(crate) async fn lock_state(&self) -> Result<MutexGuard<'_, CoreState>> {
        tokio::time::timeout(LOCK_TIMEOUT, self.state.lock())
            .await
            .map_err(|_| Error::Busy("state lock"))
    }

    /// Recompute the aggregate status and publish on change.
    pub(crate) fn refresh_status(&self, state: &mut CoreState) {
        let status = state.compute_status(self.clock.degraded());
        if status != state.status {
            state.status = status;
            info!(?status, "system status changed");
            self.bus.emit(CoreEvent::StatusChanged { status });
        }
    }

    /// Record an alarm: counter, event, and the Alarm record mirror.
    pub(crate) fn raise_alarm(&self, code: AlarmCode, data: u16) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.last_error.store(code as u8, Ordering::Relaxed);
        self.bus.emit(CoreEvent::AlarmRaised {
            code,
            data,
            timestamp: self.clock.now_unix().max(0) as u32,
        });
    }

    pub(crate) async fn persist_channel_runtime(&self, state: &CoreState, id: usize) {
        let rt = &state.channels[id].runtime;
        if let Err(e) = self.store.save(&keys::channel_runtime(id), rt).await {
            warn!(channel = id, "persist channel runtime failed: {e:#}");
        }
    }

    // ----------------------------
    // Public API: tasks
    // ----------------------------

    /// Enqueue a watering request.  The task carries the effective target;
    /// the channel's configured event is never touched on any path.
    pub async fn add_task(&self, channel: u8, trigger: Trigger, target: WaterTarget) -> Result<()> {
        if !self.is_booted() {
            return Err(Error::NotInitialized);
        }
        let task = Task {
            channel,
            trigger,
            target,
        };
        task.validate()?;

        let mut state = self.lock_state().await?;

        if state.freeze.locked {
            state.channels[channel as usize].runtime.last_skip = Some(SkipReason::Freeze);
            return Err(Error::Busy("freeze lockout"));
        }
        if state.wipe.in_progress() {
            return Err(Error::Busy("factory wipe in progress"));
        }

        match state.queue.enqueue(task) {
            Ok(()) => {
                info!(channel, ?trigger, ?target, "task enqueued");
                Ok(())
            }
            Err(e) => {
                state.channels[channel as usize].runtime.last_skip = Some(SkipReason::QueueFull);
                Err(e)
            }
        }
    }

    /// Remove every pending task; the active one keeps running.
    pub async fn clear_queue(&self) -> Result<usize> {
        let mut state = self.lock_state().await?;
        let removed = state.queue.purge();
        if removed > 0 {
            info!(removed, "task queue cleared");
        }
        Ok(removed)
    }

    // ----------------------------
    // Public API: configuration
    // ----------------------------

    pub async fn channel_config(&self, id: u8) -> Result<ChannelConfig> {
        if id as usize >= CHANNEL_COUNT {
            return Err(Error::InvalidParam("channel index out of range"));
        }
        let state = self.lock_state().await?;
        Ok(state.channels[id as usize].config.clone())
    }

    pub async fn set_channel_config(&self, id: u8, cfg: ChannelConfig) -> Result<()> {
        if id as usize >= CHANNEL_COUNT {
            return Err(Error::InvalidParam("channel index out of range"));
        }
        cfg.validate()?;
        let mut state = self.lock_state().await?;
        self.store.save(&keys::channel(id as usize), &cfg).await?;
        state.channels[id as usize].config = cfg;
        Ok(())
    }

    pub async fn settings(&self) -> Result<SystemSettings> {
        Ok(self.lock_state().await?.settings)
    }

    pub async fn set_settings(&self, settings: SystemSettings) -> Result<()> {
        let mut state = self.lock_state().await?;
        self.store.save(keys::SYSTEM, &settings).await?;
        state.settings = settings;
        state.master.cfg = settings.master;
        self.refresh_status(&mut state);
        Ok(())
    }

    pub fn set_calibration(&self, pulses_per_litre: u32) -> Result<()> {
        self.flow.set_calibration(pulses_per_litre)
    }

    /// Persist the current calibration; kept separate so a calibration
    /// session can adjust repeatedly and commit once.
    pub async fn save_calibration(&self) -> Result<()> {
        self.store
            .save(keys::CALIBRATION, &self.flow.calibration())
            .await?;
        Ok(())
    }

    pub fn calibration(&self) -> u32 {
        self.flow.calibration()
    }

    pub fn rtc_now(&self) -> RtcTime {
        self.clock.now()
    }

    pub fn set_rtc(&self, t: &RtcTime) -> Result<()> {
        self.clock.set_time(t)
    }

    // ----------------------------
    // Public API: introspection
    // ----------------------------

    pub async fn status(&self) -> Result<SystemStatus> {
        Ok(self.lock_state().await?.status)
    }

    pub async fn queue_info(&self) -> Result<QueueInfo> {
        let state = self.lock_state().await?;
        Ok(QueueInfo {
            pending: state.queue.len() as u8,
            active: state.active.as_ref().map(|a| a.task),
        })
    }

    pub async fn statistics(&self, id: u8) -> Result<ChannelTotals> {
        if id as usize >= CHANNEL_COUNT {
            return Err(Error::InvalidParam("channel index out of range"));
        }
        let state = self.lock_state().await?;
        Ok(state.channels[id as usize].runtime.totals)
    }

    pub async fn channel_runtime(&self, id: u8) -> Result<crate::channel::ChannelRuntime> {
        if id as usize >= CHANNEL_COUNT {
            return Err(Error::InvalidParam("channel index out of range"));
        }
        let state = self.lock_state().await?;
        Ok(state.channels[id as usize].runtime.clone())
    }

    /// Flow-meter handle, for wiring the pulse ISR and for calibration.
    pub fn flow_meter(&self) -> &FlowMeter {
        &self.flow
    }

    /// Rain-gauge handle, for wiring the tip ISR.
    pub fn rain_gauge(&self) -> &RainGauge {
        &self.rain
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            uptime_min: (self.booted_at.elapsed().as_secs() / 60) as u32,
            error_count: self.error_count.load(Ordering::Relaxed),
            last_error: self.last_error.load(Ordering::Relaxed),
            valve_bitmap: 0, // filled by the async wrapper below
            battery: 0xFF,
        }
    }

    pub async fn diagnostics_full(&self) -> Result<Diagnostics> {
        let mut d = self.diagnostics();
        let state = self.lock_state().await?;
        d.valve_bitmap = state.bank.bitmap();
        Ok(d)
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }
}

/// TaskQueue record payload source.
#[derive(Debug, Clone, Copy)]
pub struct QueueInfo {
    pub pending: u8,
    pub active: Option<Task>,
}

/// Diagnostics record payload source.  Battery is 0xFF on mains power.
#[derive(Debug, Clone, Copy)]
pub struct Diagnostics {
    pub uptime_min: u32,
    pub error_count: u16,
    pub last_error: u8,
    pub valve_bitmap: u8,
    pub battery: u8,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_core;

    #[tokio::test(start_paused = true)]
    async fn add_task_requires_boot() {
        let core = test_core().await;
        // test_core boots; build an unbooted one by hand.
        let raw = crate::testutil::unbooted_core().await;
        let err = raw
            .add_task(0, Trigger::Manual, WaterTarget::Duration { minutes: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized));

        core.add_task(0, Trigger::Manual, WaterTarget::Duration { minutes: 1 })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn add_task_validates_channel() {
        let core = test_core().await;
        let err = core
            .add_task(9, Trigger::Manual, WaterTarget::Duration { minutes: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidParam(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn add_task_during_freeze_records_skip_and_busy() {
        let core = test_core().await;
        {
            let mut state = core.state.lock().await;
            state.freeze.locked = true;
        }
        let err = core
            .add_task(2, Trigger::Manual, WaterTarget::Duration { minutes: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)));

        let state = core.state.lock().await;
        assert_eq!(
            state.channels[2].runtime.last_skip,
            Some(SkipReason::Freeze)
        );
        assert_eq!(state.queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn add_task_never_mutates_channel_config() {
        let core = test_core().await;
        let before = core.channel_config(1).await.unwrap();

        // Successful enqueue with a target different from the configured one.
        core.add_task(1, Trigger::RainAdjusted, WaterTarget::Volume { litres: 3 })
            .await
            .unwrap();
        assert_eq!(core.channel_config(1).await.unwrap(), before);

        // Failing enqueues leave it untouched too.
        for _ in 0..20 {
            let _ = core
                .add_task(1, Trigger::Manual, WaterTarget::Duration { minutes: 1 })
                .await;
        }
        assert_eq!(core.channel_config(1).await.unwrap(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn queue_full_surfaces_and_records_skip() {
        let core = test_core().await;
        for _ in 0..10 {
            core.add_task(0, Trigger::Manual, WaterTarget::Duration { minutes: 1 })
                .await
                .unwrap();
        }
        let err = core
            .add_task(0, Trigger::Manual, WaterTarget::Duration { minutes: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull));
        let state = core.state.lock().await;
        assert_eq!(
            state.channels[0].runtime.last_skip,
            Some(SkipReason::QueueFull)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn clear_queue_reports_count() {
        let core = test_core().await;
        for _ in 0..3 {
            core.add_task(0, Trigger::Manual, WaterTarget::Duration { minutes: 1 })
                .await
                .unwrap();
        }
        assert_eq!(core.clear_queue().await.unwrap(), 3);
        assert_eq!(core.queue_info().await.unwrap().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_config_persists_and_reloads() {
        let core = test_core().await;
        let mut cfg = core.channel_config(4).await.unwrap();
        cfg.name = "Greenhouse".into();
        core.set_channel_config(4, cfg.clone()).await.unwrap();

        let stored: Option<ChannelConfig> =
            core.store.load(&keys::channel(4)).await.unwrap();
        assert_eq!(stored.unwrap().name, "Greenhouse");
    }

    #[tokio::test(start_paused = true)]
    async fn status_aggregation_severity_order() {
        let core = test_core().await;
        {
            let mut state = core.state.lock().await;
            state.freeze.locked = true;
            core.refresh_status(&mut state);
            assert_eq!(state.status, SystemStatus::FreezeLockout);

            state.monitor.latched = Some(FlowAnomaly::NoFlow);
            core.refresh_status(&mut state);
            assert_eq!(state.status, SystemStatus::NoFlow);

            state.monitor.faulted = true;
            core.refresh_status(&mut state);
            assert_eq!(state.status, SystemStatus::Fault);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_set_get_persist() {
        let core = test_core().await;
        core.set_calibration(500).unwrap();
        core.save_calibration().await.unwrap();
        assert_eq!(core.calibration(), 500);
        let stored: Option<u32> = core.store.load(keys::CALIBRATION).await.unwrap();
        assert_eq!(stored, Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn diagnostics_battery_is_na() {
        let core = test_core().await;
        let d = core.diagnostics_full().await.unwrap();
        assert_eq!(d.battery, 0xFF);
        assert_eq!(d.valve_bitmap, 0);
    }
}
