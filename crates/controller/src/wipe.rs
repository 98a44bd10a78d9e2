//! Persistent factory-wipe state machine.
//!
//! A wipe is a cross-reboot protocol, not a script: every step persists its
//! completion before the next one runs, so a crash mid-wipe resumes at the
//! first unfinished step on the next boot.  Execution is gated behind a
//! 32-bit confirmation code with a 300-second validity window.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::channel::{ChannelRuntime, ChannelState, CHANNEL_COUNT};
use crate::config::SystemSettings;
use crate::core::Core;
use crate::error::{Error, Result};
use crate::events::{AlarmCode, CoreEvent};
use crate::flow::DEFAULT_PULSES_PER_LITRE;
use crate::store::keys;

/// Steps 0..=8; see [`WipeStep`].
pub const WIPE_STEP_COUNT: u8 = 9;

pub const WIPE_MAX_STEP_RETRIES: u8 = 3;

/// Whole-operation budget.
pub const WIPE_TIMEOUT: Duration = Duration::from_secs(30);

/// Confirmation code validity window.
pub const CODE_VALIDITY: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WipeState {
    Idle,
    AwaitConfirm,
    InProgress,
    DoneOk,
    DoneError,
}

impl WipeState {
    pub fn wire(&self) -> u8 {
        match self {
            WipeState::Idle => 0,
            WipeState::AwaitConfirm => 1,
            WipeState::InProgress => 2,
            WipeState::DoneOk => 3,
            WipeState::DoneError => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WipeStep {
    Prepare = 0,
    ResetChannels = 1,
    ResetSystem = 2,
    ResetCalibration = 3,
    ClearRainHistory = 4,
    ClearEnvHistory = 5,
    ClearOnboarding = 6,
    Verify = 7,
    Done = 8,
}

impl WipeStep {
    fn from_index(i: u8) -> Option<Self> {
        match i {
            0 => Some(Self::Prepare),
            1 => Some(Self::ResetChannels),
            2 => Some(Self::ResetSystem),
            3 => Some(Self::ResetCalibration),
            4 => Some(Self::ClearRainHistory),
            5 => Some(Self::ClearEnvHistory),
            6 => Some(Self::ClearOnboarding),
            7 => Some(Self::Verify),
            8 => Some(Self::Done),
            _ => None,
        }
    }
}

/// Persisted progress record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipeProgress {
    pub state: WipeState,
    pub current_step: u8,
    pub attempts: u8,
    /// Step index that failed, 0 when none.
    pub last_error: u8,
    pub started_uptime_ms: u64,
}

impl Default for WipeProgress {
    fn default() -> Self {
        Self {
            state: WipeState::Idle,
            current_step: 0,
            attempts: 0,
            last_error: 0,
            started_uptime_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetType {
    Factory,
    Channel,
}

impl ResetType {
    pub fn from_wire(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Factory),
            1 => Some(Self::Channel),
            _ => None,
        }
    }

    pub fn wire(&self) -> u8 {
        match self {
            Self::Factory => 0,
            Self::Channel => 1,
        }
    }
}

/// In-RAM confirmation code; never persisted.
pub struct ConfirmationCode {
    pub code: u32,
    pub reset_type: ResetType,
    pub channel_id: u8,
    pub generated: Instant,
    pub valid: bool,
}

impl ConfirmationCode {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.generated) > CODE_VALIDITY
    }
}

enum WipeFailure {
    /// A step exhausted its retries.
    Step(u8),
    /// The whole-operation budget ran out before this step.
    Timeout(u8),
}

#[derive(Default)]
pub struct WipeControl {
    pub progress: WipeProgress,
    pub code: Option<ConfirmationCode>,
}

impl WipeControl {
    pub fn in_progress(&self) -> bool {
        self.progress.state == WipeState::InProgress
    }
}

/// Step-indexed percentage: 0, 11, 22 … 88, then 100 on completion.
pub fn wipe_percent(state: WipeState, step: u8) -> u8 {
    match state {
        WipeState::Idle | WipeState::AwaitConfirm => 0,
        WipeState::DoneOk => 100,
        _ => (step.min(WIPE_STEP_COUNT) as u32 * 100 / WIPE_STEP_COUNT as u32) as u8,
    }
}

// ---------------------------------------------------------------------------
// Core operations
// ---------------------------------------------------------------------------

impl Core {
    /// First half of the confirmation flow: generate a code for the given
    /// reset type.  The client must write it back within the validity
    /// window to execute.
    pub async fn request_reset(&self, reset_type: ResetType, channel_id: u8) -> Result<u32> {
        if reset_type == ResetType::Channel && channel_id as usize >= CHANNEL_COUNT {
            return Err(Error::InvalidParam("channel index out of range"));
        }
        let mut state = self.lock_state().await?;
        if state.wipe.in_progress() {
            return Err(Error::Busy("wipe already running"));
        }

        let code = fastrand::u32(1..);
        state.wipe.code = Some(ConfirmationCode {
            code,
            reset_type,
            channel_id,
            generated: Instant::now(),
            valid: true,
        });
        if reset_type == ResetType::Factory {
            state.wipe.progress = WipeProgress {
                state: WipeState::AwaitConfirm,
                ..WipeProgress::default()
            };
            self.store
                .save(keys::WIPE_PROGRESS, &state.wipe.progress)
                .await?;
            self.emit_wipe_progress(&state.wipe.progress);
        }
        info!(?reset_type, channel_id, "reset confirmation code issued");
        Ok(code)
    }

    /// Second half: execute the reset the code was issued for.
    pub async fn confirm_reset(self: &Arc<Self>, code: u32) -> Result<()> {
        let reset = {
            let mut state = self.lock_state().await?;
            let now = Instant::now();
            let Some(pending) = state.wipe.code.take() else {
                return Err(Error::InvalidParam("no reset pending"));
            };
            if !pending.valid || pending.code != code || pending.expired(now) {
                warn!("reset confirmation rejected");
                return Err(Error::InvalidParam("confirmation code invalid or expired"));
            }
            pending
        };

        match reset.reset_type {
            ResetType::Channel => self.reset_channel(reset.channel_id).await,
            ResetType::Factory => {
                {
                    let mut state = self.lock_state().await?;
                    state.wipe.progress = WipeProgress {
                        state: WipeState::InProgress,
                        started_uptime_ms: self.booted_at.elapsed().as_millis() as u64,
                        ..WipeProgress::default()
                    };
                    self.store
                        .save(keys::WIPE_PROGRESS, &state.wipe.progress)
                        .await?;
                    self.emit_wipe_progress(&state.wipe.progress);
                    self.refresh_status(&mut state);
                }
                // No actuation during a wipe.
                let _ = self
                    .stop_current_task(crate::task::AbortReason::Shutdown)
                    .await;
                let _ = self.clear_queue().await;
                self.run_wipe().await
            }
        }
    }

    /// Resume a wipe interrupted by a reboot.
    pub async fn resume_wipe_if_pending(self: &Arc<Self>) -> Result<()> {
        let pending = {
            let state = self.lock_state().await?;
            state.wipe.in_progress()
        };
        if pending {
            let step = self.lock_state().await?.wipe.progress.current_step;
            info!(step, "resuming interrupted factory wipe");
            self.run_wipe().await?;
        }
        Ok(())
    }

    /// App acknowledgement of a finished (or failed) wipe.
    pub async fn clear_wipe_state(&self) -> Result<()> {
        let mut state = self.lock_state().await?;
        if state.wipe.in_progress() {
            return Err(Error::Busy("wipe still running"));
        }
        state.wipe.progress = WipeProgress::default();
        state.wipe.code = None;
        self.store
            .save(keys::WIPE_PROGRESS, &state.wipe.progress)
            .await?;
        self.emit_wipe_progress(&state.wipe.progress);
        self.refresh_status(&mut state);
        Ok(())
    }

    pub async fn wipe_progress(&self) -> Result<WipeProgress> {
        Ok(self.lock_state().await?.wipe.progress)
    }

    /// Single-channel reset: factory config, cleared runtime and stats.
    async fn reset_channel(&self, id: u8) -> Result<()> {
        let mut state = self.lock_state().await?;
        let idx = id as usize;
        state.channels[idx] = ChannelState::factory_default(idx);
        self.store
            .save(&keys::channel(idx), &state.channels[idx].config)
            .await?;
        self.store
            .save(&keys::channel_runtime(idx), &state.channels[idx].runtime)
            .await?;
        info!(channel = id, "channel reset to factory defaults");
        Ok(())
    }

    // ----------------------------
    // The step machine
    // ----------------------------

    async fn run_wipe(self: &Arc<Self>) -> Result<()> {
        match self.run_wipe_steps().await {
            Ok(()) => Ok(()),
            Err(WipeFailure::Step(step)) => {
                self.finish_wipe_error(step).await;
                Err(Error::Config(format!("wipe failed at step {step}")))
            }
            Err(WipeFailure::Timeout(step)) => {
                error!(step, "factory wipe exceeded its time budget");
                self.finish_wipe_error(step).await;
                Err(Error::Timeout)
            }
        }
    }

    /// Execute the steps from the persisted position.  The overall budget
    /// is enforced at step boundaries.
    async fn run_wipe_steps(self: &Arc<Self>) -> std::result::Result<(), WipeFailure> {
        let started = Instant::now();
        let first = {
            let state = self.lock_state().await.map_err(|_| WipeFailure::Step(0))?;
            state.wipe.progress.current_step
        };

        for index in first..WIPE_STEP_COUNT {
            if started.elapsed() > WIPE_TIMEOUT {
                return Err(WipeFailure::Timeout(index));
            }
            let step = WipeStep::from_index(index).ok_or(WipeFailure::Step(index))?;
            let mut done = false;
            for attempt in 1..=WIPE_MAX_STEP_RETRIES {
                match self.execute_wipe_step(step).await {
                    Ok(()) => {
                        done = true;
                        break;
                    }
                    Err(e) => {
                        warn!(step = index, attempt, "wipe step failed: {e}");
                        if let Ok(mut state) = self.lock_state().await {
                            state.wipe.progress.attempts = attempt;
                        }
                    }
                }
            }
            if !done {
                return Err(WipeFailure::Step(index));
            }

            // Persist completion before moving on; this is what a reboot
            // resumes from.
            let mut state = self
                .lock_state()
                .await
                .map_err(|_| WipeFailure::Step(index))?;
            if step == WipeStep::Done {
                state.wipe.progress = WipeProgress {
                    state: WipeState::DoneOk,
                    current_step: index,
                    ..WipeProgress::default()
                };
            } else {
                state.wipe.progress.current_step = index + 1;
                state.wipe.progress.attempts = 0;
            }
            self.store
                .save(keys::WIPE_PROGRESS, &state.wipe.progress)
                .await
                .map_err(|_| WipeFailure::Step(index))?;
            self.emit_wipe_progress(&state.wipe.progress);
            if step == WipeStep::Done {
                state.wipe.code = None;
                self.raise_alarm(AlarmCode::WipeDone, 0);
                self.refresh_status(&mut state);
                info!("factory wipe complete");
            }
        }
        Ok(())
    }

    async fn execute_wipe_step(self: &Arc<Self>, step: WipeStep) -> Result<()> {
        match step {
            WipeStep::Prepare => Ok(()), // the InProgress persist was step 0

            WipeStep::ResetChannels => {
                let mut state = self.lock_state().await?;
                for i in 0..CHANNEL_COUNT {
                    state.channels[i] = ChannelState::factory_default(i);
                    self.store
                        .save(&keys::channel(i), &state.channels[i].config)
                        .await?;
                    self.store
                        .save(&keys::channel_runtime(i), &ChannelRuntime::default())
                        .await?;
                }
                Ok(())
            }

            WipeStep::ResetSystem => {
                let mut state = self.lock_state().await?;
                let defaults = SystemSettings::default();
                self.store.save(keys::SYSTEM, &defaults).await?;
                state.settings = defaults;
                state.master.cfg = defaults.master;
                self.store.save(keys::DAYS_SINCE_START, &0u32).await?;
                self.clock.set_days_since_start(0);
                Ok(())
            }

            WipeStep::ResetCalibration => {
                self.flow.set_calibration(DEFAULT_PULSES_PER_LITRE)?;
                self.store
                    .save(keys::CALIBRATION, &DEFAULT_PULSES_PER_LITRE)
                    .await?;
                Ok(())
            }

            WipeStep::ClearRainHistory => {
                self.store.delete(keys::RAIN_HISTORY).await?;
                self.rain.clear();
                Ok(())
            }

            WipeStep::ClearEnvHistory => {
                self.store.delete(keys::ENV_HISTORY).await?;
                self.store.clear_watering_events().await?;
                Ok(())
            }

            WipeStep::ClearOnboarding => {
                self.store.delete(keys::ONBOARDING).await?;
                Ok(())
            }

            WipeStep::Verify => {
                // Every erased region must actually read erased.
                for key in [keys::RAIN_HISTORY, keys::ENV_HISTORY, keys::ONBOARDING] {
                    if self.store.exists(key).await? {
                        return Err(Error::Config(format!("verify: '{key}' still present")));
                    }
                }
                let ppl: Option<u32> = self.store.load(keys::CALIBRATION).await?;
                if ppl != Some(DEFAULT_PULSES_PER_LITRE) {
                    return Err(Error::Config("verify: calibration not default".into()));
                }
                Ok(())
            }

            WipeStep::Done => Ok(()),
        }
    }

    async fn finish_wipe_error(self: &Arc<Self>, failed_step: u8) {
        if let Ok(mut state) = self.lock_state().await {
            state.wipe.progress = WipeProgress {
                state: WipeState::DoneError,
                current_step: failed_step,
                last_error: failed_step,
                ..WipeProgress::default()
            };
            state.wipe.code = None;
            if let Err(e) = self
                .store
                .save(keys::WIPE_PROGRESS, &state.wipe.progress)
                .await
            {
                error!("persisting wipe failure state failed: {e:#}");
            }
            self.emit_wipe_progress(&state.wipe.progress);
            self.refresh_status(&mut state);
        }
    }

    fn emit_wipe_progress(&self, progress: &WipeProgress) {
        self.bus.emit(CoreEvent::WipeProgress {
            state: progress.state,
            step: progress.current_step,
            percent: wipe_percent(progress.state, progress.current_step),
            last_error: progress.last_error,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
