//! The task executor: lifecycle of the single active task.
//!
//! The executor owns the active task by value; the queue yields owned tasks
//! and nothing holds a reference into queue storage after the pop.  One tick
//! of [`Core::task_tick`] performs, in order: flow-anomaly check, interval
//! phase advance, completion check, and a dequeue when idle.  Stops are
//! synchronous and idempotent.

use std::sync::Arc;

use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::channel::IntervalConfig;
use crate::core::{CompletedTask, Core, CoreState};
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::flow::FlowMeter;
use crate::store::WateringEvent;
use crate::task::{AbortReason, Task, TaskResult, Trigger, WaterTarget};

/// Retries when a delayed-close sleeper finds the state lock contended.
const SLEEPER_LOCK_RETRIES: u32 = 5;

// ---------------------------------------------------------------------------
// Active task state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalPhase {
    None,
    Watering { since: Instant },
    Pausing { since: Instant },
}

pub struct ActiveTask {
    pub task: Task,
    pub started_at: Instant,
    pub started_unix: i64,
    pub paused: bool,
    pub pause_started: Option<Instant>,
    pub total_paused: Duration,
    pub phase: IntervalPhase,
    pub interval: Option<IntervalConfig>,
    pub cycles_completed: u16,
    /// Watering time banked from completed phases.
    pub watered: Duration,
    /// Pulses banked from earlier valve-open periods (the counter rebaselines
    /// whenever the last valve closes, so open periods must be folded in
    /// before each close).
    pub counted_pulses: u64,
    open_pulse_base: u32,
    valve_open: bool,
}

impl ActiveTask {
    fn new(task: Task, interval: Option<IntervalConfig>, now: Instant, now_unix: i64) -> Self {
        Self {
            task,
            started_at: now,
            started_unix: now_unix,
            paused: false,
            pause_started: None,
            total_paused: Duration::ZERO,
            phase: if interval.is_some() {
                IntervalPhase::Watering { since: now }
            } else {
                IntervalPhase::None
            },
            interval,
            cycles_completed: 0,
            watered: Duration::ZERO,
            counted_pulses: 0,
            open_pulse_base: 0,
            valve_open: true,
        }
    }

    /// Wall-clock elapsed minus time spent paused.
    pub fn effective_elapsed(&self, now: Instant) -> Duration {
        let gross = now.saturating_duration_since(self.started_at);
        let paused = self.total_paused
            + self
                .pause_started
                .map(|p| now.saturating_duration_since(p))
                .unwrap_or(Duration::ZERO);
        gross.saturating_sub(paused)
    }

    /// Total valve-open time for cycle-and-soak accounting.
    pub fn watering_time(&self, now: Instant) -> Duration {
        let current = match self.phase {
            IntervalPhase::Watering { since } => {
                let end = if self.paused {
                    self.pause_started.unwrap_or(now)
                } else {
                    now
                };
                end.saturating_duration_since(since)
            }
            _ => Duration::ZERO,
        };
        self.watered + current
    }

    /// Pulses attributable to this task: banked periods plus the current
    /// open period.
    pub fn task_pulses(&self, flow: &FlowMeter) -> u64 {
        let current = if self.valve_open {
            flow.pulses().saturating_sub(self.open_pulse_base) as u64
        } else {
            0
        };
        self.counted_pulses + current
    }

    /// Fold the current open period into the banked count.  Must run before
    /// any valve close, which rebaselines the counter.
    fn bank_pulses(&mut self, flow: &FlowMeter) {
        if self.valve_open {
            self.counted_pulses +=
                flow.pulses().saturating_sub(self.open_pulse_base) as u64;
            self.valve_open = false;
        }
    }

    fn mark_open(&mut self, flow: &FlowMeter) {
        self.open_pulse_base = flow.pulses();
        self.valve_open = true;
    }

    /// Seconds left in the current cycle-and-soak phase.
    pub fn phase_remaining(&self, now: Instant) -> Duration {
        let Some(interval) = self.interval else {
            return Duration::ZERO;
        };
        match self.phase {
            IntervalPhase::Watering { since } => {
                Duration::from_secs(interval.watering_s as u64)
                    .saturating_sub(now.saturating_duration_since(since))
            }
            IntervalPhase::Pausing { since } => {
                Duration::from_secs(interval.pause_s as u64)
                    .saturating_sub(now.saturating_duration_since(since))
            }
            IntervalPhase::None => Duration::ZERO,
        }
    }
}

enum Advance {
    None,
    Finished(TaskResult),
    MasterSleep(Instant, u64),
}

/// IntervalStatus record payload source.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalSnapshot {
    pub channel: u8,
    pub is_active: bool,
    pub watering: bool,
    pub pausing: bool,
    pub phase_remaining_s: u32,
    pub cycles_completed: u16,
    pub progress_pct: u8,
    pub cycles_remaining: u8,
    pub next_phase_in_s: u32,
    pub estimated_completion_s: u32,
}

// ---------------------------------------------------------------------------
// Executor operations
// ---------------------------------------------------------------------------

impl Core {
    /// Start a task immediately.  Preconditions: no active task, valid
    /// channel, freeze lockout inactive.  On any failure the state is rolled
    /// back; a partially-started task is never visible.
    pub async fn start_task(self: &Arc<Self>, task: Task) -> Result<()> {
        let mut state = self.lock_state().await?;

        task.validate()?;
        if state.active.is_some() {
            return Err(Error::Busy("a task is already active"));
        }
        if state.freeze.locked {
            return Err(Error::Busy("freeze lockout"));
        }

        let ch = task.channel;
        let cfg = &state.channels[ch as usize].config;
        let interval = if cfg.interval_active() {
            Some(cfg.interval)
        } else {
            None
        };

        // Master lead: open first and wait, or follow the zone by |delay|.
        let managed = state.master.cfg.managed();
        let pre = state.master.cfg.pre_start_delay_s;
        if managed && pre >= 0 {
            state.master.open_now()?;
            if pre > 0 {
                tokio::time::sleep(Duration::from_secs(pre as u64)).await;
            }
        }

        if let Err(e) = state.bank.channel_on(ch) {
            if managed && pre >= 0 && state.bank.active().is_none() {
                let _ = state.master.close_now();
            }
            return Err(e);
        }

        if managed && pre < 0 {
            tokio::time::sleep(Duration::from_secs((-pre) as u64)).await;
            if let Err(e) = state.master.open_now() {
                warn!("master open after zone failed: {e}");
            }
        }

        // Fresh pulse baseline for this task.
        self.flow.reset();

        let now = Instant::now();
        let now_unix = self.clock.now_unix();
        state.active = Some(ActiveTask::new(task, interval, now, now_unix));
        state.master.clear_upcoming();

        let rt = &mut state.channels[ch as usize].runtime;
        rt.is_active = true;
        rt.last_watering_unix = rt.last_watering_unix.max(now_unix);

        let start_event = WateringEvent {
            ts_start: now_unix,
            ts_end: now_unix,
            channel: ch,
            trigger: trigger_str(task.trigger).to_string(),
            result: "start".to_string(),
            effective_secs: 0,
            delivered_ml: 0,
        };
        if let Err(e) = self.store.append_watering_event(&start_event).await {
            warn!(channel = ch, "history start event failed: {e:#}");
        }

        info!(channel = ch, trigger = ?task.trigger, target = ?task.target, "task started");
        self.bus.emit(CoreEvent::TaskStarted { task });
        self.persist_channel_runtime(&state, ch as usize).await;
        Ok(())
    }

    /// Abort the active task.  Returns `Ok(false)` when the executor is
    /// idle; calling stop twice is not an error.
    pub async fn stop_current_task(self: &Arc<Self>, reason: AbortReason) -> Result<bool> {
        self.finish_active(TaskResult::Aborted(reason)).await
    }

    /// Pause the active task: the zone valve closes, timers freeze.
    /// Idempotent; pausing twice equals pausing once.
    pub async fn pause(self: &Arc<Self>) -> Result<bool> {
        let mut state = self.lock_state().await?;
        let ch = {
            let Some(active) = state.active.as_mut() else {
                return Ok(false);
            };
            if active.paused {
                return Ok(false);
            }
            active.paused = true;
            active.pause_started = Some(Instant::now());
            active.bank_pulses(&self.flow);
            active.task.channel
        };
        state.bank.channel_off(ch)?;
        let sleeper = state.master.on_zone_closed(Instant::now());
        info!(channel = ch, "task paused");
        drop(state);
        if let Some((deadline, epoch)) = sleeper {
            self.spawn_master_close(deadline, epoch);
        }
        Ok(true)
    }

    /// Resume a paused task: the valve re-opens (unless the cycle is in a
    /// soak phase) and paused time is excluded from effective elapsed.
    pub async fn resume(self: &Arc<Self>) -> Result<bool> {
        let mut state = self.lock_state().await?;
        let (ch, reopen) = {
            let Some(active) = state.active.as_mut() else {
                return Ok(false);
            };
            if !active.paused {
                return Ok(false);
            }
            let now = Instant::now();
            let pause_len = active
                .pause_started
                .take()
                .map(|p| now.saturating_duration_since(p))
                .unwrap_or(Duration::ZERO);
            active.total_paused += pause_len;
            active.paused = false;
            // Shift phase references so the pause is invisible to the cycle.
            match &mut active.phase {
                IntervalPhase::Watering { since } | IntervalPhase::Pausing { since } => {
                    *since += pause_len;
                }
                IntervalPhase::None => {}
            }
            let reopen = !matches!(active.phase, IntervalPhase::Pausing { .. });
            (active.task.channel, reopen)
        };

        if reopen {
            if state.master.cfg.managed() {
                let _ = state.master.open_now();
            }
            state.bank.channel_on(ch)?;
            if let Some(active) = state.active.as_mut() {
                active.mark_open(&self.flow);
            }
        }
        info!(channel = ch, "task resumed");
        Ok(true)
    }

    /// Announce the start time of an upcoming task so the master valve can
    /// hold open across the gap.
    pub async fn notify_upcoming(&self, start_in: Duration) -> Result<()> {
        let mut state = self.lock_state().await?;
        state.master.notify_upcoming(Instant::now() + start_in);
        Ok(())
    }

    pub async fn clear_upcoming(&self) -> Result<()> {
        let mut state = self.lock_state().await?;
        state.master.clear_upcoming();
        Ok(())
    }

    // ----------------------------
    // Tick
    // ----------------------------

    /// One executor tick: (a) flow anomaly check, (b) interval phase
    /// advance, (c) completion check, (d) dequeue when idle.
    pub async fn task_tick(self: &Arc<Self>) {
        // (a) Monitor decides under the lock; the stop happens after it is
        // released.
        let verdict = match self.lock_state().await {
            Ok(mut state) => self.monitor_tick(&mut state, Instant::now()),
            Err(_) => return,
        };
        if let Some(reason) = verdict {
            let _ = self.finish_active(TaskResult::Aborted(reason)).await;
        }

        // (b) + (c)
        let advance = match self.lock_state().await {
            Ok(mut state) => self.advance_active(&mut state),
            Err(_) => return,
        };
        match advance {
            Advance::Finished(result) => {
                let _ = self.finish_active(result).await;
            }
            Advance::MasterSleep(deadline, epoch) => {
                self.spawn_master_close(deadline, epoch);
            }
            Advance::None => {}
        }

        // (d) Reporting-cycle bookkeeping + dequeue.
        let next = match self.lock_state().await {
            Ok(mut state) => {
                if let Some(lc) = state.last_completed.as_mut() {
                    if lc.reported {
                        state.last_completed = None;
                    } else {
                        lc.reported = true;
                    }
                }
                if state.active.is_none()
                    && !state.monitor.faulted
                    && !state.freeze.locked
                    && !state.wipe.in_progress()
                {
                    state.queue.try_pop()
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        if let Some(task) = next {
            if let Err(e) = self.start_task(task).await {
                warn!(channel = task.channel, "start from queue failed: {e}");
                if matches!(e, Error::Busy(_)) {
                    // Transient (lockout raced in); keep FIFO order.
                    if let Ok(mut state) = self.lock_state().await {
                        state.queue.requeue_front(task);
                    }
                }
            }
        }
    }

    fn advance_active(&self, state: &mut CoreState) -> Advance {
        let now = Instant::now();
        let Some(active) = state.active.as_ref() else {
            return Advance::None;
        };
        if active.paused {
            return Advance::None;
        }

        self.bus.emit(CoreEvent::FlowPulses {
            pulses: self.flow.pulses(),
        });

        if let Some(result) = self.completion(active, now) {
            return Advance::Finished(result);
        }

        let Some(interval) = active.interval else {
            return Advance::None;
        };

        match active.phase {
            IntervalPhase::Watering { since }
                if now.saturating_duration_since(since)
                    >= Duration::from_secs(interval.watering_s as u64) =>
            {
                // Watering phase done: close the valve, soak.
                let ch = {
                    let a = state.active.as_mut().expect("checked above");
                    a.bank_pulses(&self.flow);
                    a.watered += now.saturating_duration_since(since);
                    a.cycles_completed += 1;
                    a.phase = IntervalPhase::Pausing { since: now };
                    a.task.channel
                };
                if let Err(e) = state.bank.channel_off(ch) {
                    warn!(channel = ch, "cycle pause close failed: {e}");
                }
                info!(channel = ch, "cycle watering done, soaking");
                // The soak end is a known upcoming start; let the master
                // controller decide whether to hold open across it.
                state
                    .master
                    .notify_upcoming(now + Duration::from_secs(interval.pause_s as u64));
                if let Some((deadline, epoch)) = state.master.on_zone_closed(now) {
                    return Advance::MasterSleep(deadline, epoch);
                }
            }
            IntervalPhase::Pausing { since }
                if now.saturating_duration_since(since)
                    >= Duration::from_secs(interval.pause_s as u64) =>
            {
                // Soak done: next watering cycle.
                let ch = state.active.as_ref().expect("checked above").task.channel;
                if state.master.cfg.managed() {
                    if let Err(e) = state.master.open_now() {
                        warn!("master reopen for cycle failed: {e}");
                    }
                }
                if let Err(e) = state.bank.channel_on(ch) {
                    warn!(channel = ch, "cycle reopen failed: {e}");
                    return Advance::Finished(TaskResult::Aborted(AbortReason::Fault));
                }
                let a = state.active.as_mut().expect("checked above");
                a.phase = IntervalPhase::Watering { since: now };
                a.mark_open(&self.flow);
                info!(channel = ch, "cycle soak done, watering");
            }
            _ => {}
        }
        Advance::None
    }

    fn completion(&self, active: &ActiveTask, now: Instant) -> Option<TaskResult> {
        let done = match (active.interval.is_some(), active.task.target) {
            (false, WaterTarget::Duration { minutes }) => {
                active.effective_elapsed(now) >= Duration::from_secs(minutes as u64 * 60)
            }
            (true, WaterTarget::Duration { minutes }) => {
                active.watering_time(now) >= Duration::from_secs(minutes as u64 * 60)
            }
            (_, WaterTarget::Volume { litres }) => {
                active.task_pulses(&self.flow) >= self.flow.ml_to_pulses(litres as u64 * 1000)
            }
        };
        done.then_some(TaskResult::Completed)
    }

    /// Common tail of every task ending: close the valve, account, record
    /// history, publish, reset the slot.  `Ok(false)` when nothing was
    /// active.
    async fn finish_active(self: &Arc<Self>, result: TaskResult) -> Result<bool> {
        let mut state = self.lock_state().await?;
        let Some(mut active) = state.active.take() else {
            return Ok(false);
        };
        let now = Instant::now();
        let now_unix = self.clock.now_unix();
        let ch = active.task.channel;

        // Fold the open period before the close rebaselines the counter.
        active.bank_pulses(&self.flow);
        if let Err(e) = state.bank.channel_off(ch) {
            warn!(channel = ch, "valve close on finish failed: {e}");
        }

        // A queued follow-up counts as "upcoming now" for the hold-open
        // decision; it will start within one task tick.  Otherwise drop any
        // stale announcement (e.g. a soak end from the finished cycle).
        if !state.queue.is_empty() {
            state.master.notify_upcoming(now);
        } else {
            state.master.clear_upcoming();
        }
        let sleeper = state.master.on_zone_closed(now);

        let effective = if active.interval.is_some() {
            active.watering_time(now)
        } else {
            active.effective_elapsed(now)
        };
        let delivered_ml = self
            .flow
            .volume_ml(active.counted_pulses.min(u32::MAX as u64) as u32);

        let rt = &mut state.channels[ch as usize].runtime;
        rt.is_active = false;
        rt.totals.runs += 1;
        rt.totals.open_secs += effective.as_secs();
        rt.totals.millilitres += delivered_ml;

        state.last_completed = Some(CompletedTask {
            task: active.task,
            result,
            effective_secs: effective.as_secs(),
            delivered_ml,
            ended_unix: now_unix,
            reported: false,
        });

        // History first, then the wireless notification.
        let event = WateringEvent {
            ts_start: active.started_unix,
            ts_end: now_unix,
            channel: ch,
            trigger: trigger_str(active.task.trigger).to_string(),
            result: result_str(result),
            effective_secs: effective.as_secs() as i64,
            delivered_ml: delivered_ml as i64,
        };
        if let Err(e) = self.store.append_watering_event(&event).await {
            warn!(channel = ch, "history event failed: {e:#}");
        }

        info!(
            channel = ch,
            ?result,
            effective_secs = effective.as_secs(),
            delivered_ml,
            "task finished"
        );
        self.bus.emit(CoreEvent::TaskCompleted {
            task: active.task,
            result,
            effective_secs: effective.as_secs(),
            delivered_ml,
        });

        self.persist_channel_runtime(&state, ch as usize).await;
        self.refresh_status(&mut state);
        drop(state);

        if let Some((deadline, epoch)) = sleeper {
            self.spawn_master_close(deadline, epoch);
        }
        Ok(true)
    }

    /// Cycle-and-soak view of a channel, for the IntervalStatus record.
    pub async fn interval_status(&self, id: u8) -> Result<IntervalSnapshot> {
        if id as usize >= crate::channel::CHANNEL_COUNT {
            return Err(Error::InvalidParam("channel index out of range"));
        }
        let state = self.lock_state().await?;
        let mut snap = IntervalSnapshot {
            channel: id,
            ..IntervalSnapshot::default()
        };

        let Some(active) = state.active.as_ref() else {
            return Ok(snap);
        };
        if active.task.channel != id {
            return Ok(snap);
        }
        let Some(interval) = active.interval else {
            return Ok(snap);
        };

        let now = Instant::now();
        snap.is_active = true;
        snap.watering = matches!(active.phase, IntervalPhase::Watering { .. }) && !active.paused;
        snap.pausing = matches!(active.phase, IntervalPhase::Pausing { .. });
        snap.phase_remaining_s = active.phase_remaining(now).as_secs() as u32;
        snap.cycles_completed = active.cycles_completed;

        // Progress against the total target, in the target's own units.
        let (done, total) = match active.task.target {
            WaterTarget::Duration { minutes } => (
                active.watering_time(now).as_secs(),
                minutes as u64 * 60,
            ),
            WaterTarget::Volume { litres } => (
                active.task_pulses(&self.flow),
                self.flow.ml_to_pulses(litres as u64 * 1000),
            ),
        };
        snap.progress_pct = if total == 0 {
            0
        } else {
            (done.min(total) * 100 / total) as u8
        };

        // Remaining watering time, estimated through the cycle pattern.
        let remaining_units = total.saturating_sub(done);
        let remaining_watering_s = match active.task.target {
            WaterTarget::Duration { .. } => remaining_units,
            WaterTarget::Volume { .. } => {
                // Assume the rate observed so far carries on.
                let elapsed_watering = active.watering_time(now).as_secs().max(1);
                if done == 0 {
                    remaining_units // unknown rate, report pulses as a bound
                } else {
                    remaining_units * elapsed_watering / done
                }
            }
        };
        let w = interval.watering_s.max(1) as u64;
        snap.cycles_remaining = remaining_watering_s.div_ceil(w).min(255) as u8;
        snap.next_phase_in_s = snap.phase_remaining_s;
        snap.estimated_completion_s = (remaining_watering_s
            + snap.cycles_remaining.saturating_sub(1) as u64 * interval.pause_s as u64)
            .min(u32::MAX as u64) as u32;

        Ok(snap)
    }

    /// Delayed-work sleeper enforcing a master close deadline.  A bumped
    /// epoch (new task, new notify) makes it a no-op.
    pub(crate) fn spawn_master_close(self: &Arc<Self>, deadline: Instant, epoch: u64) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            for _ in 0..SLEEPER_LOCK_RETRIES {
                match core.lock_state().await {
                    Ok(mut state) => {
                        state.master.fire_delayed_close(epoch);
                        return;
                    }
                    Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
                }
            }
            warn!("master close sleeper gave up on contended state lock");
        });
    }
}

// ---------------------------------------------------------------------------
// Task loop
// ---------------------------------------------------------------------------

/// Drive the executor until shutdown.  Intended to be `tokio::spawn`-ed.
pub async fn run_task_loop(core: Arc<Core>) {
    info!("task loop started");
    loop {
        if core.shutting_down() {
            break;
        }
        core.task_tick().await;
        let period = match core.lock_state().await {
            Ok(state) => state.settings.power_mode.task_period(),
            Err(_) => crate::config::PowerMode::Normal.task_period(),
        };
        tokio::time::sleep(period).await;
    }
    info!("task loop stopped");
}

fn trigger_str(t: Trigger) -> &'static str {
    match t {
        Trigger::Manual => "manual",
        Trigger::Scheduled => "scheduled",
        Trigger::RainAdjusted => "rain_adjusted",
        Trigger::AutoDeficit => "auto",
    }
}

fn result_str(r: TaskResult) -> String {
    match r {
        TaskResult::Completed => "complete".to_string(),
        TaskResult::Aborted(reason) => {
            let name = match reason {
                AbortReason::Manual => "manual",
                AbortReason::NoFlow => "no_flow",
                AbortReason::Stall => "stall",
                AbortReason::Fault => "fault",
                AbortReason::Shutdown => "shutdown",
            };
            format!("abort:{name}")
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
