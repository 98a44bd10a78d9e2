//! Flow monitor: periodic anomaly checks run from the task loop.
//!
//! - **No-flow**: an open valve that produces no pulses across consecutive
//!   check windows strikes out into `Fault` and stops the task.
//! - **Unexpected flow**: pulses past the all-closed baseline mean a leak.
//! - **Stall**: a volume task that waters for too long is force-completed.
//!
//! The tick itself only *decides* under the state lock; the caller performs
//! the stop after releasing it, so stopping never deadlocks the lock.

use tokio::time::{Duration, Instant};
use tracing::warn;

use crate::core::{Core, CoreState};
use crate::error::FlowAnomaly;
use crate::events::AlarmCode;
use crate::executor::IntervalPhase;
use crate::task::{AbortReason, WaterTarget};

/// Pulse count must change within this window while watering.
pub const FLOW_CHECK_THRESHOLD_MS: u64 = 1000;

/// Consecutive silent windows before the fault latches.
pub const MAX_FLOW_ERROR_ATTEMPTS: u8 = 3;

/// Idle pulses past the baseline that count as a leak.
pub const UNEXPECTED_FLOW_THRESHOLD: u32 = 10;

/// Duration tasks get this long after start before no-flow arms; volume
/// tasks arm immediately.
pub const NO_FLOW_GRACE_MS: u64 = 5000;

/// Wall-clock (contiguous) or accumulated watering time (cycle-and-soak)
/// limit for volume tasks.
pub const VOLUME_STALL_LIMIT: Duration = Duration::from_secs(30 * 60);

#[derive(Default)]
pub struct MonitorState {
    /// Start of the current no-flow check window and the count it opened at.
    window: Option<(Instant, u32)>,
    pub noflow_strikes: u8,
    pub latched: Option<FlowAnomaly>,
    pub faulted: bool,
}

impl MonitorState {
    /// Reset counters and latches.  The caller re-evaluates status; a still-
    /// present condition will simply latch again on the next tick.
    pub fn clear(&mut self) {
        self.window = None;
        self.noflow_strikes = 0;
        self.latched = None;
        self.faulted = false;
    }
}

impl Core {
    /// One monitor pass.  Returns the abort the caller must perform against
    /// the active task, if any.  Never performs the stop itself.
    pub(crate) fn monitor_tick(&self, state: &mut CoreState, now: Instant) -> Option<AbortReason> {
        match &state.active {
            Some(active) => {
                // ── Stall: volume tasks only ─────────────────────────
                let watering_for = if active.interval.is_some() {
                    active.watering_time(now)
                } else {
                    active.effective_elapsed(now)
                };
                if matches!(active.task.target, WaterTarget::Volume { .. })
                    && watering_for >= VOLUME_STALL_LIMIT
                {
                    warn!(
                        channel = active.task.channel,
                        "volume task exceeded stall limit"
                    );
                    return Some(AbortReason::Stall);
                }

                // ── No-flow ──────────────────────────────────────────
                let watering = !active.paused
                    && !matches!(active.phase, IntervalPhase::Pausing { .. });
                let armed = match active.task.target {
                    WaterTarget::Volume { .. } => true,
                    WaterTarget::Duration { .. } => {
                        now - active.started_at >= Duration::from_millis(NO_FLOW_GRACE_MS)
                    }
                };

                if !watering || !armed {
                    // Suppressed while paused or soaking; restart the window
                    // so pause time never counts as silence.
                    state.monitor.window = None;
                    return None;
                }

                let pulses = self.flow.pulses();
                match state.monitor.window {
                    None => {
                        state.monitor.window = Some((now, pulses));
                    }
                    Some((opened, count)) => {
                        if pulses != count {
                            // Flow seen: healthy again.
                            state.monitor.window = Some((now, pulses));
                            state.monitor.noflow_strikes = 0;
                        } else if now - opened >= Duration::from_millis(FLOW_CHECK_THRESHOLD_MS) {
                            state.monitor.noflow_strikes += 1;
                            state.monitor.window = Some((now, pulses));
                            warn!(
                                channel = active.task.channel,
                                strikes = state.monitor.noflow_strikes,
                                "no flow while watering"
                            );
                            if state.monitor.noflow_strikes >= MAX_FLOW_ERROR_ATTEMPTS {
                                state.monitor.latched = Some(FlowAnomaly::NoFlow);
                                state.monitor.faulted = true;
                                self.raise_alarm(AlarmCode::NoFlow, active.task.channel as u16);
                                self.refresh_status(state);
                                return Some(AbortReason::NoFlow);
                            }
                        }
                    }
                }
                None
            }

            None => {
                // ── Unexpected flow while everything is closed ───────
                state.monitor.window = None;
                let pulses = self.flow.pulses();
                if pulses > UNEXPECTED_FLOW_THRESHOLD
                    && state.monitor.latched != Some(FlowAnomaly::UnexpectedFlow)
                {
                    warn!(pulses, "flow with all valves closed (leak?)");
                    state.monitor.latched = Some(FlowAnomaly::UnexpectedFlow);
                    self.raise_alarm(AlarmCode::UnexpectedFlow, pulses.min(u16::MAX as u32) as u16);
                    self.refresh_status(state);
                }
                None
            }
        }
    }

    /// Client-initiated error clear (TaskQueue command 4).  Clears latched
    /// flow anomalies and the fault latch; never touches freeze lockout or
    /// RTC degradation, which clear only with their causes.
    pub async fn clear_errors(&self) -> crate::error::Result<()> {
        let mut state = self.lock_state().await?;
        state.monitor.clear();
        // A cleared leak needs a fresh baseline or it would re-latch from
        // the stale count immediately.
        if state.active.is_none() {
            self.flow.reset();
        }
        self.refresh_status(&mut state);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SystemStatus;
    use crate::task::Trigger;
    use crate::testutil::test_core;

    #[tokio::test(start_paused = true)]
    async fn unexpected_flow_latches_once() {
        let core = test_core().await;
        core.flow.add_pulses(UNEXPECTED_FLOW_THRESHOLD + 5);

        {
            let mut state = core.state.lock().await;
            assert_eq!(core.monitor_tick(&mut state, Instant::now()), None);
            assert_eq!(state.monitor.latched, Some(FlowAnomaly::UnexpectedFlow));
            assert_eq!(state.status, SystemStatus::UnexpectedFlow);

            // Second tick does not re-alarm or change anything.
            core.monitor_tick(&mut state, Instant::now());
            assert_eq!(state.monitor.latched, Some(FlowAnomaly::UnexpectedFlow));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_flow_below_threshold_is_ignored() {
        let core = test_core().await;
        core.flow.add_pulses(UNEXPECTED_FLOW_THRESHOLD);
        let mut state = core.state.lock().await;
        core.monitor_tick(&mut state, Instant::now());
        assert_eq!(state.monitor.latched, None);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_errors_resets_latch_and_baseline() {
        let core = test_core().await;
        core.flow.add_pulses(50);
        {
            let mut state = core.state.lock().await;
            core.monitor_tick(&mut state, Instant::now());
            assert!(state.monitor.latched.is_some());
        }

        core.clear_errors().await.unwrap();

        let mut state = core.state.lock().await;
        assert_eq!(state.monitor.latched, None);
        assert_eq!(state.status, SystemStatus::Ok);
        // Baseline was rebased; no immediate re-latch.
        core.monitor_tick(&mut state, Instant::now());
        assert_eq!(state.monitor.latched, None);
    }

    #[tokio::test(start_paused = true)]
    async fn no_flow_strikes_out_volume_task() {
        let core = test_core().await;
        core.add_task(2, Trigger::Manual, WaterTarget::Volume { litres: 1 })
            .await
            .unwrap();
        core.task_tick().await; // dequeue + start

        // Three silent windows of 1 s each.
        let mut verdict = None;
        for _ in 0..=MAX_FLOW_ERROR_ATTEMPTS as u64 {
            tokio::time::advance(Duration::from_millis(FLOW_CHECK_THRESHOLD_MS)).await;
            let mut state = core.state.lock().await;
            verdict = core.monitor_tick(&mut state, Instant::now());
            if verdict.is_some() {
                break;
            }
        }
        assert_eq!(verdict, Some(AbortReason::NoFlow));

        let state = core.state.lock().await;
        assert!(state.monitor.faulted);
        assert_eq!(state.status, SystemStatus::Fault);
    }

    #[tokio::test(start_paused = true)]
    async fn flow_resets_strike_counter() {
        let core = test_core().await;
        core.add_task(1, Trigger::Manual, WaterTarget::Volume { litres: 1 })
            .await
            .unwrap();
        core.task_tick().await;

        // One silent window...
        {
            let mut state = core.state.lock().await;
            core.monitor_tick(&mut state, Instant::now());
        }
        tokio::time::advance(Duration::from_millis(FLOW_CHECK_THRESHOLD_MS)).await;
        {
            let mut state = core.state.lock().await;
            core.monitor_tick(&mut state, Instant::now());
            assert_eq!(state.monitor.noflow_strikes, 1);
        }

        // ...then pulses arrive: the streak clears.
        core.flow.add_pulses(10);
        tokio::time::advance(Duration::from_millis(FLOW_CHECK_THRESHOLD_MS)).await;
        let mut state = core.state.lock().await;
        core.monitor_tick(&mut state, Instant::now());
        assert_eq!(state.monitor.noflow_strikes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duration_task_has_grace_before_no_flow_arms() {
        let core = test_core().await;
        core.add_task(0, Trigger::Manual, WaterTarget::Duration { minutes: 5 })
            .await
            .unwrap();
        core.task_tick().await;

        // Inside the grace period nothing is counted.
        {
            let mut state = core.state.lock().await;
            core.monitor_tick(&mut state, Instant::now());
        }
        tokio::time::advance(Duration::from_millis(FLOW_CHECK_THRESHOLD_MS)).await;
        {
            let mut state = core.state.lock().await;
            core.monitor_tick(&mut state, Instant::now());
            assert_eq!(state.monitor.noflow_strikes, 0);
        }

        // Past the grace period strikes accumulate.
        tokio::time::advance(Duration::from_millis(NO_FLOW_GRACE_MS)).await;
        {
            let mut state = core.state.lock().await;
            core.monitor_tick(&mut state, Instant::now());
        }
        tokio::time::advance(Duration::from_millis(FLOW_CHECK_THRESHOLD_MS)).await;
        let mut state = core.state.lock().await;
        core.monitor_tick(&mut state, Instant::now());
        assert_eq!(state.monitor.noflow_strikes, 1);
    }
}
