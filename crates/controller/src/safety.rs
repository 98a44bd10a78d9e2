//! Safety layer: freeze lockout with hysteresis and the rules for stale or
//! missing temperature data.  RTC degradation is owned by the clock; this
//! module only mirrors it into alarms when the scheduler reports it.

use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use crate::core::{Core, CoreState};
use crate::events::AlarmCode;
use crate::weather::SensorError;

/// Lockout engages at or below this temperature.
pub const FREEZE_LOCK_C: f32 = 2.0;

/// Lockout clears at or above this temperature; [2.0, 4.0] is the
/// hysteresis band.
pub const FREEZE_CLEAR_C: f32 = 4.0;

/// Cached reading older than this is stale.
pub const STALE_DATA_AGE: Duration = Duration::from_secs(10 * 60);

/// Freeze alarms repeat no faster than this while locked.
pub const FREEZE_ALARM_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Default)]
pub struct FreezeState {
    pub locked: bool,
    pub last_alarm: Option<Instant>,
}

impl Core {
    /// Evaluate the freeze lockout.  Called from the scheduler tick; returns
    /// whether actuation is currently vetoed.
    pub(crate) fn check_freeze(&self, state: &mut CoreState) -> bool {
        let cached = self.weather.cached();

        // Fresh cache, or one on-demand refresh when stale.
        let (temp, fresh) = match cached {
            Some((r, age)) if age <= STALE_DATA_AGE => (Some(r.temp_c), true),
            _ => match self.weather.refresh() {
                Ok(r) => (Some(r.temp_c), true),
                Err(SensorError::NoDevice) | Err(SensorError::Busy) => (None, false),
                Err(SensorError::Failed) => (cached.map(|(r, _)| r.temp_c), false),
            },
        };

        let was_locked = state.freeze.locked;
        let now_locked = match (temp, fresh) {
            // Sensor unavailable: fail open with a synthetic warm reading.
            (None, _) => {
                warn!("temperature unavailable, freeze guard failing open");
                false
            }
            // Stale data: lock out below the clear threshold, allow above
            // it with a warning.
            (Some(t), false) => {
                if t < FREEZE_CLEAR_C {
                    warn!(temp = t, "stale temperature below threshold, locking out");
                    true
                } else {
                    warn!(temp = t, "temperature data stale, allowing");
                    false
                }
            }
            (Some(t), true) => {
                if t <= FREEZE_LOCK_C {
                    true
                } else if t >= FREEZE_CLEAR_C {
                    false
                } else {
                    was_locked // hysteresis band holds the previous state
                }
            }
        };

        let temp_x10 = ((temp.unwrap_or(0.0) * 10.0) as i16) as u16;
        let now = Instant::now();

        if now_locked && !was_locked {
            state.freeze.locked = true;
            warn!(temp = ?temp, "freeze lockout engaged");
            self.raise_alarm(AlarmCode::Freeze, temp_x10);
            state.freeze.last_alarm = Some(now);
            self.refresh_status(state);
        } else if now_locked {
            let due = state
                .freeze
                .last_alarm
                .map(|t| now.saturating_duration_since(t) >= FREEZE_ALARM_INTERVAL)
                .unwrap_or(true);
            if due {
                self.raise_alarm(AlarmCode::Freeze, temp_x10);
                state.freeze.last_alarm = Some(now);
            }
        } else if was_locked {
            state.freeze.locked = false;
            state.freeze.last_alarm = None;
            info!(temp = ?temp, "freeze lockout cleared");
            self.raise_alarm(AlarmCode::FreezeCleared, temp_x10);
            self.refresh_status(state);
        }

        state.freeze.locked
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SystemStatus;
    use crate::testutil::{test_core_with, TestRig};

    /// The environmental module samples on the scheduler cadence; mirror
    /// that here so each check sees the latest sensor value.
    async fn check(rig: &TestRig) -> bool {
        let _ = rig.core.weather.refresh();
        let mut state = rig.core.state.lock().await;
        rig.core.check_freeze(&mut state)
    }

    #[tokio::test(start_paused = true)]
    async fn lockout_engages_at_two_and_clears_at_four() {
        let rig = test_core_with().await;

        // Monotonically decreasing temperature locks at ≤ 2 °C.
        for temp in [5.0f32, 3.5, 2.1] {
            rig.env.set_temp(temp);
            assert!(!check(&rig).await, "no lockout at {temp}");
        }
        rig.env.set_temp(2.0);
        assert!(check(&rig).await, "lockout at 2.0");
        assert_eq!(
            rig.core.state.lock().await.status,
            SystemStatus::FreezeLockout
        );

        // Rising through the band does not clear...
        for temp in [2.5f32, 3.0, 3.9] {
            rig.env.set_temp(temp);
            assert!(check(&rig).await, "band holds lockout at {temp}");
        }
        // ...until ≥ 4 °C.
        rig.env.set_temp(4.0);
        assert!(!check(&rig).await);
        assert_eq!(rig.core.state.lock().await.status, SystemStatus::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn band_entry_from_warm_does_not_lock() {
        let rig = test_core_with().await;
        rig.env.set_temp(10.0);
        assert!(!check(&rig).await);
        rig.env.set_temp(3.0); // inside the band, coming from warm
        assert!(!check(&rig).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sensor_unavailable_fails_open() {
        let rig = test_core_with().await;
        rig.env.set_error(crate::weather::SensorError::NoDevice);
        assert!(!check(&rig).await);

        rig.env.set_error(crate::weather::SensorError::Busy);
        assert!(!check(&rig).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cold_reading_locks_out() {
        let rig = test_core_with().await;
        rig.env.set_temp(3.0);
        rig.core.weather.refresh().unwrap();

        // Age the cache past 10 minutes, then make refreshes fail.
        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        rig.env.set_error(crate::weather::SensorError::Failed);

        assert!(check(&rig).await, "stale sub-4° reading must lock out");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_warm_reading_allows() {
        let rig = test_core_with().await;
        rig.env.set_temp(12.0);
        rig.core.weather.refresh().unwrap();

        tokio::time::advance(Duration::from_secs(11 * 60)).await;
        rig.env.set_error(crate::weather::SensorError::Failed);

        assert!(!check(&rig).await);
    }

    #[tokio::test(start_paused = true)]
    async fn freeze_alarm_rate_limited() {
        let rig = test_core_with().await;
        let mut rx = rig.core.events().subscribe();
        rig.env.set_temp(1.0);

        check(&rig).await; // engages + alarms
        check(&rig).await; // still locked, too soon to re-alarm
        tokio::time::advance(FREEZE_ALARM_INTERVAL).await;
        check(&rig).await; // re-alarms

        let mut freeze_alarms = 0;
        while let Ok(ev) = rx.try_recv() {
            if let crate::events::CoreEvent::AlarmRaised { code, .. } = ev {
                if code == AlarmCode::Freeze {
                    freeze_alarms += 1;
                }
            }
        }
        assert_eq!(freeze_alarms, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_emits_info_alarm_with_temperature() {
        let rig = test_core_with().await;
        let mut rx = rig.core.events().subscribe();

        rig.env.set_temp(1.5);
        check(&rig).await;
        rig.env.set_temp(4.1);
        check(&rig).await;

        let mut cleared = None;
        while let Ok(ev) = rx.try_recv() {
            if let crate::events::CoreEvent::AlarmRaised { code, data, .. } = ev {
                if code == AlarmCode::FreezeCleared {
                    cleared = Some(data);
                }
            }
        }
        assert_eq!(cleared, Some(41));
    }
}
