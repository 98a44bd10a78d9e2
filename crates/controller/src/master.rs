//! Master-valve controller: a common upstream valve opened around zone
//! valves with configurable lead/lag delays, and held open across back-to-
//! back tasks that fall within the overlap grace window.
//!
//! The "close later" obligation is owned by a delayed-work sleeper spawned
//! from the executor; an epoch counter makes stale sleepers no-ops, which is
//! how a new `notify_upcoming` cancels a pending close.

use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};
use tracing::info;

use crate::error::Result;
use crate::events::{CoreEvent, EventBus, MASTER_CHANNEL};

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterConfig {
    pub enabled: bool,
    /// Seconds the master leads the zone valve.  Negative: the zone opens
    /// first and the master follows after `|delay|`.
    pub pre_start_delay_s: i16,
    /// Seconds the master lags the zone close.  Negative values close the
    /// master immediately (the zone end is not known in advance).
    pub post_stop_delay_s: i16,
    /// Hold-open window across consecutive tasks.
    pub overlap_grace_s: u16,
    /// When false the core never touches the master valve.
    pub auto_management: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            pre_start_delay_s: 2,
            post_stop_delay_s: 2,
            overlap_grace_s: 5,
            auto_management: true,
        }
    }
}

impl MasterConfig {
    pub fn managed(&self) -> bool {
        self.enabled && self.auto_management
    }
}

// ---------------------------------------------------------------------------
// Pin backend
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
struct MasterPin {
    pin: Option<OutputPin>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl MasterPin {
    fn new(pin_number: Option<u8>, active_low: bool) -> Result<Self> {
        let pin = match pin_number {
            Some(n) => {
                let gpio = Gpio::new().map_err(|e| Error::Hardware(e.to_string()))?;
                let mut p = gpio
                    .get(n)
                    .map_err(|e| Error::Hardware(e.to_string()))?
                    .into_output();
                if active_low {
                    p.set_high();
                } else {
                    p.set_low();
                }
                Some(p)
            }
            None => None,
        };
        Ok(Self { pin, active_low })
    }

    fn set(&mut self, on: bool) -> Result<()> {
        if let Some(pin) = &mut self.pin {
            if on != self.active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
        }
        Ok(())
    }
}

#[cfg(not(feature = "gpio"))]
struct MasterPin;

#[cfg(not(feature = "gpio"))]
impl MasterPin {
    fn new(_pin_number: Option<u8>, _active_low: bool) -> Result<Self> {
        Ok(Self)
    }

    fn set(&mut self, _on: bool) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Controller state (lives inside the core state block)
// ---------------------------------------------------------------------------

pub struct MasterState {
    pub cfg: MasterConfig,
    backend: MasterPin,
    open: bool,
    upcoming: Option<Instant>,
    close_deadline: Option<Instant>,
    /// Bumped whenever a pending close becomes invalid; sleeper tasks carry
    /// the epoch they were spawned under and give up on mismatch.
    close_epoch: u64,
    bus: EventBus,
}

impl MasterState {
    pub fn new(
        pin_number: Option<u8>,
        active_low: bool,
        cfg: MasterConfig,
        bus: EventBus,
    ) -> Result<Self> {
        Ok(Self {
            cfg,
            backend: MasterPin::new(pin_number, active_low)?,
            open: false,
            upcoming: None,
            close_deadline: None,
            close_epoch: 0,
            bus,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn open_now(&mut self) -> Result<()> {
        // Opening supersedes any pending delayed close.
        self.cancel_pending_close();
        if !self.open {
            self.backend.set(true)?;
            self.open = true;
            info!("master valve open");
            self.bus.emit(CoreEvent::ValveChanged {
                channel: MASTER_CHANNEL,
                open: true,
            });
        }
        Ok(())
    }

    pub fn close_now(&mut self) -> Result<()> {
        self.cancel_pending_close();
        if self.open {
            self.backend.set(false)?;
            self.open = false;
            info!("master valve closed");
            self.bus.emit(CoreEvent::ValveChanged {
                channel: MASTER_CHANNEL,
                open: false,
            });
        }
        Ok(())
    }

    /// Announce the start time of the next pending task so a close decision
    /// can hold the master open across the gap.
    pub fn notify_upcoming(&mut self, start: Instant) {
        self.upcoming = Some(start);
        self.cancel_pending_close();
    }

    pub fn clear_upcoming(&mut self) {
        self.upcoming = None;
    }

    /// Decide what happens to the master when a zone valve just closed.
    /// Returns the deadline a delayed-work sleeper must enforce, plus the
    /// epoch guarding it; `None` means nothing to do (not managed, already
    /// closed, or closed synchronously right here).
    pub fn on_zone_closed(&mut self, now: Instant) -> Option<(Instant, u64)> {
        if !self.cfg.managed() || !self.open {
            return None;
        }

        let grace = Duration::from_secs(self.cfg.overlap_grace_s as u64);
        if let Some(next) = self.upcoming {
            // Keep the master open across a short gap to the next task.
            if next <= now + grace {
                let deadline = next + grace;
                self.close_deadline = Some(deadline);
                self.close_epoch += 1;
                return Some((deadline, self.close_epoch));
            }
        }

        if self.cfg.post_stop_delay_s <= 0 {
            // A negative lag cannot reach back in time; close immediately.
            let _ = self.close_now();
            return None;
        }

        let deadline = now + Duration::from_secs(self.cfg.post_stop_delay_s as u64);
        self.close_deadline = Some(deadline);
        self.close_epoch += 1;
        Some((deadline, self.close_epoch))
    }

    /// Called by the sleeper when its deadline fires.  Returns true when the
    /// close was still wanted and happened.
    pub fn fire_delayed_close(&mut self, epoch: u64) -> bool {
        if self.close_epoch != epoch || self.close_deadline.is_none() {
            return false; // superseded
        }
        self.close_deadline = None;
        self.close_now().is_ok()
    }

    fn cancel_pending_close(&mut self) {
        if self.close_deadline.take().is_some() {
            self.close_epoch += 1;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
