//! Zone valve driver.  The `gpio` feature gates the real rppal backend;
//! without it, a mock backend tracks pin state in memory.  At most one zone
//! channel is ever energised; violating callers get `Busy`.

use tracing::{info, warn};

use crate::channel::CHANNEL_COUNT;
use crate::error::{Error, Result};
use crate::events::{CoreEvent, EventBus};
use crate::flow::FlowMeter;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// GPIO backends
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
struct PinBank {
    pins: Vec<OutputPin>,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl PinBank {
    fn new(pin_numbers: &[u8; CHANNEL_COUNT], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| Error::Hardware(e.to_string()))?;
        let mut pins = Vec::with_capacity(CHANNEL_COUNT);
        for n in pin_numbers {
            let mut pin = gpio
                .get(*n)
                .map_err(|e| Error::Hardware(e.to_string()))?
                .into_output();
            // Fail-safe: de-energised at startup.
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.push(pin);
        }
        Ok(Self { pins, active_low })
    }

    fn set(&mut self, id: usize, on: bool) -> Result<()> {
        let pin = &mut self.pins[id];
        // Active-low relay: LOW = energised.
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        Ok(())
    }
}

#[cfg(not(feature = "gpio"))]
struct PinBank;

#[cfg(not(feature = "gpio"))]
impl PinBank {
    fn new(_pin_numbers: &[u8; CHANNEL_COUNT], _active_low: bool) -> Result<Self> {
        Ok(Self)
    }

    fn set(&mut self, _id: usize, _on: bool) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Valve bank
// ---------------------------------------------------------------------------

pub struct ValveBank {
    backend: PinBank,
    /// Shadow of the physical pin state, one bool per channel.
    states: [bool; CHANNEL_COUNT],
    active: Option<u8>,
    flow: FlowMeter,
    bus: EventBus,
}

impl ValveBank {
    pub fn new(
        pin_numbers: &[u8; CHANNEL_COUNT],
        active_low: bool,
        flow: FlowMeter,
        bus: EventBus,
    ) -> Result<Self> {
        Ok(Self {
            backend: PinBank::new(pin_numbers, active_low)?,
            states: [false; CHANNEL_COUNT],
            active: None,
            flow,
            bus,
        })
    }

    /// Energise a zone valve.  Fails with `Busy` while another channel is
    /// active; success means the GPIO write happened.
    pub fn channel_on(&mut self, id: u8) -> Result<()> {
        let idx = check_index(id)?;
        if let Some(active) = self.active {
            if active != id {
                return Err(Error::Busy("another channel is active"));
            }
            return Ok(()); // already on
        }
        self.backend.set(idx, true)?;
        self.states[idx] = true;
        self.active = Some(id);
        info!(channel = id, "valve open");
        self.bus.emit(CoreEvent::ValveChanged {
            channel: id,
            open: true,
        });
        Ok(())
    }

    /// De-energise a zone valve.  When this closes the last open channel,
    /// the pulse counter is rebaselined so idle flow reads as a leak.
    pub fn channel_off(&mut self, id: u8) -> Result<()> {
        let idx = check_index(id)?;
        self.backend.set(idx, false)?;
        let was_open = std::mem::replace(&mut self.states[idx], false);
        if self.active == Some(id) {
            self.active = None;
        }
        if was_open {
            info!(channel = id, "valve closed");
            self.bus.emit(CoreEvent::ValveChanged {
                channel: id,
                open: false,
            });
        }
        if self.active.is_none() {
            self.flow.reset();
        }
        Ok(())
    }

    /// Force every channel closed.  Never leaves the pulse counter non-zero.
    pub fn close_all(&mut self) {
        for id in 0..CHANNEL_COUNT {
            if let Err(e) = self.backend.set(id, false) {
                warn!(channel = id, "close_all: gpio write failed: {e}");
            }
            if std::mem::replace(&mut self.states[id], false) {
                self.bus.emit(CoreEvent::ValveChanged {
                    channel: id as u8,
                    open: false,
                });
            }
        }
        self.active = None;
        self.flow.reset();
    }

    pub fn active(&self) -> Option<u8> {
        self.active
    }

    pub fn is_open(&self, id: u8) -> bool {
        (id as usize) < CHANNEL_COUNT && self.states[id as usize]
    }

    /// Bitmap of open channels for the Diagnostics record.
    pub fn bitmap(&self) -> u8 {
        self.states
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, on)| acc | ((*on as u8) << i))
    }
}

fn check_index(id: u8) -> Result<usize> {
    if (id as usize) < CHANNEL_COUNT {
        Ok(id as usize)
    } else {
        Err(Error::InvalidParam("channel index out of range"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
