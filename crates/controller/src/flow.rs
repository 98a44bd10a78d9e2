//! Flow accounting: the free-running pulse counter (written by the meter
//! ISR, read everywhere else) and the pulses ↔ millilitres calibration.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Factory calibration for the stock flow meter.
pub const DEFAULT_PULSES_PER_LITRE: u32 = 750;

/// Shared handle to the pulse counter and calibration.  Cloning is cheap;
/// all clones observe the same counter.
#[derive(Clone)]
pub struct FlowMeter {
    pulses: Arc<AtomicU32>,
    pulses_per_litre: Arc<AtomicU32>,
}

impl FlowMeter {
    pub fn new(pulses_per_litre: u32) -> Self {
        Self {
            pulses: Arc::new(AtomicU32::new(0)),
            pulses_per_litre: Arc::new(AtomicU32::new(pulses_per_litre.max(1))),
        }
    }

    /// The raw counter, for the ISR / pulse source to increment.
    pub fn pulse_input(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.pulses)
    }

    pub fn pulses(&self) -> u32 {
        self.pulses.load(Ordering::Relaxed)
    }

    /// Reset the baseline.  Done whenever the last valve closes, so that a
    /// non-zero counter while idle means a leak.
    pub fn reset(&self) {
        self.pulses.store(0, Ordering::Relaxed);
    }

    pub fn add_pulses(&self, n: u32) {
        self.pulses.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_calibration(&self, pulses_per_litre: u32) -> Result<()> {
        if pulses_per_litre == 0 {
            return Err(Error::InvalidParam("pulses_per_litre must be >= 1"));
        }
        self.pulses_per_litre
            .store(pulses_per_litre, Ordering::Relaxed);
        Ok(())
    }

    pub fn calibration(&self) -> u32 {
        self.pulses_per_litre.load(Ordering::Relaxed)
    }

    /// Convert a pulse count to millilitres.  Widened to u64 before the
    /// multiply so large counts cannot overflow; any non-zero pulse count
    /// reports at least 1 ml.
    pub fn volume_ml(&self, pulses: u32) -> u64 {
        if pulses == 0 {
            return 0;
        }
        let ppl = self.calibration() as u64;
        let ml = pulses as u64 * 1000 / ppl;
        ml.max(1)
    }

    /// Pulses needed to deliver `ml` millilitres at the current calibration.
    pub fn ml_to_pulses(&self, ml: u64) -> u64 {
        ml * self.calibration() as u64 / 1000
    }
}

impl Default for FlowMeter {
    fn default() -> Self {
        Self::new(DEFAULT_PULSES_PER_LITRE)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
