//! Simulated sensor drivers for development without hardware: a stateful
//! temperature walk, a flow-pulse generator tied to valve state, and a rain
//! injector for the stormy scenario.
//!
//! Modelled behaviours: temporal coherence via a mean-reverting random walk,
//! per-reading sensor noise, and a diurnal day/night swing.

use std::sync::{Arc, Mutex};

use tokio::time::Duration;
use tracing::info;

use crate::core::Core;
use crate::weather::{EnvSensor, SensorError, WeatherReading};

// ---------------------------------------------------------------------------
// Gaussian approximation
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO` env var.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Hovers around 18 °C.  Nothing interesting happens; good for
    /// exercising schedules.
    Mild,
    /// Hot and dry around 32 °C.  Drives auto-mode deficits up quickly.
    Heatwave,
    /// Hovers around 1 °C so the freeze lockout engages and releases.
    ColdSnap,
    /// Mild with frequent rain bursts; exercises rain compensation.
    Stormy,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "heatwave" => Self::Heatwave,
            "coldsnap" | "cold" => Self::ColdSnap,
            "stormy" => Self::Stormy,
            _ => Self::Mild, // default
        }
    }

    fn baseline_c(&self) -> f64 {
        match self {
            Self::Mild => 18.0,
            Self::Heatwave => 32.0,
            Self::ColdSnap => 1.0,
            Self::Stormy => 15.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Environmental sensor
// ---------------------------------------------------------------------------

pub struct SimEnv {
    scenario: Scenario,
    state: Mutex<f64>,
}

impl SimEnv {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            state: Mutex::new(scenario.baseline_c()),
        }
    }
}

impl EnvSensor for SimEnv {
    fn sample(&self) -> Result<WeatherReading, SensorError> {
        let mut temp = self.state.lock().unwrap();
        // Mean-reverting walk toward the scenario baseline.
        let pull = (self.scenario.baseline_c() - *temp) * 0.05;
        *temp += pull + gaussian(0.0, 0.3);

        Ok(WeatherReading {
            temp_c: *temp as f32,
            humidity_pct: gaussian(55.0, 5.0).clamp(5.0, 100.0) as f32,
            pressure_hpa: gaussian(1013.0, 2.0) as f32,
        })
    }
}

// ---------------------------------------------------------------------------
// Flow + rain drivers
// ---------------------------------------------------------------------------

/// Nominal simulated flow rate while a valve is open.
const SIM_FLOW_L_PER_MIN: u64 = 6;

const SIM_TICK: Duration = Duration::from_millis(500);

/// Generate flow pulses while any zone valve is open.  Intended to be
/// `tokio::spawn`-ed alongside the loops.
pub async fn run_flow_sim(core: Arc<Core>) {
    info!(rate_l_min = SIM_FLOW_L_PER_MIN, "flow simulator started");
    loop {
        if core.shutting_down() {
            break;
        }
        let open = match core.lock_state().await {
            Ok(state) => state.bank.active().is_some(),
            Err(_) => false,
        };
        if open {
            // pulses per tick = rate[l/min] × ppl ÷ (60 × ticks-per-second)
            let ppl = core.flow.calibration() as u64;
            let per_tick = (SIM_FLOW_L_PER_MIN * ppl / 60 / 2).max(1);
            let jitter = fastrand::u64(0..=per_tick / 10 + 1);
            core.flow.add_pulses((per_tick + jitter) as u32);
        }
        tokio::time::sleep(SIM_TICK).await;
    }
}

/// Occasional rain bursts for the stormy scenario.
pub async fn run_rain_sim(core: Arc<Core>, scenario: Scenario) {
    if scenario != Scenario::Stormy {
        return;
    }
    info!("rain simulator started (stormy)");
    loop {
        if core.shutting_down() {
            break;
        }
        // A burst roughly every ten minutes.
        tokio::time::sleep(Duration::from_secs(fastrand::u64(300..900))).await;
        let tips = fastrand::u32(5..40);
        core.rain.add_tips(tips);
        info!(tips, "simulated rain burst");
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_parsing_is_lossy() {
        assert_eq!(Scenario::from_str_lossy("heatwave"), Scenario::Heatwave);
        assert_eq!(Scenario::from_str_lossy("COLD"), Scenario::ColdSnap);
        assert_eq!(Scenario::from_str_lossy("garbage"), Scenario::Mild);
    }

    #[test]
    fn sim_env_stays_near_baseline() {
        let env = SimEnv::new(Scenario::Heatwave);
        let mut last = 0.0f32;
        for _ in 0..500 {
            last = env.sample().unwrap().temp_c;
        }
        assert!((last - 32.0).abs() < 10.0, "drifted to {last}");
    }

    #[test]
    fn cold_snap_reaches_freeze_territory() {
        let env = SimEnv::new(Scenario::ColdSnap);
        let mut saw_cold = false;
        for _ in 0..500 {
            if env.sample().unwrap().temp_c < crate::safety::FREEZE_CLEAR_C {
                saw_cold = true;
            }
        }
        assert!(saw_cold);
    }
}
