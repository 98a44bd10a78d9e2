//! Per-channel data model: the persisted configuration (schedule, watering
//! mode, cycle-and-soak, compensation, growing environment) and the runtime
//! bookkeeping the scheduler and executor maintain.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::task::WaterTarget;

/// Number of physical solenoid outputs.
pub const CHANNEL_COUNT: usize = 8;

/// Display name limit in bytes (UTF-8, null-terminated on the wire).
pub const MAX_NAME_BYTES: usize = 63;

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    /// Fire on set weekday bits (bit 0 = Monday .. bit 6 = Sunday).
    Daily { days_mask: u8 },
    /// Fire every N days, counted from controller first start.
    Periodic { interval_days: u16 },
    /// Deficit-driven: the evapotranspiration model decides.
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTime {
    pub hour: u8,
    pub minute: u8,
}

impl StartTime {
    pub fn validate(&self) -> Result<()> {
        if self.hour > 23 || self.minute > 59 {
            return Err(Error::InvalidParam("start time out of range"));
        }
        Ok(())
    }

    pub fn minute_of_day(&self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }
}

// ---------------------------------------------------------------------------
// Cycle-and-soak (interval) configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalConfig {
    pub watering_s: u32,
    pub pause_s: u32,
}

impl IntervalConfig {
    /// Interval mode is active only when both phases are non-zero.
    pub fn is_configured(&self) -> bool {
        self.watering_s > 0 && self.pause_s > 0
    }
}

// ---------------------------------------------------------------------------
// Compensation
// ---------------------------------------------------------------------------

/// Rain and temperature compensation parameters.  Apply only to Duration and
/// Volume modes; auto mode folds weather into its deficit instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub rain_enabled: bool,
    /// Rainfall over the lookback window that triggers skip/reduce.
    pub rain_threshold_mm: f32,
    /// When `true`, skip the run entirely; otherwise reduce it.
    pub rain_skip: bool,
    /// Percentage removed from the target when reducing (0..=100).
    pub rain_reduction_pct: u8,
    pub temp_enabled: bool,
    /// Reference temperature; no adjustment at exactly this value.
    pub temp_base_c: f32,
    /// Percent added to the target per °C above base (capped at +50%).
    pub temp_pct_per_deg: f32,
}

impl Default for Compensation {
    fn default() -> Self {
        Self {
            rain_enabled: false,
            rain_threshold_mm: 5.0,
            rain_skip: false,
            rain_reduction_pct: 50,
            temp_enabled: false,
            temp_base_c: 25.0,
            temp_pct_per_deg: 2.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Growing environment
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlantKind {
    Grass,
    Shrub,
    Tree,
    Vegetable,
    Flower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SoilKind {
    Sand,
    Loam,
    Silt,
    Clay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IrrigationMethod {
    Drip,
    Sprinkler,
    Soaker,
}

/// Optional override of the soil's water-holding behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoilCoefficients {
    /// Millimetres of deficit the soil tolerates before irrigation is due.
    pub allowable_depletion_mm: f32,
    /// Fraction of rainfall that actually reaches the root zone (0..=1).
    pub infiltration: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GrowingEnv {
    pub plant: Option<PlantKind>,
    pub soil: Option<SoilKind>,
    pub method: Option<IrrigationMethod>,
    pub custom_soil: Option<SoilCoefficients>,
    /// Geolocation for solar timing, decimal degrees.
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    /// Install date as UTC seconds; auto mode requires it.
    pub installed_unix: Option<i64>,
    /// Irrigated area in square metres, used to convert deficit mm → litres.
    pub area_m2: f32,
}

impl GrowingEnv {
    /// Auto mode needs plant, soil and install date before it may run.
    pub fn auto_ready(&self) -> bool {
        self.plant.is_some() && self.soil.is_some() && self.installed_unix.is_some()
    }
}

// ---------------------------------------------------------------------------
// Channel configuration + runtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub auto_enabled: bool,
    pub schedule: Schedule,
    pub start: StartTime,
    pub use_solar_timing: bool,
    /// The configured event target.  Never mutated by scheduling; adjusted
    /// targets travel inside the task.
    pub target: WaterTarget,
    pub interval: IntervalConfig,
    pub compensation: Compensation,
    pub growing: GrowingEnv,
}

impl ChannelConfig {
    pub fn factory_default(index: usize) -> Self {
        Self {
            name: format!("Channel {}", index + 1),
            auto_enabled: false,
            schedule: Schedule::Daily { days_mask: 0 },
            start: StartTime { hour: 6, minute: 0 },
            use_solar_timing: false,
            target: WaterTarget::Duration { minutes: 10 },
            interval: IntervalConfig::default(),
            compensation: Compensation::default(),
            growing: GrowingEnv {
                area_m2: 10.0,
                ..GrowingEnv::default()
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.len() > MAX_NAME_BYTES {
            return Err(Error::InvalidParam("name exceeds 63 bytes"));
        }
        self.start.validate()?;
        self.target.validate()?;
        if let Schedule::Periodic { interval_days: 0 } = self.schedule {
            return Err(Error::InvalidParam("interval_days must be >= 1"));
        }
        if self.compensation.rain_reduction_pct > 100 {
            return Err(Error::InvalidParam("rain reduction over 100%"));
        }
        Ok(())
    }

    /// Cycle-and-soak applies only to Duration/Volume events with a
    /// configured interval; auto always runs contiguously.
    pub fn interval_active(&self) -> bool {
        self.interval.is_configured() && !matches!(self.schedule, Schedule::Auto)
    }
}

/// Why the scheduler most recently skipped this channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Freeze,
    Rain,
    QueueFull,
    Fault,
}

/// Lifetime totals backing the Statistics record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTotals {
    pub runs: u32,
    pub open_secs: u64,
    pub millilitres: u64,
}

/// Persisted runtime bookkeeping.  `last_watering_unix` is UTC seconds and
/// monotonically non-decreasing within a boot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelRuntime {
    pub is_active: bool,
    pub last_watering_unix: i64,
    pub last_auto_check_julian: u16,
    /// Epoch day of the last auto check, for offline-gap accumulation
    /// across year boundaries.
    #[serde(default)]
    pub last_auto_check_epoch_day: i64,
    pub auto_check_ran_today: bool,
    /// Accumulated water deficit for auto mode, millimetres.
    pub deficit_mm: f32,
    pub last_skip: Option<SkipReason>,
    pub totals: ChannelTotals,
    /// Guard against double-firing within the same scheduler minute:
    /// (julian day, minute of day) of the last fire.
    #[serde(skip)]
    pub fired_at: Option<(u16, u16)>,
}

pub struct ChannelState {
    pub config: ChannelConfig,
    pub runtime: ChannelRuntime,
}

impl ChannelState {
    pub fn factory_default(index: usize) -> Self {
        Self {
            config: ChannelConfig::factory_default(index),
            runtime: ChannelRuntime::default(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
