//! TOML configuration loading, environment overrides and first-boot seeding
//! of the persistent store.  After seeding, the store is the source of truth
//! for channel and system settings; the file only provides deployment wiring
//! (pins, broker, database path) and initial values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::channel::{ChannelConfig, Schedule, StartTime, CHANNEL_COUNT};
use crate::master::MasterConfig;
use crate::task::WaterTarget;

// ---------------------------------------------------------------------------
// Power mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerMode {
    Normal,
    EnergySaving,
    UltraLowPower,
}

impl PowerMode {
    /// Task-loop tick period.
    pub fn task_period(&self) -> Duration {
        match self {
            PowerMode::Normal => Duration::from_millis(500),
            PowerMode::EnergySaving => Duration::from_secs(2),
            PowerMode::UltraLowPower => Duration::from_secs(600),
        }
    }

    /// Scheduler-loop tick period.
    pub fn scheduler_period(&self) -> Duration {
        match self {
            PowerMode::Normal => Duration::from_secs(60),
            PowerMode::EnergySaving => Duration::from_secs(120),
            PowerMode::UltraLowPower => Duration::from_secs(300),
        }
    }
}

impl Default for PowerMode {
    fn default() -> Self {
        PowerMode::Normal
    }
}

/// System-wide settings persisted under the `system` key.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    pub power_mode: PowerMode,
    pub rain_integration: bool,
    pub master: MasterConfig,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            power_mode: PowerMode::Normal,
            rain_integration: true,
            master: MasterConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_url")]
    pub db_url: String,
    #[serde(default = "default_mqtt_host")]
    pub mqtt_host: String,
    #[serde(default = "default_mqtt_port")]
    pub mqtt_port: u16,
    /// Feature toggle for the wireless surface; when false every surface
    /// call is a clean no-op.
    #[serde(default = "default_true")]
    pub surface_enabled: bool,
    #[serde(default)]
    pub power_mode: PowerMode,
    #[serde(default = "default_true")]
    pub relay_active_low: bool,
    #[serde(default = "default_channel_pins")]
    pub channel_pins: [u8; CHANNEL_COUNT],
    #[serde(default)]
    pub master_pin: Option<u8>,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default = "default_true")]
    pub rain_integration: bool,
    #[serde(default = "default_mm_per_tip")]
    pub rain_mm_per_tip: f32,
    #[serde(default)]
    pub channels: Vec<ChannelSeed>,
}

fn default_db_url() -> String {
    "sqlite:controller.db?mode=rwc".to_string()
}
fn default_mqtt_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mqtt_port() -> u16 {
    1883
}
fn default_true() -> bool {
    true
}
fn default_channel_pins() -> [u8; CHANNEL_COUNT] {
    [17, 18, 22, 23, 24, 25, 26, 27]
}
fn default_mm_per_tip() -> f32 {
    0.2
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must parse")
    }
}

/// First-boot channel seed.  Exactly one of `days_mask`, `interval_days` or
/// `auto = true` selects the schedule kind; `duration_minutes` /
/// `volume_litres` selects the target.
#[derive(Debug, Deserialize)]
pub struct ChannelSeed {
    pub index: usize,
    pub name: String,
    #[serde(default)]
    pub auto_enabled: bool,
    pub hour: u8,
    pub minute: u8,
    #[serde(default)]
    pub days_mask: Option<u8>,
    #[serde(default)]
    pub interval_days: Option<u16>,
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub duration_minutes: Option<u16>,
    #[serde(default)]
    pub volume_litres: Option<u16>,
    #[serde(default)]
    pub use_solar_timing: bool,
}

impl ChannelSeed {
    pub fn to_channel_config(&self) -> Result<ChannelConfig> {
        if self.index >= CHANNEL_COUNT {
            anyhow::bail!("channel seed index {} out of range", self.index);
        }

        let schedule = match (self.days_mask, self.interval_days, self.auto) {
            (Some(mask), None, false) => Schedule::Daily { days_mask: mask },
            (None, Some(days), false) => Schedule::Periodic {
                interval_days: days,
            },
            (None, None, true) => Schedule::Auto,
            _ => anyhow::bail!(
                "channel seed '{}' must pick exactly one of days_mask / interval_days / auto",
                self.name
            ),
        };

        let target = match (self.duration_minutes, self.volume_litres) {
            (Some(m), None) => WaterTarget::Duration { minutes: m },
            (None, Some(l)) => WaterTarget::Volume { litres: l },
            (None, None) => WaterTarget::Duration { minutes: 10 },
            _ => anyhow::bail!(
                "channel seed '{}' sets both duration and volume",
                self.name
            ),
        };

        let mut cfg = ChannelConfig::factory_default(self.index);
        cfg.name = self.name.clone();
        cfg.auto_enabled = self.auto_enabled;
        cfg.schedule = schedule;
        cfg.start = StartTime {
            hour: self.hour,
            minute: self.minute,
        };
        cfg.use_solar_timing = self.use_solar_timing;
        cfg.target = target;
        cfg.validate()
            .map_err(|e| anyhow::anyhow!("channel seed '{}': {e}", self.name))?;
        Ok(cfg)
    }
}

// ---------------------------------------------------------------------------
// Load + overrides
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file.  A missing file yields the defaults.
pub fn load(path: &str) -> Result<Config> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// Deployment knobs may be overridden from the environment without touching
/// the config file.
pub fn apply_env_overrides(config: &mut Config) {
    if let Ok(v) = env::var("MQTT_HOST") {
        config.mqtt_host = v;
    }
    if let Some(v) = env::var("MQTT_PORT").ok().and_then(|s| s.parse().ok()) {
        config.mqtt_port = v;
    }
    if let Ok(v) = env::var("DB_URL") {
        config.db_url = v;
    }
    if let Ok(v) = env::var("RELAY_ACTIVE_LOW") {
        config.relay_active_low = v == "1" || v.eq_ignore_ascii_case("true");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
