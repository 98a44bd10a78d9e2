//! Auto-mode decision contract and the solar-timing model.
//!
//! The scheduler only consumes the decision contract: given a channel and
//! its accumulated deficit, should it water today and with how many litres.
//! The reference model below is deliberately simple (temperature-scaled
//! reference loss × crop coefficient, minus infiltrated rain); the numeric
//! sophistication lives behind the trait so it can be swapped out.

use crate::channel::{ChannelConfig, PlantKind, SoilKind, StartTime};
use crate::clock::RtcTime;

// ---------------------------------------------------------------------------
// Decision contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoDecision {
    pub should_water: bool,
    pub volume_litres: f32,
    pub current_deficit_mm: f32,
}

pub trait DeficitModel: Send + Sync {
    /// Water lost over one day in millimetres of column, net of rain.
    fn daily_deficit_mm(&self, cfg: &ChannelConfig, temp_c: Option<f32>, rain_mm: f32) -> f32;

    /// Decide whether the accumulated deficit warrants irrigation.
    fn decide(&self, cfg: &ChannelConfig, deficit_mm: f32) -> AutoDecision;
}

/// Built-in model: linear reference loss from mean temperature, crop
/// coefficient per plant, infiltration and depletion threshold per soil
/// (overridable via custom coefficients).
pub struct ReferenceModel;

impl ReferenceModel {
    fn crop_coefficient(plant: Option<PlantKind>) -> f32 {
        match plant {
            Some(PlantKind::Grass) => 0.80,
            Some(PlantKind::Shrub) => 0.50,
            Some(PlantKind::Tree) => 0.70,
            Some(PlantKind::Vegetable) => 0.95,
            Some(PlantKind::Flower) => 0.85,
            None => 0.80,
        }
    }

    fn infiltration(cfg: &ChannelConfig) -> f32 {
        if let Some(c) = cfg.growing.custom_soil {
            return c.infiltration.clamp(0.0, 1.0);
        }
        match cfg.growing.soil {
            Some(SoilKind::Sand) => 0.50,
            Some(SoilKind::Loam) => 0.80,
            Some(SoilKind::Silt) => 0.75,
            Some(SoilKind::Clay) => 0.60,
            None => 0.70,
        }
    }

    fn depletion_threshold_mm(cfg: &ChannelConfig) -> f32 {
        if let Some(c) = cfg.growing.custom_soil {
            return c.allowable_depletion_mm.max(1.0);
        }
        match cfg.growing.soil {
            Some(SoilKind::Sand) => 8.0,
            Some(SoilKind::Loam) => 15.0,
            Some(SoilKind::Silt) => 14.0,
            Some(SoilKind::Clay) => 18.0,
            None => 12.0,
        }
    }
}

impl DeficitModel for ReferenceModel {
    fn daily_deficit_mm(&self, cfg: &ChannelConfig, temp_c: Option<f32>, rain_mm: f32) -> f32 {
        // Reference loss: ~0 below 5 °C, ~3.9 mm/day at 25 °C, capped at 8.
        let temp = temp_c.unwrap_or(20.0);
        let reference = (0.195 * (temp - 5.0)).clamp(0.0, 8.0);
        let loss = reference * Self::crop_coefficient(cfg.growing.plant);
        let gained = rain_mm * Self::infiltration(cfg);
        loss - gained
    }

    fn decide(&self, cfg: &ChannelConfig, deficit_mm: f32) -> AutoDecision {
        let threshold = Self::depletion_threshold_mm(cfg);
        let should_water = deficit_mm >= threshold;
        // 1 mm over 1 m² is one litre.
        let volume_litres = if should_water {
            deficit_mm * cfg.growing.area_m2.max(0.0)
        } else {
            0.0
        };
        AutoDecision {
            should_water,
            volume_litres,
            current_deficit_mm: deficit_mm,
        }
    }
}

// ---------------------------------------------------------------------------
// Solar timing
// ---------------------------------------------------------------------------

/// Sunrise in UTC for the given position and day, `None` when the sun does
/// not rise (polar night) or the inputs are unusable.  Standard almanac
/// approximation with a 90.833° zenith.
pub fn sunrise_utc(latitude: f64, longitude: f64, julian_day: u16) -> Option<StartTime> {
    if !(-89.9..=89.9).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
        return None;
    }

    let n = julian_day as f64;
    let lng_hour = longitude / 15.0;
    let t = n + (6.0 - lng_hour) / 24.0;

    let m = 0.985_600 * t - 3.289;
    let l = norm_deg(m + 1.916 * sin_d(m) + 0.020 * sin_d(2.0 * m) + 282.634);

    let mut ra = norm_deg(atan_d(0.917_64 * tan_d(l)));
    // Put the right ascension into the same quadrant as L.
    ra += (l / 90.0).floor() * 90.0 - (ra / 90.0).floor() * 90.0;
    let ra_hours = ra / 15.0;

    let sin_dec = 0.397_82 * sin_d(l);
    let cos_dec = (1.0 - sin_dec * sin_dec).sqrt();

    let cos_h = (cos_d(90.833) - sin_dec * sin_d(latitude)) / (cos_dec * cos_d(latitude));
    if !(-1.0..=1.0).contains(&cos_h) {
        return None; // never rises / never sets today
    }

    let h = (360.0 - acos_d(cos_h)) / 15.0;
    let mean_t = h + ra_hours - 0.065_71 * t - 6.622;
    let ut = ((mean_t - lng_hour) % 24.0 + 24.0) % 24.0;

    let total_minutes = (ut * 60.0).round() as u32 % (24 * 60);
    Some(StartTime {
        hour: (total_minutes / 60) as u8,
        minute: (total_minutes % 60) as u8,
    })
}

/// Effective start time for a channel: sunrise when solar timing is enabled
/// and computable, otherwise the configured time.
pub fn effective_start(cfg: &ChannelConfig, now: &RtcTime) -> StartTime {
    if cfg.use_solar_timing {
        if let (Some(lat), Some(lon)) = (cfg.growing.latitude, cfg.growing.longitude) {
            if let Some(t) = sunrise_utc(lat as f64, lon as f64, now.julian_day()) {
                return t;
            }
        }
    }
    cfg.start
}

fn sin_d(deg: f64) -> f64 {
    deg.to_radians().sin()
}
fn cos_d(deg: f64) -> f64 {
    deg.to_radians().cos()
}
fn tan_d(deg: f64) -> f64 {
    deg.to_radians().tan()
}
fn atan_d(x: f64) -> f64 {
    x.atan().to_degrees()
}
fn acos_d(x: f64) -> f64 {
    x.acos().to_degrees()
}
fn norm_deg(deg: f64) -> f64 {
    ((deg % 360.0) + 360.0) % 360.0
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, GrowingEnv, SoilCoefficients};

    fn auto_cfg() -> ChannelConfig {
        let mut cfg = ChannelConfig::factory_default(0);
        cfg.growing = GrowingEnv {
            plant: Some(PlantKind::Grass),
            soil: Some(SoilKind::Loam),
            installed_unix: Some(1_700_000_000),
            area_m2: 10.0,
            ..GrowingEnv::default()
        };
        cfg
    }

    // -- reference model ----------------------------------------------------

    #[test]
    fn warm_dry_day_accumulates_deficit() {
        let d = ReferenceModel.daily_deficit_mm(&auto_cfg(), Some(25.0), 0.0);
        assert!(d > 1.0, "expected meaningful loss, got {d}");
    }

    #[test]
    fn cold_day_loses_nothing() {
        let d = ReferenceModel.daily_deficit_mm(&auto_cfg(), Some(2.0), 0.0);
        assert_eq!(d, 0.0);
    }

    #[test]
    fn rain_offsets_loss() {
        let cfg = auto_cfg();
        let dry = ReferenceModel.daily_deficit_mm(&cfg, Some(25.0), 0.0);
        let wet = ReferenceModel.daily_deficit_mm(&cfg, Some(25.0), 10.0);
        assert!(wet < dry);
        assert!(wet < 0.0, "heavy rain should push the deficit down");
    }

    #[test]
    fn decide_below_threshold_does_not_water() {
        let d = ReferenceModel.decide(&auto_cfg(), 5.0);
        assert!(!d.should_water);
        assert_eq!(d.volume_litres, 0.0);
        assert_eq!(d.current_deficit_mm, 5.0);
    }

    #[test]
    fn decide_at_threshold_waters_with_area_scaled_volume() {
        // Loam threshold is 15 mm; 16 mm over 10 m² is 160 litres.
        let d = ReferenceModel.decide(&auto_cfg(), 16.0);
        assert!(d.should_water);
        assert!((d.volume_litres - 160.0).abs() < 1e-3);
    }

    #[test]
    fn custom_soil_overrides_threshold() {
        let mut cfg = auto_cfg();
        cfg.growing.custom_soil = Some(SoilCoefficients {
            allowable_depletion_mm: 4.0,
            infiltration: 0.9,
        });
        assert!(ReferenceModel.decide(&cfg, 5.0).should_water);
    }

    // -- solar timing -------------------------------------------------------

    #[test]
    fn equator_sunrise_near_six_utc() {
        // Greenwich meridian on the equator: sunrise within 06:00 ± 40 min
        // all year round.
        let t = sunrise_utc(0.0, 0.0, 80).unwrap();
        let minutes = t.minute_of_day() as i32;
        assert!((minutes - 360).abs() <= 40, "sunrise at {minutes} min");
    }

    #[test]
    fn polar_night_returns_none() {
        // Deep arctic midwinter: no sunrise.
        assert!(sunrise_utc(85.0, 0.0, 355).is_none());
    }

    #[test]
    fn effective_start_falls_back_when_unavailable() {
        let mut cfg = auto_cfg();
        cfg.use_solar_timing = true;
        cfg.start = StartTime {
            hour: 7,
            minute: 30,
        };
        // No geolocation configured → configured time.
        let now = RtcTime::from_unix(1_709_251_200);
        assert_eq!(effective_start(&cfg, &now), cfg.start);

        // Polar night → configured time.
        cfg.growing.latitude = Some(85.0);
        cfg.growing.longitude = Some(0.0);
        let midwinter = RtcTime {
            year: 2024,
            month: 12,
            day: 21,
            hour: 12,
            minute: 0,
            second: 0,
            weekday: 6,
        };
        assert_eq!(effective_start(&cfg, &midwinter), cfg.start);
    }

    #[test]
    fn effective_start_uses_sunrise_when_available() {
        let mut cfg = auto_cfg();
        cfg.use_solar_timing = true;
        cfg.growing.latitude = Some(0.0);
        cfg.growing.longitude = Some(0.0);
        let now = RtcTime::from_unix(1_709_251_200);
        let start = effective_start(&cfg, &now);
        assert_ne!(start, cfg.start);
        assert!((start.minute_of_day() as i32 - 360).abs() <= 40);
    }
}
