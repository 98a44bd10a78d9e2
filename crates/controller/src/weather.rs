//! Environmental inputs: the temperature/humidity/pressure sensor behind a
//! driver trait with a cached last reading, and the rain-pulse gauge with a
//! windowed rainfall query backing rain compensation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::warn;

// ---------------------------------------------------------------------------
// Environmental sensor
// ---------------------------------------------------------------------------

/// Driver-level sensor failure.  `NoDevice`/`Busy` make the freeze guard
/// fail open; `Failed` counts as a stale reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    NoDevice,
    Busy,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherReading {
    pub temp_c: f32,
    pub humidity_pct: f32,
    pub pressure_hpa: f32,
}

pub trait EnvSensor: Send + Sync {
    fn sample(&self) -> Result<WeatherReading, SensorError>;
}

/// Settable sensor for tests and boards without the environmental module.
pub struct ManualEnv {
    inner: Mutex<Result<WeatherReading, SensorError>>,
}

impl ManualEnv {
    pub fn new(temp_c: f32) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Ok(WeatherReading {
                temp_c,
                humidity_pct: 50.0,
                pressure_hpa: 1013.0,
            })),
        })
    }

    pub fn set_temp(&self, temp_c: f32) {
        let mut inner = self.inner.lock().unwrap();
        match &mut *inner {
            Ok(r) => r.temp_c = temp_c,
            Err(_) => {
                *inner = Ok(WeatherReading {
                    temp_c,
                    humidity_pct: 50.0,
                    pressure_hpa: 1013.0,
                })
            }
        }
    }

    pub fn set_error(&self, e: SensorError) {
        *self.inner.lock().unwrap() = Err(e);
    }
}

impl EnvSensor for ManualEnv {
    fn sample(&self) -> Result<WeatherReading, SensorError> {
        *self.inner.lock().unwrap()
    }
}

impl EnvSensor for Arc<ManualEnv> {
    fn sample(&self) -> Result<WeatherReading, SensorError> {
        self.as_ref().sample()
    }
}

/// Cached view over the sensor.  Consumers read the cache; the safety layer
/// triggers at most one on-demand refresh when the cache is stale.
pub struct Weather {
    sensor: Box<dyn EnvSensor>,
    cache: RwLock<Option<(WeatherReading, Instant)>>,
}

impl Weather {
    pub fn new(sensor: Box<dyn EnvSensor>) -> Self {
        Self {
            sensor,
            cache: RwLock::new(None),
        }
    }

    /// Sample the sensor and update the cache on success.
    pub fn refresh(&self) -> Result<WeatherReading, SensorError> {
        match self.sensor.sample() {
            Ok(r) => {
                *self.cache.write().unwrap() = Some((r, Instant::now()));
                Ok(r)
            }
            Err(e) => {
                warn!(?e, "environmental sensor read failed");
                Err(e)
            }
        }
    }

    /// Last successful reading and its age.
    pub fn cached(&self) -> Option<(WeatherReading, Duration)> {
        self.cache
            .read()
            .unwrap()
            .map(|(r, at)| (r, at.elapsed()))
    }
}

// ---------------------------------------------------------------------------
// Rain gauge
// ---------------------------------------------------------------------------

/// One drained batch of tipping-bucket pulses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RainSample {
    pub unix: i64,
    pub tips: u32,
}

/// Retention bound for the in-memory rain history.
const MAX_RAIN_SAMPLES: usize = 2048;

/// Tipping-bucket rain sensor.  The ISR increments the tip counter; the
/// scheduler drains it into timestamped samples once per tick.
pub struct RainGauge {
    tips: Arc<AtomicU32>,
    mm_per_tip: f32,
    inner: Mutex<RainInner>,
}

struct RainInner {
    drained: u32,
    history: VecDeque<RainSample>,
}

impl RainGauge {
    pub fn new(mm_per_tip: f32) -> Self {
        Self {
            tips: Arc::new(AtomicU32::new(0)),
            mm_per_tip,
            inner: Mutex::new(RainInner {
                drained: 0,
                history: VecDeque::new(),
            }),
        }
    }

    /// The raw tip counter, for the ISR / simulator to increment.
    pub fn tip_input(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.tips)
    }

    pub fn add_tips(&self, n: u32) {
        self.tips.fetch_add(n, Ordering::Relaxed);
    }

    /// Drain new tips into the history under the given timestamp.
    pub fn sample(&self, now_unix: i64) {
        let total = self.tips.load(Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap();
        let delta = total.wrapping_sub(inner.drained);
        if delta == 0 {
            return;
        }
        inner.drained = total;
        inner.history.push_back(RainSample {
            unix: now_unix,
            tips: delta,
        });
        while inner.history.len() > MAX_RAIN_SAMPLES {
            inner.history.pop_front();
        }
    }

    /// Rainfall in millimetres over the trailing window.
    pub fn rainfall_mm(&self, window_secs: i64, now_unix: i64) -> f32 {
        let cutoff = now_unix - window_secs;
        let inner = self.inner.lock().unwrap();
        let tips: u32 = inner
            .history
            .iter()
            .filter(|s| s.unix >= cutoff)
            .map(|s| s.tips)
            .sum();
        tips as f32 * self.mm_per_tip
    }

    /// Snapshot for persistence (the rain-history blob).
    pub fn history(&self) -> Vec<RainSample> {
        self.inner.lock().unwrap().history.iter().copied().collect()
    }

    /// Restore a persisted history blob at boot.
    pub fn restore(&self, samples: Vec<RainSample>) {
        let mut inner = self.inner.lock().unwrap();
        inner.history = samples.into_iter().collect();
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.history.clear();
        inner.drained = self.tips.load(Ordering::Relaxed);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Weather cache ------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn refresh_populates_cache_with_age() {
        let env = ManualEnv::new(21.5);
        let w = Weather::new(Box::new(env));
        assert!(w.cached().is_none());

        w.refresh().unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        let (reading, age) = w.cached().unwrap();
        assert_eq!(reading.temp_c, 21.5);
        assert_eq!(age.as_secs(), 30);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_cache() {
        let env = ManualEnv::new(18.0);
        let w = Weather::new(Box::new(Arc::clone(&env)));
        w.refresh().unwrap();

        env.set_error(SensorError::Busy);
        assert_eq!(w.refresh(), Err(SensorError::Busy));
        assert_eq!(w.cached().unwrap().0.temp_c, 18.0);
    }

    // -- Rain gauge ---------------------------------------------------------

    #[test]
    fn rainfall_counts_only_inside_window() {
        let g = RainGauge::new(0.2);
        g.add_tips(10);
        g.sample(1000);
        g.add_tips(5);
        g.sample(5000);

        // Window covering both samples.
        assert!((g.rainfall_mm(10_000, 5000) - 3.0).abs() < 1e-6);
        // Window covering only the second.
        assert!((g.rainfall_mm(1000, 5000) - 1.0).abs() < 1e-6);
        // Window covering neither.
        assert_eq!(g.rainfall_mm(10, 50_000), 0.0);
    }

    #[test]
    fn sample_without_new_tips_adds_nothing() {
        let g = RainGauge::new(0.2);
        g.sample(100);
        g.sample(200);
        assert!(g.history().is_empty());
    }

    #[test]
    fn clear_discards_history_and_pending_delta() {
        let g = RainGauge::new(0.5);
        g.add_tips(4);
        g.sample(100);
        g.add_tips(4);
        g.clear();
        // The un-drained tips must not reappear on the next sample.
        g.sample(200);
        assert!(g.history().is_empty());
        assert_eq!(g.rainfall_mm(1_000_000, 300), 0.0);
    }

    #[test]
    fn restore_roundtrips_history() {
        let g = RainGauge::new(0.2);
        g.add_tips(7);
        g.sample(42);
        let blob = g.history();

        let g2 = RainGauge::new(0.2);
        g2.restore(blob);
        assert!((g2.rainfall_mm(1_000, 42) - 1.4).abs() < 1e-6);
    }

    #[test]
    fn history_is_bounded() {
        let g = RainGauge::new(0.1);
        for i in 0..(MAX_RAIN_SAMPLES as i64 + 100) {
            g.add_tips(1);
            g.sample(i);
        }
        assert_eq!(g.history().len(), MAX_RAIN_SAMPLES);
    }
}
