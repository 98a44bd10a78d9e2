//! Clock & calendar: unifies RTC truth with a monotonic-tick fallback.
//!
//! The scheduler loop is the only caller of [`Clock::refresh`]; every other
//! component reads the cached civil time, which advances between refreshes
//! by monotonic elapsed time.  After [`MAX_RTC_ERRORS`] consecutive read
//! failures the clock degrades permanently to monotonic time for the rest
//! of the boot (one final recovery attempt is made at the threshold).

use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, Time};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Consecutive RTC read failures before the clock degrades.
pub const MAX_RTC_ERRORS: u8 = 5;

// ---------------------------------------------------------------------------
// Civil time snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    /// 1 = Monday .. 7 = Sunday.
    pub weekday: u8,
}

impl RtcTime {
    pub fn validate(&self) -> Result<()> {
        if self.month < 1
            || self.month > 12
            || self.day < 1
            || self.day > 31
            || self.hour > 23
            || self.minute > 59
            || self.second > 59
        {
            return Err(Error::InvalidParam("rtc fields out of range"));
        }
        // Reject impossible dates (Feb 30 etc.) via the calendar itself.
        self.to_unix().map(|_| ())
    }

    pub fn to_unix(&self) -> Result<i64> {
        let month =
            Month::try_from(self.month).map_err(|_| Error::InvalidParam("month out of range"))?;
        let date = Date::from_calendar_date(self.year as i32, month, self.day)
            .map_err(|_| Error::InvalidParam("invalid calendar date"))?;
        let tod = Time::from_hms(self.hour, self.minute, self.second)
            .map_err(|_| Error::InvalidParam("invalid time of day"))?;
        Ok(date.with_time(tod).assume_utc().unix_timestamp())
    }

    pub fn from_unix(unix: i64) -> Self {
        let dt = OffsetDateTime::from_unix_timestamp(unix)
            .unwrap_or(OffsetDateTime::UNIX_EPOCH);
        Self {
            year: dt.year() as u16,
            month: dt.month() as u8,
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
            weekday: dt.weekday().number_from_monday(),
        }
    }

    /// Day of year, 1..=366 (leap rule handled by the calendar).
    pub fn julian_day(&self) -> u16 {
        let month = Month::try_from(self.month).unwrap_or(Month::January);
        Date::from_calendar_date(self.year as i32, month, self.day)
            .map(|d| d.ordinal())
            .unwrap_or(1)
    }

    /// Weekday bit for `Schedule::Daily` masks (bit 0 = Monday).
    pub fn weekday_bit(&self) -> u8 {
        1 << (self.weekday.saturating_sub(1).min(6))
    }
}

// ---------------------------------------------------------------------------
// RTC driver interface
// ---------------------------------------------------------------------------

pub trait Rtc: Send + Sync {
    fn read(&self) -> Result<RtcTime>;
    fn set(&self, t: &RtcTime) -> Result<()>;
    /// Attempt to re-initialise the peripheral after a failed read.
    fn reinit(&self) -> Result<()> {
        Ok(())
    }
}

/// Host-clock RTC, used by simulation builds and development.
pub struct SystemRtc;

impl Rtc for SystemRtc {
    fn read(&self) -> Result<RtcTime> {
        let unix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|_| Error::RtcFailure)?
            .as_secs() as i64;
        Ok(RtcTime::from_unix(unix))
    }

    fn set(&self, _t: &RtcTime) -> Result<()> {
        // The host clock is not ours to set.
        Ok(())
    }
}

/// Settable RTC with injectable failure, for tests and bring-up benches.
pub struct ManualRtc {
    inner: std::sync::Mutex<ManualInner>,
}

struct ManualInner {
    unix: i64,
    fail: bool,
}

impl ManualRtc {
    pub fn new(unix: i64) -> Self {
        Self {
            inner: std::sync::Mutex::new(ManualInner { unix, fail: false }),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.inner.lock().unwrap().unix += secs;
    }

    pub fn set_unix(&self, unix: i64) {
        self.inner.lock().unwrap().unix = unix;
    }

    pub fn set_failing(&self, fail: bool) {
        self.inner.lock().unwrap().fail = fail;
    }
}

impl Rtc for std::sync::Arc<ManualRtc> {
    fn read(&self) -> Result<RtcTime> {
        self.as_ref().read()
    }
    fn set(&self, t: &RtcTime) -> Result<()> {
        self.as_ref().set(t)
    }
}

impl Rtc for ManualRtc {
    fn read(&self) -> Result<RtcTime> {
        let inner = self.inner.lock().unwrap();
        if inner.fail {
            return Err(Error::RtcFailure);
        }
        Ok(RtcTime::from_unix(inner.unix))
    }

    fn set(&self, t: &RtcTime) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail {
            return Err(Error::RtcFailure);
        }
        inner.unix = t.to_unix()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Outcome of a scheduler-tick refresh.
#[derive(Debug, Clone, Copy, Default)]
pub struct RefreshOutcome {
    /// The calendar day rolled over since the previous refresh.
    pub day_changed: bool,
    /// This refresh crossed the failure threshold into degraded mode.
    pub degraded_now: bool,
    /// The RTC answered this refresh.
    pub rtc_ok: bool,
}

pub struct Clock {
    rtc: Box<dyn Rtc>,
    inner: RwLock<ClockInner>,
}

struct ClockInner {
    /// Unix seconds at the last sync point.
    base_unix: i64,
    /// Monotonic instant of that sync point.
    synced_at: Instant,
    rtc_errors: u8,
    degraded: bool,
    days_since_start: u32,
    last_day: (u16, u16), // (year, julian)
}

impl Clock {
    pub fn new(rtc: Box<dyn Rtc>, days_since_start: u32) -> Self {
        let (base_unix, errors) = match rtc.read() {
            Ok(t) => (t.to_unix().unwrap_or(0), 0),
            Err(_) => {
                warn!("initial RTC read failed, starting from epoch until it recovers");
                (0, 1)
            }
        };
        let now = RtcTime::from_unix(base_unix);
        Self {
            rtc,
            inner: RwLock::new(ClockInner {
                base_unix,
                synced_at: Instant::now(),
                rtc_errors: errors,
                degraded: false,
                days_since_start,
                last_day: (now.year, now.julian_day()),
            }),
        }
    }

    /// Current UTC seconds: last sync plus monotonic elapsed.
    pub fn now_unix(&self) -> i64 {
        let inner = self.inner.read().unwrap();
        inner.base_unix + inner.synced_at.elapsed().as_secs() as i64
    }

    pub fn now(&self) -> RtcTime {
        RtcTime::from_unix(self.now_unix())
    }

    pub fn julian_day(&self) -> u16 {
        self.now().julian_day()
    }

    pub fn days_since_start(&self) -> u32 {
        self.inner.read().unwrap().days_since_start
    }

    pub fn degraded(&self) -> bool {
        self.inner.read().unwrap().degraded
    }

    pub fn rtc_errors(&self) -> u8 {
        self.inner.read().unwrap().rtc_errors
    }

    /// Scheduler-tick refresh: sync from the RTC when it answers, otherwise
    /// count the failure and keep advancing on monotonic time.  Detects
    /// calendar-day rollovers either way.
    pub fn refresh(&self) -> RefreshOutcome {
        let mut inner = self.inner.write().unwrap();
        let mut outcome = RefreshOutcome::default();

        if !inner.degraded {
            match self.rtc.read() {
                Ok(t) => {
                    if inner.rtc_errors > 0 {
                        info!(errors = inner.rtc_errors, "rtc recovered");
                    }
                    inner.rtc_errors = 0;
                    inner.base_unix = t.to_unix().unwrap_or(inner.base_unix);
                    inner.synced_at = Instant::now();
                    outcome.rtc_ok = true;
                }
                Err(_) => {
                    inner.rtc_errors = inner.rtc_errors.saturating_add(1);
                    warn!(errors = inner.rtc_errors, "rtc read failed");
                    let _ = self.rtc.reinit();
                    if inner.rtc_errors >= MAX_RTC_ERRORS {
                        // One last recovery attempt before giving up on the
                        // peripheral for this boot.
                        if let Ok(t) = self.rtc.read() {
                            info!("rtc recovered on final attempt");
                            inner.rtc_errors = 0;
                            inner.base_unix = t.to_unix().unwrap_or(inner.base_unix);
                            inner.synced_at = Instant::now();
                            outcome.rtc_ok = true;
                        } else {
                            warn!("rtc degraded, falling back to monotonic time");
                            inner.degraded = true;
                            outcome.degraded_now = true;
                        }
                    }
                }
            }
        }

        // Monotonic carry: fold elapsed time into the base so day rollover
        // detection works with or without an answering RTC.
        let elapsed = inner.synced_at.elapsed().as_secs() as i64;
        if elapsed > 0 {
            inner.base_unix += elapsed;
            inner.synced_at = Instant::now();
        }

        let now = RtcTime::from_unix(inner.base_unix);
        let day = (now.year, now.julian_day());
        if day != inner.last_day {
            inner.last_day = day;
            inner.days_since_start = inner.days_since_start.saturating_add(1);
            outcome.day_changed = true;
        }

        outcome
    }

    /// Set the RTC and resync the cache.  Used by the Rtc record write.
    pub fn set_time(&self, t: &RtcTime) -> Result<()> {
        t.validate()?;
        self.rtc.set(t)?;
        let mut inner = self.inner.write().unwrap();
        inner.base_unix = t.to_unix()?;
        inner.synced_at = Instant::now();
        inner.last_day = (t.year, t.julian_day());
        Ok(())
    }

    /// Restore the persisted boot-day counter.
    pub fn set_days_since_start(&self, days: u32) {
        self.inner.write().unwrap().days_since_start = days;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
