//! Packed byte layouts for the wireless attribute surface.  Every record is
//! a stable little-endian layout; encode/decode here, transport elsewhere.
//! Decode rejects short or out-of-range payloads with `InvalidParam` and
//! never touches core state.

use crate::channel::{ChannelConfig, IntervalConfig, Schedule, StartTime, MAX_NAME_BYTES};
use crate::clock::RtcTime;
use crate::core::{Diagnostics, SystemStatus};
use crate::error::{Error, Result};
use crate::task::{Trigger, WaterTarget};
use crate::wipe::WipeState;

/// `active_channel` wire value for "none".
pub const NO_CHANNEL: u8 = 0xFF;

fn need(payload: &[u8], len: usize) -> Result<()> {
    if payload.len() < len {
        return Err(Error::InvalidParam("payload too short"));
    }
    Ok(())
}

fn u16_le(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn u32_le(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn target_wire(target: WaterTarget) -> (u8, u16) {
    match target {
        WaterTarget::Duration { minutes } => (0, minutes),
        WaterTarget::Volume { litres } => (1, litres),
    }
}

fn target_from_wire(kind: u8, value: u16) -> Result<WaterTarget> {
    let target = match kind {
        0 => WaterTarget::Duration { minutes: value },
        1 => WaterTarget::Volume { litres: value },
        _ => return Err(Error::InvalidParam("unknown task type")),
    };
    target.validate()?;
    Ok(target)
}

pub fn trigger_wire(t: Trigger) -> u8 {
    match t {
        Trigger::Manual => 0,
        Trigger::Scheduled => 1,
        Trigger::RainAdjusted => 2,
        Trigger::AutoDeficit => 3,
    }
}

// ---------------------------------------------------------------------------
// TaskCreate (write): the only actuation path
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskCreate {
    pub channel: u8,
    pub target: WaterTarget,
}

impl TaskCreate {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        need(payload, 4)?;
        Ok(Self {
            channel: payload[0],
            target: target_from_wire(payload[1], u16_le(payload, 2))?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let (kind, value) = target_wire(self.target);
        let mut out = vec![self.channel, kind];
        out.extend_from_slice(&value.to_le_bytes());
        out
    }
}

// ---------------------------------------------------------------------------
// ValveStatus / FlowPulses / SystemStatus (notify)
// ---------------------------------------------------------------------------

pub fn encode_valve_status(channel: u8, open: bool) -> Vec<u8> {
    vec![channel, open as u8]
}

pub fn encode_flow_pulses(pulses: u32) -> Vec<u8> {
    pulses.to_le_bytes().to_vec()
}

pub fn encode_system_status(status: SystemStatus) -> Vec<u8> {
    vec![status as u8]
}

// ---------------------------------------------------------------------------
// ChannelConfig (read/notify; fragmented write)
// ---------------------------------------------------------------------------

pub fn encode_channel_config(channel: u8, cfg: &ChannelConfig) -> Vec<u8> {
    let name = cfg.name.as_bytes();
    let mut out = vec![channel, cfg.auto_enabled as u8, name.len() as u8];
    out.extend_from_slice(name);
    out
}

/// Reassembly buffer for fragmented name writes: the first fragment carries
/// `{channel, total_len}`, subsequent fragments `{channel, offset, bytes…}`.
#[derive(Default)]
pub struct NameWriteBuffer {
    channel: u8,
    total: usize,
    buf: Vec<u8>,
    active: bool,
}

impl NameWriteBuffer {
    pub fn begin(&mut self, channel: u8, total: usize) -> Result<()> {
        if total > MAX_NAME_BYTES {
            return Err(Error::InvalidParam("name exceeds 63 bytes"));
        }
        self.channel = channel;
        self.total = total;
        self.buf = vec![0; total];
        self.active = true;
        Ok(())
    }

    /// Feed one fragment.  Returns the completed `(channel, name)` once all
    /// bytes have arrived.
    pub fn push(&mut self, channel: u8, offset: usize, bytes: &[u8]) -> Result<Option<(u8, String)>> {
        if !self.active || channel != self.channel {
            return Err(Error::InvalidParam("fragment without a matching begin"));
        }
        if offset + bytes.len() > self.total {
            self.active = false;
            return Err(Error::InvalidParam("fragment past declared length"));
        }
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);

        // Completion is detected by the final fragment touching the end.
        if offset + bytes.len() == self.total {
            self.active = false;
            let name = String::from_utf8(std::mem::take(&mut self.buf))
                .map_err(|_| Error::InvalidParam("name is not valid UTF-8"))?;
            return Ok(Some((self.channel, name)));
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Schedule (read/write/notify)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleRecord {
    pub channel: u8,
    pub schedule: Schedule,
    pub start: StartTime,
    pub target: WaterTarget,
}

impl ScheduleRecord {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        need(payload, 8)?;
        let schedule = match payload[1] {
            0 => Schedule::Daily {
                days_mask: payload[2],
            },
            1 => {
                if payload[2] == 0 {
                    return Err(Error::InvalidParam("interval_days must be >= 1"));
                }
                Schedule::Periodic {
                    interval_days: payload[2] as u16,
                }
            }
            2 => Schedule::Auto,
            _ => return Err(Error::InvalidParam("unknown schedule type")),
        };
        let start = StartTime {
            hour: payload[3],
            minute: payload[4],
        };
        start.validate()?;
        Ok(Self {
            channel: payload[0],
            schedule,
            start,
            target: target_from_wire(payload[5], u16_le(payload, 6))?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let (kind, days) = match self.schedule {
            Schedule::Daily { days_mask } => (0u8, days_mask),
            Schedule::Periodic { interval_days } => (1, interval_days.min(255) as u8),
            Schedule::Auto => (2, 0),
        };
        let (mode, value) = target_wire(self.target);
        let mut out = vec![
            self.channel,
            kind,
            days,
            self.start.hour,
            self.start.minute,
            mode,
        ];
        out.extend_from_slice(&value.to_le_bytes());
        out
    }
}

// ---------------------------------------------------------------------------
// SystemConfig (read/write/notify)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemConfigRecord {
    pub power_mode: u8,
    pub pulses_per_litre: u16,
    /// Read-only on the wire.
    pub max_active_valves: u8,
    /// Read-only on the wire.
    pub num_channels: u8,
}

impl SystemConfigRecord {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        need(payload, 3)?;
        if payload[0] > 2 {
            return Err(Error::InvalidParam("unknown power mode"));
        }
        let ppl = u16_le(payload, 1);
        if ppl == 0 {
            return Err(Error::InvalidParam("pulses_per_litre must be >= 1"));
        }
        Ok(Self {
            power_mode: payload[0],
            pulses_per_litre: ppl,
            max_active_valves: 1,
            num_channels: crate::channel::CHANNEL_COUNT as u8,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.power_mode];
        out.extend_from_slice(&self.pulses_per_litre.to_le_bytes());
        out.push(self.max_active_valves);
        out.push(self.num_channels);
        out
    }
}

// ---------------------------------------------------------------------------
// TaskQueue (read/notify; write = command)
// ---------------------------------------------------------------------------

pub const QUEUE_CMD_CANCEL_CURRENT: u8 = 1;
pub const QUEUE_CMD_CLEAR_QUEUE: u8 = 2;
pub const QUEUE_CMD_CLEAR_ERRORS: u8 = 4;

pub fn encode_task_queue(pending: u8, active: Option<(u8, WaterTarget)>) -> Vec<u8> {
    let (channel, kind, value) = match active {
        Some((ch, target)) => {
            let (kind, value) = target_wire(target);
            (ch, kind, value)
        }
        None => (NO_CHANNEL, 0, 0),
    };
    let mut out = vec![pending, channel, kind];
    out.extend_from_slice(&value.to_le_bytes());
    out.push(0); // command slot reads back as zero
    out
}

pub fn decode_queue_command(payload: &[u8]) -> Result<u8> {
    need(payload, 1)?;
    match payload[0] {
        QUEUE_CMD_CANCEL_CURRENT | QUEUE_CMD_CLEAR_QUEUE | QUEUE_CMD_CLEAR_ERRORS => {
            Ok(payload[0])
        }
        _ => Err(Error::InvalidParam("unknown queue command")),
    }
}

// ---------------------------------------------------------------------------
// Statistics (read/notify)
// ---------------------------------------------------------------------------

pub fn encode_statistics(channel: u8, totals: &crate::channel::ChannelTotals) -> Vec<u8> {
    let mut out = vec![channel];
    out.extend_from_slice(&totals.runs.to_le_bytes());
    out.extend_from_slice(&(totals.open_secs.min(u32::MAX as u64) as u32).to_le_bytes());
    out.extend_from_slice(&(totals.millilitres.min(u32::MAX as u64) as u32).to_le_bytes());
    out
}

// ---------------------------------------------------------------------------
// Rtc (read/write/notify)
// ---------------------------------------------------------------------------

pub fn encode_rtc(t: &RtcTime) -> Vec<u8> {
    vec![
        (t.year.saturating_sub(2000)) as u8,
        t.month,
        t.day,
        t.hour,
        t.minute,
        t.second,
        t.weekday,
    ]
}

pub fn decode_rtc(payload: &[u8]) -> Result<RtcTime> {
    need(payload, 7)?;
    let t = RtcTime {
        year: 2000 + payload[0] as u16,
        month: payload[1],
        day: payload[2],
        hour: payload[3],
        minute: payload[4],
        second: payload[5],
        weekday: payload[6],
    };
    t.validate()?;
    Ok(t)
}

// ---------------------------------------------------------------------------
// Alarm (notify)
// ---------------------------------------------------------------------------

pub fn encode_alarm(code: u8, data: u16, timestamp: u32) -> Vec<u8> {
    let mut out = vec![code];
    out.extend_from_slice(&data.to_le_bytes());
    out.extend_from_slice(&timestamp.to_le_bytes());
    out
}

// ---------------------------------------------------------------------------
// Calibration (read/write/notify)
// ---------------------------------------------------------------------------

pub const CAL_ACTION_STOP: u8 = 0;
pub const CAL_ACTION_START: u8 = 1;
pub const CAL_ACTION_IN_PROGRESS: u8 = 2;
pub const CAL_ACTION_DONE: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationRecord {
    pub action: u8,
    pub pulses: u32,
    pub volume_ml: u32,
    pub pulses_per_litre: u16,
}

impl CalibrationRecord {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        need(payload, 11)?;
        if payload[0] > CAL_ACTION_DONE {
            return Err(Error::InvalidParam("unknown calibration action"));
        }
        Ok(Self {
            action: payload[0],
            pulses: u32_le(payload, 1),
            volume_ml: u32_le(payload, 5),
            pulses_per_litre: u16_le(payload, 9),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.action];
        out.extend_from_slice(&self.pulses.to_le_bytes());
        out.extend_from_slice(&self.volume_ml.to_le_bytes());
        out.extend_from_slice(&self.pulses_per_litre.to_le_bytes());
        out
    }
}

// ---------------------------------------------------------------------------
// History (entry-indexed read)
// ---------------------------------------------------------------------------

pub fn decode_history_request(payload: &[u8]) -> Result<u16> {
    need(payload, 2)?;
    Ok(u16_le(payload, 0))
}

pub fn encode_history_entry(index: u16, ev: &crate::store::WateringEvent) -> Vec<u8> {
    let result = match ev.result.as_str() {
        "complete" => 0u8,
        "start" => 2,
        _ => 1, // any abort
    };
    let trigger = match ev.trigger.as_str() {
        "manual" => 0u8,
        "scheduled" => 1,
        "rain_adjusted" => 2,
        _ => 3,
    };
    let mut out = Vec::with_capacity(15);
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&(ev.ts_start.max(0) as u32).to_le_bytes());
    out.extend_from_slice(&(ev.effective_secs.clamp(0, u16::MAX as i64) as u16).to_le_bytes());
    out.push(ev.channel);
    out.push(trigger);
    out.push(result);
    out.extend_from_slice(&(ev.delivered_ml.clamp(0, u32::MAX as i64) as u32).to_le_bytes());
    out
}

// ---------------------------------------------------------------------------
// Diagnostics (read/notify)
// ---------------------------------------------------------------------------

pub fn encode_diagnostics(d: &Diagnostics) -> Vec<u8> {
    let mut out = Vec::with_capacity(9);
    out.extend_from_slice(&d.uptime_min.to_le_bytes());
    out.extend_from_slice(&d.error_count.to_le_bytes());
    out.push(d.last_error);
    out.push(d.valve_bitmap);
    out.push(d.battery);
    out
}

// ---------------------------------------------------------------------------
// IntervalConfig (read/write/notify)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalConfigRecord {
    pub channel: u8,
    pub enabled: bool,
    pub interval: IntervalConfig,
}

impl IntervalConfigRecord {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        need(payload, 6)?;
        if payload[3] > 59 || payload[5] > 59 {
            return Err(Error::InvalidParam("seconds field out of range"));
        }
        let interval = IntervalConfig {
            watering_s: payload[2] as u32 * 60 + payload[3] as u32,
            pause_s: payload[4] as u32 * 60 + payload[5] as u32,
        };
        Ok(Self {
            channel: payload[0],
            enabled: payload[1] != 0,
            interval,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        vec![
            self.channel,
            self.enabled as u8,
            (self.interval.watering_s / 60).min(255) as u8,
            (self.interval.watering_s % 60) as u8,
            (self.interval.pause_s / 60).min(255) as u8,
            (self.interval.pause_s % 60) as u8,
        ]
    }
}

// ---------------------------------------------------------------------------
// IntervalStatus (read/notify)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntervalStatusRecord {
    pub channel: u8,
    pub is_active: bool,
    /// 0 = idle, 1 = watering, 2 = pausing.
    pub state: u8,
    pub currently_watering: bool,
    pub phase_remaining_s: u16,
    pub cycles_completed: u8,
    pub progress_pct: u8,
    pub cycles_remaining: u8,
    pub next_phase_in_s: u32,
    pub estimated_completion_s: u32,
}

impl IntervalStatusRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![
            self.channel,
            self.is_active as u8,
            self.state,
            self.currently_watering as u8,
        ];
        out.extend_from_slice(&self.phase_remaining_s.to_le_bytes());
        out.push(self.cycles_completed);
        out.push(self.progress_pct);
        out.push(self.cycles_remaining);
        out.extend_from_slice(&self.next_phase_in_s.to_le_bytes());
        out.extend_from_slice(&self.estimated_completion_s.to_le_bytes());
        out
    }
}

// ---------------------------------------------------------------------------
// ResetControl (read/write/notify) + WipeProgress (notify)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetControlRecord {
    pub reset_type: u8,
    pub channel: u8,
    pub code: u32,
}

impl ResetControlRecord {
    pub fn decode(payload: &[u8]) -> Result<Self> {
        need(payload, 6)?;
        Ok(Self {
            reset_type: payload[0],
            channel: payload[1],
            code: u32_le(payload, 2),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.reset_type, self.channel];
        out.extend_from_slice(&self.code.to_le_bytes());
        out
    }
}

pub fn encode_wipe_progress(state: WipeState, step: u8, percent: u8, last_error: u8) -> Vec<u8> {
    vec![state.wire(), step, percent, last_error]
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- TaskCreate ---------------------------------------------------------

    #[test]
    fn task_create_roundtrip() {
        let rec = TaskCreate {
            channel: 3,
            target: WaterTarget::Volume { litres: 12 },
        };
        assert_eq!(TaskCreate::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn task_create_rejects_short_payload() {
        assert!(TaskCreate::decode(&[1, 0, 5]).is_err());
    }

    #[test]
    fn task_create_rejects_zero_value() {
        assert!(TaskCreate::decode(&[0, 0, 0, 0]).is_err());
    }

    #[test]
    fn task_create_rejects_unknown_type() {
        assert!(TaskCreate::decode(&[0, 2, 5, 0]).is_err());
    }

    // -- fragmented name write ---------------------------------------------

    #[test]
    fn fragmented_name_write_reassembles() {
        let mut buf = NameWriteBuffer::default();
        buf.begin(2, 10).unwrap();
        assert_eq!(buf.push(2, 0, b"Front").unwrap(), None);
        let (ch, name) = buf.push(2, 5, b" lawn").unwrap().unwrap();
        assert_eq!(ch, 2);
        assert_eq!(name, "Front lawn");
    }

    #[test]
    fn fragment_for_wrong_channel_rejected() {
        let mut buf = NameWriteBuffer::default();
        buf.begin(2, 5).unwrap();
        assert!(buf.push(3, 0, b"abc").is_err());
    }

    #[test]
    fn fragment_past_length_rejected() {
        let mut buf = NameWriteBuffer::default();
        buf.begin(0, 4).unwrap();
        assert!(buf.push(0, 2, b"abc").is_err());
    }

    #[test]
    fn oversized_name_rejected_at_begin() {
        let mut buf = NameWriteBuffer::default();
        assert!(buf.begin(0, 64).is_err());
    }

    #[test]
    fn channel_config_encode_carries_name_bytes() {
        let mut cfg = ChannelConfig::factory_default(0);
        cfg.name = "Rosé bed".into();
        let bytes = encode_channel_config(5, &cfg);
        assert_eq!(bytes[0], 5);
        assert_eq!(bytes[2] as usize, cfg.name.len());
        assert_eq!(&bytes[3..], cfg.name.as_bytes());
    }

    // -- Schedule -----------------------------------------------------------

    #[test]
    fn schedule_roundtrip_daily() {
        let rec = ScheduleRecord {
            channel: 1,
            schedule: Schedule::Daily { days_mask: 0b101_0101 },
            start: StartTime {
                hour: 7,
                minute: 30,
            },
            target: WaterTarget::Duration { minutes: 15 },
        };
        assert_eq!(ScheduleRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn schedule_roundtrip_periodic_and_auto() {
        for schedule in [Schedule::Periodic { interval_days: 3 }, Schedule::Auto] {
            let rec = ScheduleRecord {
                channel: 0,
                schedule,
                start: StartTime {
                    hour: 22,
                    minute: 5,
                },
                target: WaterTarget::Volume { litres: 8 },
            };
            assert_eq!(ScheduleRecord::decode(&rec.encode()).unwrap(), rec);
        }
    }

    #[test]
    fn schedule_rejects_bad_time_and_interval() {
        // hour 24
        assert!(ScheduleRecord::decode(&[0, 0, 1, 24, 0, 0, 5, 0]).is_err());
        // periodic with 0 days
        assert!(ScheduleRecord::decode(&[0, 1, 0, 6, 0, 0, 5, 0]).is_err());
    }

    // -- SystemConfig -------------------------------------------------------

    #[test]
    fn system_config_roundtrip_keeps_readonly_fields() {
        let rec = SystemConfigRecord {
            power_mode: 1,
            pulses_per_litre: 750,
            max_active_valves: 1,
            num_channels: 8,
        };
        let decoded = SystemConfigRecord::decode(&rec.encode()).unwrap();
        assert_eq!(decoded, rec);
        assert_eq!(decoded.max_active_valves, 1);
        assert_eq!(decoded.num_channels, 8);
    }

    #[test]
    fn system_config_rejects_zero_calibration() {
        assert!(SystemConfigRecord::decode(&[0, 0, 0]).is_err());
    }

    // -- TaskQueue ----------------------------------------------------------

    #[test]
    fn task_queue_encoding_idle() {
        let bytes = encode_task_queue(0, None);
        assert_eq!(bytes, vec![0, NO_CHANNEL, 0, 0, 0, 0]);
    }

    #[test]
    fn task_queue_encoding_active() {
        let bytes = encode_task_queue(2, Some((4, WaterTarget::Volume { litres: 3 })));
        assert_eq!(bytes[0], 2);
        assert_eq!(bytes[1], 4);
        assert_eq!(bytes[2], 1);
        assert_eq!(u16_le(&bytes, 3), 3);
    }

    #[test]
    fn queue_commands_validated() {
        assert_eq!(decode_queue_command(&[1]).unwrap(), 1);
        assert_eq!(decode_queue_command(&[4]).unwrap(), 4);
        assert!(decode_queue_command(&[3]).is_err());
        assert!(decode_queue_command(&[]).is_err());
    }

    // -- Rtc ----------------------------------------------------------------

    #[test]
    fn rtc_roundtrip() {
        let t = RtcTime {
            year: 2024,
            month: 3,
            day: 4,
            hour: 7,
            minute: 30,
            second: 12,
            weekday: 1,
        };
        assert_eq!(decode_rtc(&encode_rtc(&t)).unwrap(), t);
    }

    #[test]
    fn rtc_rejects_invalid_fields() {
        // month 13
        assert!(decode_rtc(&[24, 13, 1, 0, 0, 0, 1]).is_err());
        // Feb 30
        assert!(decode_rtc(&[24, 2, 30, 0, 0, 0, 1]).is_err());
        // hour 24
        assert!(decode_rtc(&[24, 1, 1, 24, 0, 0, 1]).is_err());
    }

    // -- Calibration --------------------------------------------------------

    #[test]
    fn calibration_roundtrip() {
        let rec = CalibrationRecord {
            action: CAL_ACTION_DONE,
            pulses: 1500,
            volume_ml: 2000,
            pulses_per_litre: 750,
        };
        assert_eq!(CalibrationRecord::decode(&rec.encode()).unwrap(), rec);
    }

    // -- History ------------------------------------------------------------

    #[test]
    fn history_entry_layout() {
        let ev = crate::store::WateringEvent {
            ts_start: 1_700_000_000,
            ts_end: 1_700_000_120,
            channel: 2,
            trigger: "scheduled".into(),
            result: "complete".into(),
            effective_secs: 120,
            delivered_ml: 2000,
        };
        let bytes = encode_history_entry(7, &ev);
        assert_eq!(bytes.len(), 15);
        assert_eq!(u16_le(&bytes, 0), 7);
        assert_eq!(u32_le(&bytes, 2), 1_700_000_000);
        assert_eq!(u16_le(&bytes, 6), 120);
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[9], 1); // scheduled
        assert_eq!(bytes[10], 0); // complete
        assert_eq!(u32_le(&bytes, 11), 2000);
    }

    // -- IntervalConfig -----------------------------------------------------

    #[test]
    fn interval_config_roundtrip() {
        let rec = IntervalConfigRecord {
            channel: 6,
            enabled: true,
            interval: IntervalConfig {
                watering_s: 90,
                pause_s: 150,
            },
        };
        assert_eq!(IntervalConfigRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn interval_config_rejects_bad_seconds() {
        assert!(IntervalConfigRecord::decode(&[0, 1, 1, 60, 2, 0]).is_err());
    }

    // -- ResetControl / WipeProgress ----------------------------------------

    #[test]
    fn reset_control_roundtrip() {
        let rec = ResetControlRecord {
            reset_type: 0,
            channel: 0,
            code: 0xDEAD_BEEF,
        };
        assert_eq!(ResetControlRecord::decode(&rec.encode()).unwrap(), rec);
    }

    #[test]
    fn wipe_progress_layout() {
        assert_eq!(
            encode_wipe_progress(WipeState::InProgress, 4, 44, 0),
            vec![2, 4, 44, 0]
        );
    }

    // -- misc ---------------------------------------------------------------

    #[test]
    fn alarm_layout() {
        let bytes = encode_alarm(3, 41, 1_700_000_000);
        assert_eq!(bytes[0], 3);
        assert_eq!(u16_le(&bytes, 1), 41);
        assert_eq!(u32_le(&bytes, 3), 1_700_000_000);
    }

    #[test]
    fn trigger_wire_values_stable() {
        assert_eq!(trigger_wire(Trigger::Manual), 0);
        assert_eq!(trigger_wire(Trigger::AutoDeficit), 3);
    }
}
