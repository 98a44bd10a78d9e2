//! Wireless surface adapter: a thin MQTT translation between the packed
//! records of `records.rs` and the core API.  Writes arrive on
//! `ctrl/<record>/set`; notifies are published on `ctrl/<record>` from the
//! core event bus.  The adapter never reaches into core state directly and
//! the only actuation path it offers is the TaskCreate record; there is no
//! raw open/close write.
//!
//! When the surface is disabled by configuration, `run` returns cleanly and
//! every core notification is simply dropped.

use std::sync::Arc;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio::time::Duration;
use tracing::{info, warn};

use crate::core::Core;
use crate::error::{Error, Result};
use crate::events::CoreEvent;
use crate::records::{self, NameWriteBuffer};
use crate::task::Trigger;
use crate::wipe::ResetType;

/// Sub-operations of the ChannelConfig write record.
const CHCFG_OP_AUTO_ENABLED: u8 = 0;
const CHCFG_OP_NAME_BEGIN: u8 = 1;
const CHCFG_OP_NAME_FRAGMENT: u8 = 2;

/// Per-connection write state: the name reassembly buffer and an open
/// calibration session.
#[derive(Default)]
pub(crate) struct SurfaceSession {
    name_buf: NameWriteBuffer,
    cal_base: Option<u32>,
}

/// Extract the record name from "ctrl/<record>/set".
pub(crate) fn extract_record(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "ctrl" && parts[2] == "set" {
        Some(parts[1])
    } else {
        None
    }
}

async fn maybe_publish(client: Option<&AsyncClient>, record: &str, payload: Vec<u8>) {
    if let Some(client) = client {
        let topic = format!("ctrl/{record}");
        if let Err(e) = client.publish(topic, QoS::AtLeastOnce, false, payload).await {
            warn!(record, "notify publish failed: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Write dispatch
// ---------------------------------------------------------------------------

pub(crate) async fn handle_write(
    core: &Arc<Core>,
    client: Option<&AsyncClient>,
    session: &mut SurfaceSession,
    record: &str,
    payload: &[u8],
) {
    let outcome = dispatch_write(core, client, session, record, payload).await;
    if let Err(e) = outcome {
        warn!(record, "surface write rejected: {e}");
    }
}

async fn dispatch_write(
    core: &Arc<Core>,
    client: Option<&AsyncClient>,
    session: &mut SurfaceSession,
    record: &str,
    payload: &[u8],
) -> Result<()> {
    match record {
        "task" => {
            let req = records::TaskCreate::decode(payload)?;
            core.add_task(req.channel, Trigger::Manual, req.target).await
        }

        "channel_config" => {
            handle_channel_config_write(core, client, session, payload).await
        }

        "schedule" => {
            let rec = records::ScheduleRecord::decode(payload)?;
            let mut cfg = core.channel_config(rec.channel).await?;
            cfg.schedule = rec.schedule;
            cfg.start = rec.start;
            cfg.target = rec.target;
            core.set_channel_config(rec.channel, cfg.clone()).await?;
            maybe_publish(client, "schedule", rec.encode()).await;
            Ok(())
        }

        "system_config" => {
            let rec = records::SystemConfigRecord::decode(payload)?;
            let mut settings = core.settings().await?;
            settings.power_mode = match rec.power_mode {
                0 => crate::config::PowerMode::Normal,
                1 => crate::config::PowerMode::EnergySaving,
                _ => crate::config::PowerMode::UltraLowPower,
            };
            core.set_settings(settings).await?;
            core.set_calibration(rec.pulses_per_litre as u32)?;
            core.save_calibration().await?;
            Ok(())
        }

        "queue" => {
            match records::decode_queue_command(payload)? {
                records::QUEUE_CMD_CANCEL_CURRENT => {
                    core.stop_current_task(crate::task::AbortReason::Manual)
                        .await?;
                }
                records::QUEUE_CMD_CLEAR_QUEUE => {
                    core.clear_queue().await?;
                }
                records::QUEUE_CMD_CLEAR_ERRORS => {
                    core.clear_errors().await?;
                }
                _ => unreachable!("decode validates commands"),
            }
            Ok(())
        }

        "rtc" => {
            let t = records::decode_rtc(payload)?;
            core.set_rtc(&t)?;
            maybe_publish(client, "rtc", records::encode_rtc(&core.rtc_now())).await;
            Ok(())
        }

        "calibration" => handle_calibration_write(core, client, session, payload).await,

        "interval_config" => {
            let rec = records::IntervalConfigRecord::decode(payload)?;
            let mut cfg = core.channel_config(rec.channel).await?;
            cfg.interval = if rec.enabled {
                rec.interval
            } else {
                crate::channel::IntervalConfig::default()
            };
            core.set_channel_config(rec.channel, cfg).await?;
            maybe_publish(client, "interval_config", rec.encode()).await;
            Ok(())
        }

        "history" => {
            let index = records::decode_history_request(payload)?;
            let events = core
                .store
                .watering_events(index as i64, 1)
                .await
                .map_err(Error::from)?;
            if let Some(ev) = events.first() {
                maybe_publish(client, "history", records::encode_history_entry(index, ev))
                    .await;
            }
            Ok(())
        }

        "reset" => {
            let rec = records::ResetControlRecord::decode(payload)?;
            let reset_type = ResetType::from_wire(rec.reset_type)
                .ok_or(Error::InvalidParam("unknown reset type"))?;
            if rec.code == 0 {
                // Phase one: issue a confirmation code and mirror it back.
                let code = core.request_reset(reset_type, rec.channel).await?;
                maybe_publish(
                    client,
                    "reset",
                    records::ResetControlRecord {
                        reset_type: rec.reset_type,
                        channel: rec.channel,
                        code,
                    }
                    .encode(),
                )
                .await;
            } else {
                core.confirm_reset(rec.code).await?;
            }
            Ok(())
        }

        _ => Err(Error::InvalidParam("unknown record")),
    }
}

async fn handle_channel_config_write(
    core: &Arc<Core>,
    client: Option<&AsyncClient>,
    session: &mut SurfaceSession,
    payload: &[u8],
) -> Result<()> {
    if payload.len() < 3 {
        return Err(Error::InvalidParam("payload too short"));
    }
    let channel = payload[0];
    match payload[1] {
        CHCFG_OP_AUTO_ENABLED => {
            let mut cfg = core.channel_config(channel).await?;
            cfg.auto_enabled = payload[2] != 0;
            core.set_channel_config(channel, cfg.clone()).await?;
            maybe_publish(
                client,
                "channel_config",
                records::encode_channel_config(channel, &cfg),
            )
            .await;
            Ok(())
        }
        CHCFG_OP_NAME_BEGIN => session.name_buf.begin(channel, payload[2] as usize),
        CHCFG_OP_NAME_FRAGMENT => {
            if payload.len() < 4 {
                return Err(Error::InvalidParam("fragment too short"));
            }
            let offset = payload[2] as usize;
            if let Some((channel, name)) =
                session.name_buf.push(channel, offset, &payload[3..])?
            {
                let mut cfg = core.channel_config(channel).await?;
                cfg.name = name;
                core.set_channel_config(channel, cfg.clone()).await?;
                maybe_publish(
                    client,
                    "channel_config",
                    records::encode_channel_config(channel, &cfg),
                )
                .await;
            }
            Ok(())
        }
        _ => Err(Error::InvalidParam("unknown channel_config op")),
    }
}

async fn handle_calibration_write(
    core: &Arc<Core>,
    client: Option<&AsyncClient>,
    session: &mut SurfaceSession,
    payload: &[u8],
) -> Result<()> {
    let rec = records::CalibrationRecord::decode(payload)?;
    match rec.action {
        records::CAL_ACTION_START => {
            session.cal_base = Some(core.flow.pulses());
            maybe_publish(
                client,
                "calibration",
                records::CalibrationRecord {
                    action: records::CAL_ACTION_IN_PROGRESS,
                    pulses: 0,
                    volume_ml: 0,
                    pulses_per_litre: core.calibration() as u16,
                }
                .encode(),
            )
            .await;
            Ok(())
        }
        records::CAL_ACTION_STOP => {
            let base = session
                .cal_base
                .take()
                .ok_or(Error::InvalidParam("no calibration session open"))?;
            let pulses = core.flow.pulses().saturating_sub(base);
            if rec.volume_ml == 0 {
                return Err(Error::InvalidParam("measured volume must be non-zero"));
            }
            let ppl = ((pulses as u64 * 1000) / rec.volume_ml as u64).max(1) as u32;
            core.set_calibration(ppl)?;
            core.save_calibration().await?;
            info!(pulses, volume_ml = rec.volume_ml, ppl, "calibration complete");
            maybe_publish(
                client,
                "calibration",
                records::CalibrationRecord {
                    action: records::CAL_ACTION_DONE,
                    pulses,
                    volume_ml: rec.volume_ml,
                    pulses_per_litre: ppl.min(u16::MAX as u32) as u16,
                }
                .encode(),
            )
            .await;
            Ok(())
        }
        _ => Err(Error::InvalidParam("client may only start or stop")),
    }
}

// ---------------------------------------------------------------------------
// Notifier: core events → record publishes
// ---------------------------------------------------------------------------

async fn publish_queue(core: &Arc<Core>, client: &AsyncClient) {
    if let Ok(queue) = core.queue_info().await {
        maybe_publish(
            Some(client),
            "queue",
            records::encode_task_queue(
                queue.pending,
                queue.active.map(|t| (t.channel, t.target)),
            ),
        )
        .await;
    }
}

/// Read-style records (Diagnostics, IntervalStatus) have no core event to
/// ride on; they are refreshed on this cadence instead.
const POLL_RECORD_PERIOD: Duration = Duration::from_secs(30);

async fn publish_polled_records(core: &Arc<Core>, client: &AsyncClient) {
    if let Ok(d) = core.diagnostics_full().await {
        maybe_publish(Some(client), "diagnostics", records::encode_diagnostics(&d)).await;
    }
    let Ok(queue) = core.queue_info().await else {
        return;
    };
    if let Some(task) = queue.active {
        if let Ok(snap) = core.interval_status(task.channel).await {
            let rec = records::IntervalStatusRecord {
                channel: snap.channel,
                is_active: snap.is_active,
                state: if snap.watering {
                    1
                } else if snap.pausing {
                    2
                } else {
                    0
                },
                currently_watering: snap.watering,
                phase_remaining_s: snap.phase_remaining_s.min(u16::MAX as u32) as u16,
                cycles_completed: snap.cycles_completed.min(255) as u8,
                progress_pct: snap.progress_pct,
                cycles_remaining: snap.cycles_remaining,
                next_phase_in_s: snap.next_phase_in_s,
                estimated_completion_s: snap.estimated_completion_s,
            };
            maybe_publish(Some(client), "interval_status", rec.encode()).await;
        }
    }
}

async fn notify_loop(core: Arc<Core>, client: AsyncClient) {
    let mut rx = core.events().subscribe();
    let mut poll = tokio::time::interval(POLL_RECORD_PERIOD);
    loop {
        let event = tokio::select! {
            ev = rx.recv() => match ev {
                Ok(ev) => ev,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "surface notifier lagged behind the bus");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = poll.tick() => {
                publish_polled_records(&core, &client).await;
                continue;
            }
        };

        match event {
            CoreEvent::ValveChanged { channel, open } => {
                maybe_publish(
                    Some(&client),
                    "valve",
                    records::encode_valve_status(channel, open),
                )
                .await;
            }
            CoreEvent::FlowPulses { pulses } => {
                maybe_publish(Some(&client), "flow", records::encode_flow_pulses(pulses)).await;
            }
            CoreEvent::StatusChanged { status } => {
                maybe_publish(
                    Some(&client),
                    "status",
                    records::encode_system_status(status),
                )
                .await;
            }
            CoreEvent::AlarmRaised {
                code,
                data,
                timestamp,
            } => {
                maybe_publish(
                    Some(&client),
                    "alarm",
                    records::encode_alarm(code as u8, data, timestamp),
                )
                .await;
            }
            CoreEvent::TaskStarted { .. } => {
                publish_queue(&core, &client).await;
            }
            CoreEvent::TaskCompleted { task, .. } => {
                publish_queue(&core, &client).await;
                if let Ok(totals) = core.statistics(task.channel).await {
                    maybe_publish(
                        Some(&client),
                        "statistics",
                        records::encode_statistics(task.channel, &totals),
                    )
                    .await;
                }
            }
            CoreEvent::WipeProgress {
                state,
                step,
                percent,
                last_error,
            } => {
                maybe_publish(
                    Some(&client),
                    "wipe",
                    records::encode_wipe_progress(state, step, percent, last_error),
                )
                .await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Run the wireless surface until shutdown.  With the surface disabled this
/// returns immediately and every core call stays untouched.
pub async fn run(core: Arc<Core>, mqtt_host: &str, mqtt_port: u16, enabled: bool) {
    if !enabled {
        info!("wireless surface disabled by configuration");
        return;
    }

    let mut options = MqttOptions::new("irrigation-controller", mqtt_host, mqtt_port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        "ctrl/online",
        b"offline".to_vec(),
        QoS::AtLeastOnce,
        true,
    ));

    let (client, mut eventloop) = AsyncClient::new(options, 20);
    if let Err(e) = client.subscribe("ctrl/+/set", QoS::AtLeastOnce).await {
        warn!("initial subscribe failed: {e}");
    }

    let notifier = tokio::spawn(notify_loop(Arc::clone(&core), client.clone()));
    let mut session = SurfaceSession::default();

    loop {
        if core.shutting_down() {
            break;
        }
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let topic = p.topic.clone();
                if let Some(record) = extract_record(&topic) {
                    handle_write(&core, Some(&client), &mut session, record, &p.payload).await;
                } else {
                    warn!(topic = %topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("surface mqtt connected");
                // Broker may have dropped the session; re-subscribe.
                if let Err(e) = client.subscribe("ctrl/+/set", QoS::AtLeastOnce).await {
                    warn!("re-subscribe failed: {e}");
                }
                let _ = client
                    .publish("ctrl/online", QoS::AtLeastOnce, true, b"online".to_vec())
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("surface mqtt error: {e}");
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
    }

    notifier.abort();
    info!("wireless surface stopped");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{IntervalConfig, Schedule, StartTime};
    use crate::task::WaterTarget;
    use crate::testutil::test_core;

    async fn write(core: &Arc<Core>, session: &mut SurfaceSession, record: &str, payload: &[u8]) {
        handle_write(core, None, session, record, payload).await;
    }

    // -- topic parsing ------------------------------------------------------

    #[test]
    fn extract_record_valid_topic() {
        assert_eq!(extract_record("ctrl/task/set"), Some("task"));
        assert_eq!(extract_record("ctrl/rtc/set"), Some("rtc"));
    }

    #[test]
    fn extract_record_rejects_other_shapes() {
        assert_eq!(extract_record("ctrl/task"), None);
        assert_eq!(extract_record("other/task/set"), None);
        assert_eq!(extract_record("ctrl/task/get"), None);
        assert_eq!(extract_record(""), None);
    }

    // -- TaskCreate is the only actuation path ------------------------------

    #[tokio::test(start_paused = true)]
    async fn task_write_enqueues_manual_task() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        write(&core, &mut session, "task", &[2, 1, 3, 0]).await;

        let info = core.queue_info().await.unwrap();
        assert_eq!(info.pending, 1);
        let state = core.state.lock().await;
        let task = state.queue.peek().unwrap();
        assert_eq!(task.channel, 2);
        assert_eq!(task.trigger, Trigger::Manual);
        assert_eq!(task.target, WaterTarget::Volume { litres: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn valve_record_is_not_writable() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        // A hypothetical "open valve 0" write lands on an unknown record and
        // is dropped without touching the core.
        write(&core, &mut session, "valve", &[0, 1]).await;
        let state = core.state.lock().await;
        assert_eq!(state.bank.active(), None);
    }

    // -- queue commands -----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn queue_commands_cancel_and_clear() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        core.add_task(0, Trigger::Manual, WaterTarget::Duration { minutes: 5 })
            .await
            .unwrap();
        core.add_task(1, Trigger::Manual, WaterTarget::Duration { minutes: 5 })
            .await
            .unwrap();
        core.task_tick().await; // start channel 0, leave 1 queued

        write(&core, &mut session, "queue", &[records::QUEUE_CMD_CLEAR_QUEUE]).await;
        assert_eq!(core.queue_info().await.unwrap().pending, 0);

        write(
            &core,
            &mut session,
            "queue",
            &[records::QUEUE_CMD_CANCEL_CURRENT],
        )
        .await;
        let state = core.state.lock().await;
        assert!(state.active.is_none());
        assert_eq!(state.bank.active(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_errors_command_does_not_clear_freeze() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        {
            let mut state = core.state.lock().await;
            state.freeze.locked = true;
            state.monitor.faulted = true;
            core.refresh_status(&mut state);
        }
        write(
            &core,
            &mut session,
            "queue",
            &[records::QUEUE_CMD_CLEAR_ERRORS],
        )
        .await;

        let state = core.state.lock().await;
        assert!(!state.monitor.faulted, "fault latch cleared");
        assert!(state.freeze.locked, "freeze lockout untouched");
        assert_eq!(state.status, crate::core::SystemStatus::FreezeLockout);
    }

    // -- schedule / interval / rtc writes ------------------------------------

    #[tokio::test(start_paused = true)]
    async fn schedule_write_updates_channel() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        let rec = records::ScheduleRecord {
            channel: 4,
            schedule: Schedule::Periodic { interval_days: 2 },
            start: StartTime {
                hour: 21,
                minute: 15,
            },
            target: WaterTarget::Volume { litres: 25 },
        };
        write(&core, &mut session, "schedule", &rec.encode()).await;

        let cfg = core.channel_config(4).await.unwrap();
        assert_eq!(cfg.schedule, Schedule::Periodic { interval_days: 2 });
        assert_eq!(cfg.start.minute_of_day(), 21 * 60 + 15);
        assert_eq!(cfg.target, WaterTarget::Volume { litres: 25 });
    }

    #[tokio::test(start_paused = true)]
    async fn interval_write_and_disable() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        let rec = records::IntervalConfigRecord {
            channel: 1,
            enabled: true,
            interval: IntervalConfig {
                watering_s: 90,
                pause_s: 120,
            },
        };
        write(&core, &mut session, "interval_config", &rec.encode()).await;
        assert!(core.channel_config(1).await.unwrap().interval.is_configured());

        let off = records::IntervalConfigRecord {
            enabled: false,
            ..rec
        };
        write(&core, &mut session, "interval_config", &off.encode()).await;
        assert!(!core.channel_config(1).await.unwrap().interval.is_configured());
    }

    #[tokio::test(start_paused = true)]
    async fn rtc_write_then_read_roundtrips() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        let t = crate::clock::RtcTime {
            year: 2026,
            month: 8,
            day: 1,
            hour: 12,
            minute: 34,
            second: 0,
            weekday: 6,
        };
        write(&core, &mut session, "rtc", &records::encode_rtc(&t)).await;

        let now = core.rtc_now();
        assert_eq!((now.year, now.month, now.day), (2026, 8, 1));
        assert_eq!((now.hour, now.minute), (12, 34));
    }

    // -- fragmented channel config write ------------------------------------

    #[tokio::test(start_paused = true)]
    async fn fragmented_name_write_roundtrips() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        let name = b"Back garden drip line";

        write(
            &core,
            &mut session,
            "channel_config",
            &[3, CHCFG_OP_NAME_BEGIN, name.len() as u8],
        )
        .await;
        // Two slices.
        let mut frag1 = vec![3, CHCFG_OP_NAME_FRAGMENT, 0];
        frag1.extend_from_slice(&name[..10]);
        write(&core, &mut session, "channel_config", &frag1).await;
        let mut frag2 = vec![3, CHCFG_OP_NAME_FRAGMENT, 10];
        frag2.extend_from_slice(&name[10..]);
        write(&core, &mut session, "channel_config", &frag2).await;

        // Round-trip law: a subsequent read returns identical name bytes.
        let cfg = core.channel_config(3).await.unwrap();
        assert_eq!(cfg.name.as_bytes(), name);
        let encoded = records::encode_channel_config(3, &cfg);
        assert_eq!(&encoded[3..], name);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_enabled_toggle_write() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        write(
            &core,
            &mut session,
            "channel_config",
            &[6, CHCFG_OP_AUTO_ENABLED, 1],
        )
        .await;
        assert!(core.channel_config(6).await.unwrap().auto_enabled);
    }

    // -- calibration session -------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn calibration_session_computes_ppl() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();

        let start = records::CalibrationRecord {
            action: records::CAL_ACTION_START,
            pulses: 0,
            volume_ml: 0,
            pulses_per_litre: 0,
        };
        write(&core, &mut session, "calibration", &start.encode()).await;

        // The meter sees 1000 pulses while the client measures 2 litres.
        core.flow.add_pulses(1000);
        let stop = records::CalibrationRecord {
            action: records::CAL_ACTION_STOP,
            pulses: 0,
            volume_ml: 2000,
            pulses_per_litre: 0,
        };
        write(&core, &mut session, "calibration", &stop.encode()).await;

        assert_eq!(core.calibration(), 500);
        let stored: Option<u32> = core.store.load(crate::store::keys::CALIBRATION).await.unwrap();
        assert_eq!(stored, Some(500));
    }

    #[tokio::test(start_paused = true)]
    async fn calibration_stop_without_start_is_rejected() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        let before = core.calibration();
        let stop = records::CalibrationRecord {
            action: records::CAL_ACTION_STOP,
            pulses: 0,
            volume_ml: 1000,
            pulses_per_litre: 0,
        };
        write(&core, &mut session, "calibration", &stop.encode()).await;
        assert_eq!(core.calibration(), before);
    }

    // -- malformed payloads never panic --------------------------------------

    #[tokio::test(start_paused = true)]
    async fn malformed_payloads_are_dropped() {
        let core = test_core().await;
        let mut session = SurfaceSession::default();
        for record in [
            "task",
            "schedule",
            "system_config",
            "queue",
            "rtc",
            "calibration",
            "interval_config",
            "history",
            "reset",
            "channel_config",
            "nonsense",
        ] {
            write(&core, &mut session, record, &[]).await;
            write(&core, &mut session, record, &[0xFF]).await;
        }
        assert_eq!(core.queue_info().await.unwrap().pending, 0);
    }

    // -- disabled surface -----------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn disabled_surface_returns_immediately() {
        let core = test_core().await;
        run(core, "127.0.0.1", 1883, false).await;
    }
}
