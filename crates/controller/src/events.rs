//! Outbound core event bus.  The core publishes; adapters (wireless surface,
//! logging) subscribe.  Nothing calls back into the core from a subscriber,
//! which keeps the actuation path one-directional.

use tokio::sync::broadcast;

use crate::core::SystemStatus;
use crate::task::{Task, TaskResult};
use crate::wipe::WipeState;

/// Channel id used on the wire for the master valve.
pub const MASTER_CHANNEL: u8 = 0xFF;

/// Alarm codes mirrored into the Alarm record.  `data` meaning per code:
/// no-flow → channel id, leak → excess pulse count, freeze → temperature×10,
/// RTC → consecutive error count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlarmCode {
    NoFlow = 1,
    UnexpectedFlow = 2,
    Freeze = 3,
    FreezeCleared = 4,
    RtcError = 5,
    WipeDone = 6,
}

#[derive(Debug, Clone)]
pub enum CoreEvent {
    /// A zone valve or the master valve changed state.
    ValveChanged { channel: u8, open: bool },
    TaskStarted { task: Task },
    TaskCompleted {
        task: Task,
        result: TaskResult,
        effective_secs: u64,
        delivered_ml: u64,
    },
    AlarmRaised {
        code: AlarmCode,
        data: u16,
        timestamp: u32,
    },
    StatusChanged { status: SystemStatus },
    FlowPulses { pulses: u32 },
    WipeProgress {
        state: WipeState,
        step: u8,
        percent: u8,
        last_error: u8,
    },
}

/// Broadcast fan-out.  `emit` never blocks and never fails: with no
/// subscribers the event is simply dropped.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: CoreEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(CoreEvent::FlowPulses { pulses: 42 });
    }

    #[tokio::test]
    async fn subscriber_receives_event() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        bus.emit(CoreEvent::ValveChanged {
            channel: 3,
            open: true,
        });
        match rx.recv().await.unwrap() {
            CoreEvent::ValveChanged { channel, open } => {
                assert_eq!(channel, 3);
                assert!(open);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::default();
        bus.emit(CoreEvent::FlowPulses { pulses: 1 });
        let mut rx = bus.subscribe();
        bus.emit(CoreEvent::FlowPulses { pulses: 2 });
        match rx.recv().await.unwrap() {
            CoreEvent::FlowPulses { pulses } => assert_eq!(pulses, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
