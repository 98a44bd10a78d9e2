//! The watering task model and the bounded pending-task queue.
//!
//! A task is a by-value snapshot of intent taken at enqueue time: the target
//! channel, what triggered it, and the effective duration or volume.  The
//! executor takes ownership of the task on pop; nothing ever holds a
//! reference into queue storage, and rain/auto adjustments are baked into
//! the task instead of mutating the channel's configured event.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::channel::CHANNEL_COUNT;
use crate::error::{Error, Result};

/// Queue capacity.  The scheduler keeps two slots of headroom so a manual
/// task can always be accepted while a full day's schedule is pending.
pub const QUEUE_CAPACITY: usize = 10;

/// What put this task on the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    Manual,
    Scheduled,
    RainAdjusted,
    AutoDeficit,
}

/// Effective watering target.  Carried by the task itself, so an adjusted
/// task never touches the channel's persisted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaterTarget {
    Duration { minutes: u16 },
    Volume { litres: u16 },
}

impl WaterTarget {
    pub fn validate(&self) -> Result<()> {
        match self {
            WaterTarget::Duration { minutes: 0 } => {
                Err(Error::InvalidParam("duration must be >= 1 minute"))
            }
            WaterTarget::Volume { litres: 0 } => {
                Err(Error::InvalidParam("volume must be >= 1 litre"))
            }
            _ => Ok(()),
        }
    }

    /// Target volume in millilitres, volume mode only.
    pub fn target_ml(&self) -> Option<u64> {
        match self {
            WaterTarget::Volume { litres } => Some(*litres as u64 * 1000),
            WaterTarget::Duration { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub channel: u8,
    pub trigger: Trigger,
    pub target: WaterTarget,
}

impl Task {
    pub fn validate(&self) -> Result<()> {
        if self.channel as usize >= CHANNEL_COUNT {
            return Err(Error::InvalidParam("channel index out of range"));
        }
        self.target.validate()
    }
}

/// How an active task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskResult {
    Completed,
    /// Aborted; the payload names why.
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortReason {
    Manual,
    NoFlow,
    /// Volume task exceeded the wall-clock stall limit.
    Stall,
    Fault,
    Shutdown,
}

// ---------------------------------------------------------------------------
// Bounded FIFO queue
// ---------------------------------------------------------------------------

/// Strict-FIFO pending queue.  All operations are non-blocking; failure is
/// surfaced, never silently dropped.
pub struct TaskQueue {
    items: VecDeque<Task>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn enqueue(&mut self, task: Task) -> Result<()> {
        if self.items.len() >= self.capacity {
            return Err(Error::QueueFull);
        }
        self.items.push_back(task);
        Ok(())
    }

    pub fn try_pop(&mut self) -> Option<Task> {
        self.items.pop_front()
    }

    pub fn peek(&self) -> Option<&Task> {
        self.items.front()
    }

    /// Put a just-popped task back at the head after a failed start, so
    /// FIFO order survives the retry.
    pub fn requeue_front(&mut self, task: Task) {
        self.items.push_front(task);
    }

    /// Drop every pending task, returning how many were removed.
    pub fn purge(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// True while the scheduler may still enqueue: two slots stay reserved
    /// for manual tasks.
    pub fn has_scheduler_headroom(&self) -> bool {
        self.items.len() + 2 <= self.capacity
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QUEUE_CAPACITY)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn task(channel: u8) -> Task {
        Task {
            channel,
            trigger: Trigger::Manual,
            target: WaterTarget::Duration { minutes: 5 },
        }
    }

    // -- validation ---------------------------------------------------------

    #[test]
    fn zero_duration_rejected() {
        let t = Task {
            channel: 0,
            trigger: Trigger::Manual,
            target: WaterTarget::Duration { minutes: 0 },
        };
        assert!(matches!(t.validate(), Err(Error::InvalidParam(_))));
    }

    #[test]
    fn zero_volume_rejected() {
        assert!(WaterTarget::Volume { litres: 0 }.validate().is_err());
    }

    #[test]
    fn channel_out_of_range_rejected() {
        assert!(matches!(task(8).validate(), Err(Error::InvalidParam(_))));
        assert!(task(7).validate().is_ok());
    }

    #[test]
    fn target_ml_volume_only() {
        assert_eq!(WaterTarget::Volume { litres: 2 }.target_ml(), Some(2000));
        assert_eq!(WaterTarget::Duration { minutes: 2 }.target_ml(), None);
    }

    // -- queue --------------------------------------------------------------

    #[test]
    fn fifo_order_preserved() {
        let mut q = TaskQueue::new(3);
        q.enqueue(task(0)).unwrap();
        q.enqueue(task(1)).unwrap();
        q.enqueue(task(2)).unwrap();
        assert_eq!(q.try_pop().unwrap().channel, 0);
        assert_eq!(q.try_pop().unwrap().channel, 1);
        assert_eq!(q.try_pop().unwrap().channel, 2);
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn enqueue_full_fails() {
        let mut q = TaskQueue::new(2);
        q.enqueue(task(0)).unwrap();
        q.enqueue(task(1)).unwrap();
        assert!(matches!(q.enqueue(task(2)), Err(Error::QueueFull)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn peek_does_not_remove() {
        let mut q = TaskQueue::default();
        q.enqueue(task(4)).unwrap();
        assert_eq!(q.peek().unwrap().channel, 4);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn purge_reports_removed_count() {
        let mut q = TaskQueue::default();
        q.enqueue(task(0)).unwrap();
        q.enqueue(task(1)).unwrap();
        assert_eq!(q.purge(), 2);
        assert!(q.is_empty());
        assert_eq!(q.purge(), 0);
    }

    #[test]
    fn scheduler_headroom_reserves_two_slots() {
        let mut q = TaskQueue::new(10);
        for i in 0..8 {
            assert!(q.has_scheduler_headroom(), "slot {i}");
            q.enqueue(task(0)).unwrap();
        }
        // Eight used: the scheduler may still take this one.
        assert!(q.has_scheduler_headroom());
        q.enqueue(task(0)).unwrap();
        assert!(!q.has_scheduler_headroom());
        // The last slot stays reachable for a manual task.
        q.enqueue(task(0)).unwrap();
        assert!(matches!(q.enqueue(task(0)), Err(Error::QueueFull)));
    }
}
