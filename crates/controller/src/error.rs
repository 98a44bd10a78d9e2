//! Core error taxonomy.  Names are contracts: callers match on the variant,
//! never on message text.  `anyhow` stays at the binary and store boundary;
//! everything crossing the core API uses this enum.

use thiserror::Error;

/// Flow anomaly class, carried inside [`Error::FlowAnomaly`] and latched
/// into system status by the flow monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAnomaly {
    /// An active watering task produced no pulses across consecutive
    /// check windows.
    NoFlow,
    /// Pulses accumulated while every channel was closed (leak).
    UnexpectedFlow,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Caller-supplied value out of range.  No state change.
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),

    /// Called before boot finished loading persisted state.
    #[error("not initialized")]
    NotInitialized,

    /// Operation deferred: queue full downstream, lock contention, freeze
    /// lockout or the active-valve cap.  Safe to retry later.
    #[error("busy: {0}")]
    Busy(&'static str),

    /// GPIO or peripheral refused the operation.
    #[error("hardware: {0}")]
    Hardware(String),

    /// Persistent store or validation failure.
    #[error("config: {0}")]
    Config(String),

    /// RTC read/set failed repeatedly; clock degraded to monotonic time.
    #[error("rtc failure")]
    RtcFailure,

    /// Flow monitor detected an anomaly.
    #[error("flow anomaly: {0:?}")]
    FlowAnomaly(FlowAnomaly),

    /// Enqueue rejected, queue at capacity.
    #[error("task queue full")]
    QueueFull,

    /// Guarded wait or operation window exceeded.
    #[error("timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Config(format!("{e:#}"))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        assert_eq!(Error::QueueFull.to_string(), "task queue full");
        assert_eq!(Error::Busy("state lock").to_string(), "busy: state lock");
        assert_eq!(
            Error::FlowAnomaly(FlowAnomaly::NoFlow).to_string(),
            "flow anomaly: NoFlow"
        );
    }

    #[test]
    fn anyhow_maps_to_config() {
        let e: Error = anyhow::anyhow!("kv write failed").into();
        assert!(matches!(e, Error::Config(_)));
    }
}
