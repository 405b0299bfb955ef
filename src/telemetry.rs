//! Structured telemetry observer, replacing the original's
//! `"<path>_data.log"` side file with a callback the core invokes on every
//! state change. Persisting or rendering the trace (the Non-goal'd
//! visualization) is the caller's concern.

use std::time::Duration;

/// Observes the sender's congestion-control state over the life of a
/// session.
pub trait TelemetryObserver: Send {
    /// Called after every `rwnd`/`cwnd`/`RTO` update.
    fn on_sample(&self, rwnd: u16, cwnd: f64, rto: Duration) {
        let _ = (rwnd, cwnd, rto);
    }

    /// Called once, at the end of the sender's run.
    fn on_summary(&self, total_timeouts: u32, total_fast_resends: u32) {
        let _ = (total_timeouts, total_fast_resends);
    }
}

/// Discards every sample. The default when a caller doesn't care.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl TelemetryObserver for NullObserver {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_observer_accepts_samples_without_panicking() {
        let observer = NullObserver;
        observer.on_sample(128, 4.0, Duration::from_millis(100));
        observer.on_summary(0, 0);
    }
}
