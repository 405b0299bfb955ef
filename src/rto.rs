//! RTO estimation (Jacobson/Karels), factored out of the sender's rx task so
//! it can be tested without standing up a socket.

use std::time::Duration;

use crate::config::SessionConfig;

/// Smoothed round-trip-time estimator. Owned by the sender alongside the
/// [`crate::congestion::CongestionFsm`]; both are mutated only by the rx
/// task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtoEstimator {
    srtt: f64,
    devrtt: f64,
    alpha: f64,
    beta: f64,
    mu: f64,
    rho: f64,
    floor: Duration,
}

impl RtoEstimator {
    pub fn new(cfg: &SessionConfig) -> Self {
        RtoEstimator {
            srtt: 0.0,
            devrtt: 1.0,
            alpha: cfg.alpha,
            beta: cfg.beta,
            mu: cfg.mu,
            rho: cfg.rho,
            floor: cfg.minimum_rto,
        }
    }

    /// Folds in one fresh RTT sample (never a retransmission ambiguity
    /// sample, per Karn's algorithm — the caller only samples an ACK that
    /// covers a frame sent exactly once). The same recurrence applies from
    /// the very first sample onward, starting from the seeded `SRTT=0,
    /// DevRTT=1`; there is no special-cased first sample.
    pub fn sample(&mut self, rtt: Duration) {
        let rtt_secs = rtt.as_secs_f64();
        self.srtt += self.alpha * (rtt_secs - self.srtt);
        self.devrtt = (1.0 - self.beta) * self.devrtt + self.beta * (rtt_secs - self.srtt).abs();
    }

    /// Current retransmission timeout: `mu * SRTT + rho * DevRTT`, floored.
    pub fn rto(&self) -> Duration {
        let estimate = self.mu * self.srtt + self.rho * self.devrtt;
        Duration::from_secs_f64(estimate).max(self.floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SessionConfig {
        SessionConfig::default()
    }

    #[test]
    fn first_sample_applies_the_same_recurrence_from_the_seeded_values() {
        let mut rto = RtoEstimator::new(&cfg());
        rto.sample(Duration::from_millis(200));
        // srtt = 0 + 0.125*(0.2-0) = 0.025
        // devrtt = 0.75*1 + 0.25*|0.2-0.025| = 0.79375
        // rto = 1*0.025 + 4*0.79375 = 3.2s, well above the 500ms floor.
        let estimate = rto.rto();
        assert!(estimate >= Duration::from_millis(3190));
        assert!(estimate <= Duration::from_millis(3210));
    }

    #[test]
    fn rto_never_drops_below_the_floor() {
        let mut rto = RtoEstimator::new(&cfg());
        for _ in 0..20 {
            rto.sample(Duration::from_millis(1));
        }
        assert!(rto.rto() >= Duration::from_millis(500));
    }

    #[test]
    fn stable_rtt_samples_converge_the_estimate() {
        let mut rto = RtoEstimator::new(&cfg());
        for _ in 0..50 {
            rto.sample(Duration::from_millis(300));
        }
        let estimate = rto.rto();
        // devrtt should have decayed close to zero, so rto ~= srtt ~= 300ms,
        // still clamped up to the configured floor of 500ms.
        assert!(estimate >= Duration::from_millis(500));
        assert!(estimate <= Duration::from_millis(700));
    }

    #[test]
    fn jittery_rtt_widens_the_estimate() {
        let mut stable = RtoEstimator::new(&cfg());
        let mut jittery = RtoEstimator::new(&cfg());
        for i in 0..20 {
            stable.sample(Duration::from_millis(300));
            let jitter = if i % 2 == 0 { 100 } else { 500 };
            jittery.sample(Duration::from_millis(jitter));
        }
        assert!(jittery.rto() > stable.rto());
    }
}
