//! Congestion control as a literal data structure (§4.5, §9's "Congestion
//! state as an explicit FSM" redesign note) rather than conditionals inlined
//! into the receive loop.

/// The sender's congestion-control regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CongestionState {
    SlowStart,
    Avoid,
    FastRecovery,
    Close,
}

/// Owned exclusively by the sender's rx task (§5).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CongestionFsm {
    pub state: CongestionState,
    pub cwnd: f64,
    pub ssthresh: f64,
    dupack: u32,
    pub total_timeouts: u32,
    pub total_fast_resends: u32,
}

impl CongestionFsm {
    pub fn new(initial_ssthresh: f64) -> Self {
        CongestionFsm {
            state: CongestionState::SlowStart,
            cwnd: 1.0,
            ssthresh: initial_ssthresh,
            dupack: 0,
            total_timeouts: 0,
            total_fast_resends: 0,
        }
    }

    /// Effective window, in frames: `ceil(min(rwnd, cwnd))`.
    pub fn window_frames(&self, rwnd: u16) -> u32 {
        self.cwnd.min(rwnd as f64).ceil() as u32
    }

    /// A forward (non-duplicate, non-stale) ACK resets the duplicate-ACK
    /// count; call once per received ACK packet, before stepping.
    pub fn note_forward_ack(&mut self) {
        self.dupack = 0;
    }

    /// A stale ACK (`seq < unacked_seq - 1`) also resets the duplicate-ACK
    /// count without otherwise touching `cwnd`.
    pub fn note_stale_ack(&mut self) {
        self.dupack = 0;
    }

    /// Advances `cwnd` for one individually-acknowledged frame. Call once
    /// per sequence number the forward ACK newly covers.
    pub fn on_ack_step(&mut self) {
        match self.state {
            CongestionState::SlowStart => {
                if self.cwnd + 1.0 < self.ssthresh {
                    self.cwnd += 1.0;
                } else {
                    self.cwnd = self.ssthresh;
                    self.state = CongestionState::Avoid;
                }
            }
            CongestionState::Avoid => {
                self.cwnd += 1.0 / self.cwnd;
            }
            CongestionState::FastRecovery => {
                self.cwnd += 1.0;
                self.state = CongestionState::Avoid;
            }
            CongestionState::Close => {}
        }
    }

    /// Registers one duplicate ACK. Returns `true` exactly when this is the
    /// third consecutive one, at which point the caller MUST retransmit the
    /// buffered window before the fast-recovery transition below is applied
    /// (the original sleeps 0.5s and resends before calling `update_cwnd`).
    pub fn note_dup_ack(&mut self) -> bool {
        if self.state == CongestionState::Close {
            return false;
        }
        self.dupack += 1;
        self.dupack == 3
    }

    /// Applies the fast-recovery transition after the caller has
    /// retransmitted in response to [`note_dup_ack`] returning `true`.
    pub fn enter_fast_recovery(&mut self) {
        if self.state == CongestionState::Close {
            return;
        }
        self.total_fast_resends += 1;
        self.ssthresh = (self.cwnd / 2.0).max(1.0);
        self.cwnd = self.ssthresh;
        self.state = CongestionState::FastRecovery;
        self.dupack = 0;
    }

    /// Applies the timeout transition: ssthresh halves, cwnd resets to 1,
    /// state returns to slow start.
    pub fn on_timeout(&mut self) {
        if self.state == CongestionState::Close {
            return;
        }
        self.total_timeouts += 1;
        self.ssthresh = (self.cwnd / 2.0).max(1.0);
        self.cwnd = 1.0;
        self.state = CongestionState::SlowStart;
    }

    pub fn close(&mut self) {
        self.state = CongestionState::Close;
    }
}
