//! Protocol constants (the wire contract) and the [`SessionConfig`] surface
//! that threads them explicitly through the dispatcher, handshake, sender
//! and receiver instead of leaving them as free-floating magic numbers.

use std::time::Duration;

/// Data payload cap, in bytes, for ordinary session frames.
pub const MSS: usize = 5120;

/// Payload cap, in bytes, for the dispatcher's port-request frame.
pub const RE_MSS: usize = 64;

/// Initial sequence number used by both ends of a session.
pub const STARTNUM: u32 = 0;

/// Initial advertised receive window, in frames.
pub const DEFAULT_RWND: u16 = 128;

/// `wnd` sentinel marking a terminal (FIN) frame.
pub const DONE: u16 = 65532;

/// `wnd` sentinel marking a window-probe frame.
pub const GETWINDOW: u16 = 65534;

/// Largest legal advertised `rwnd` value carried in an ACK.
pub const MAX_RWND: u16 = 65531;

/// Consecutive ACK timeouts the sender tolerates before aborting.
pub const TIMEOUT_COUNT: u32 = 5;

/// Receiver idle-read timeout.
pub const TIME_LIMIT: Duration = Duration::from_secs(10);

/// Consecutive receiver idle timeouts before the receiver gives up.
pub const RECEIVER_TIMEOUT_COUNT: u32 = 5;

/// Consecutive handshake-leg timeouts before a leg aborts.
pub const HANDSHAKE_TIMEOUT_COUNT: u32 = 5;

/// Per-attempt handshake receive timeout.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// RTO floor; prevents a degenerate RTT estimate from causing a timeout storm.
pub const MINIMUM_RTO: Duration = Duration::from_millis(500);

/// Jacobson/Karels smoothing parameter for SRTT.
pub const ALPHA: f64 = 0.125;
/// Jacobson/Karels smoothing parameter for DevRTT.
pub const BETA: f64 = 0.25;
/// Jacobson/Karels SRTT multiplier.
pub const MU: f64 = 1.0;
/// Jacobson/Karels DevRTT multiplier.
pub const RHO: f64 = 4.0;

/// Initial slow-start threshold, in frames.
pub const INITIAL_SSTHRESH: f64 = 32.0;

/// Field separator used in handshake payload grammar.
pub const SPLITER: &str = "$^!&";

/// Well-known dispatcher port.
pub const DISPATCHER_PORT: u16 = 22222;

/// First port handed out to a freshly dispatched session.
pub const STARTPORT: u16 = 12000;

/// Port allocation wraps back to this value once it exceeds `u16::MAX`.
pub const PORT_WRAP: u16 = 10001;

/// Handshake/dispatcher command tokens (§4.1's `commands` row).
pub mod command {
    pub const SEND: &str = "s";
    pub const RECEIVE: &str = "r";
    pub const RESEND: &str = "0";
    pub const COSEND: &str = "1";
    pub const RESET: &str = "-1";
    pub const FILE_NOT_FOUND: &str = "2";
    pub const OK: &str = "3";
    pub const REQUEST_PORT: &str = "4";
}

/// Explicit, overridable bundle of the values above.
///
/// `SessionConfig::default()` reproduces the wire-contract constants
/// exactly; tests and embedders MAY shrink `mss` or the timeouts to
/// exercise edge cases without waiting out real-world timers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub mss: usize,
    pub re_mss: usize,
    pub default_rwnd: u16,
    pub minimum_rto: Duration,
    pub timeout_count: u32,
    pub time_limit: Duration,
    pub receiver_timeout_count: u32,
    pub handshake_timeout: Duration,
    pub handshake_timeout_count: u32,
    pub alpha: f64,
    pub beta: f64,
    pub mu: f64,
    pub rho: f64,
    pub initial_ssthresh: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            mss: MSS,
            re_mss: RE_MSS,
            default_rwnd: DEFAULT_RWND,
            minimum_rto: MINIMUM_RTO,
            timeout_count: TIMEOUT_COUNT,
            time_limit: TIME_LIMIT,
            receiver_timeout_count: RECEIVER_TIMEOUT_COUNT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            handshake_timeout_count: HANDSHAKE_TIMEOUT_COUNT,
            alpha: ALPHA,
            beta: BETA,
            mu: MU,
            rho: RHO,
            initial_ssthresh: INITIAL_SSTHRESH,
        }
    }
}
