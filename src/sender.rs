//! Sender engine (§4.5): a tx task that reads the file and admits frames
//! under the current window, and an rx task that owns congestion control,
//! RTO estimation, and retransmission — mirroring the receiver's net/writer
//! split, with the send buffer as a `Mutex`-guarded deque (§9's "bounded
//! channel plus a small shared state object" redesign note) rather than the
//! hand-rolled locking the teacher's TCB does for its retransmission queue.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::config::SessionConfig;
use crate::congestion::CongestionFsm;
use crate::error::{Error, Result};
use crate::rto::RtoEstimator;
use crate::socket::{is_timeout, DatagramSocket};
use crate::store::FileStore;
use crate::telemetry::TelemetryObserver;
use crate::wire::{AckEvent, Content, RawFrame};

const TX_SATURATED_SLEEP: Duration = Duration::from_millis(200);
const FAST_RETRANSMIT_SLEEP: Duration = Duration::from_millis(500);

/// One frame waiting on an ACK, in the order it was transmitted.
#[derive(Debug, Clone)]
struct BufferedFrame {
    seq: u32,
    raw: RawFrame,
    sent_at: Instant,
    retransmitted: bool,
}

/// State the tx and rx tasks share: the unacked-frame buffer plus the small
/// set of counters §5 calls out as requiring atomic discipline. Congestion
/// and RTO state themselves stay thread-local to the rx task, per §5.
#[derive(Debug)]
struct SharedState {
    buffer: Mutex<VecDeque<BufferedFrame>>,
    unacked_seq: AtomicU32,
    rwnd_frames: AtomicU32,
    window_frames: AtomicU32,
    closed: AtomicBool,
}

impl SharedState {
    fn new(seq0: u32, default_rwnd: u16) -> Self {
        SharedState {
            buffer: Mutex::new(VecDeque::new()),
            unacked_seq: AtomicU32::new(seq0),
            rwnd_frames: AtomicU32::new(default_rwnd as u32),
            window_frames: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn in_flight(&self, next_seq: u32) -> u32 {
        next_seq - self.unacked_seq.load(Ordering::Acquire)
    }

    fn rwnd(&self) -> u16 {
        self.rwnd_frames.load(Ordering::Acquire).min(u16::MAX as u32) as u16
    }

    fn window(&self) -> u32 {
        self.window_frames.load(Ordering::Acquire).max(1)
    }
}

/// Summary returned once a send completes, for the caller's telemetry or
/// exit-code decision.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub total_package: u32,
    pub total_timeouts: u32,
    pub total_fast_resends: u32,
}

/// Runs the sender side of a data-phase session to completion: reads `store`
/// starting at `offset`, transmits it over `socket` to `peer`, and blocks
/// until the FIN is acknowledged or the ACK-timeout budget is exhausted.
#[allow(clippy::too_many_arguments)]
pub fn run_sender(
    socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    sign: u16,
    seq0: u32,
    offset: u64,
    cfg: &SessionConfig,
    mut store: Box<dyn FileStore>,
    observer: Arc<dyn TelemetryObserver>,
) -> Result<SendOutcome> {
    let shared = Arc::new(SharedState::new(seq0, cfg.default_rwnd));

    let tx_shared = shared.clone();
    let tx_socket = socket.clone();
    let tx_cfg = *cfg;
    let tx = thread::spawn(move || -> Result<(u32, u32)> {
        run_tx_task(&*tx_socket, peer, sign, seq0, offset, &tx_cfg, &mut *store, &tx_shared)
    });

    let rx_result = run_rx_task(&*socket, peer, sign, cfg, &shared, &*observer);
    let (next_seq, total_package) = tx.join().expect("tx task panicked")?;
    let (total_timeouts, total_fast_resends) = rx_result?;

    if next_seq.wrapping_sub(1) != total_package {
        warn!(
            "session {sign}: next_seq-1 ({}) != total_package ({total_package})",
            next_seq.wrapping_sub(1)
        );
    }
    observer.on_summary(total_timeouts, total_fast_resends);

    Ok(SendOutcome {
        total_package,
        total_timeouts,
        total_fast_resends,
    })
}

/// Reads `store` in `mss`-sized chunks and admits frames under the current
/// window, per §4.5's "Window accounting" rule. Returns `(next_seq,
/// total_package)`, both owned solely by this task per §9's resolution.
fn run_tx_task(
    socket: &dyn DatagramSocket,
    peer: SocketAddr,
    sign: u16,
    seq0: u32,
    offset: u64,
    cfg: &SessionConfig,
    store: &mut dyn FileStore,
    shared: &SharedState,
) -> Result<(u32, u32)> {
    let mut next_seq = seq0;
    let mut total_package = 0u32;
    let mut read_offset = offset;

    loop {
        while shared.in_flight(next_seq) >= shared.window() {
            if shared.closed.load(Ordering::Acquire) {
                return Ok((next_seq, total_package));
            }
            if shared.in_flight(next_seq) >= shared.rwnd() as u32 {
                let probe = Content::WindowProbe.into_sender_frame(sign, next_seq);
                push_frame(shared, next_seq, probe.clone());
                socket.send_to(&probe.encode(cfg.mss), peer)?;
                next_seq += 1;
                total_package += 1;
            }
            thread::sleep(TX_SATURATED_SLEEP);
        }
        if shared.closed.load(Ordering::Acquire) {
            return Ok((next_seq, total_package));
        }

        let chunk = store.read_range(read_offset, cfg.mss)?;
        let frame = if chunk.is_empty() {
            Content::Fin.into_sender_frame(sign, next_seq)
        } else {
            read_offset += chunk.len() as u64;
            Content::Data(chunk).into_sender_frame(sign, next_seq)
        };
        let is_fin = frame.wnd == crate::config::DONE;

        push_frame(shared, next_seq, frame.clone());
        socket.send_to(&frame.encode(cfg.mss), peer)?;
        next_seq += 1;
        total_package += 1;

        if is_fin {
            info!("sender {sign}: sent FIN at seq {}", next_seq - 1);
            shared.closed.store(true, Ordering::Release);
            return Ok((next_seq, total_package));
        }
    }
}

fn push_frame(shared: &SharedState, seq: u32, raw: RawFrame) {
    shared.buffer.lock().unwrap().push_back(BufferedFrame {
        seq,
        raw,
        sent_at: Instant::now(),
        retransmitted: false,
    });
}

/// Resends every currently-buffered frame in order, marking each as having
/// been retransmitted so the RTO estimator never samples it (Karn's
/// algorithm).
fn retransmit_buffered(
    socket: &dyn DatagramSocket,
    peer: SocketAddr,
    cfg: &SessionConfig,
    shared: &SharedState,
) -> Result<()> {
    let mut buffer = shared.buffer.lock().unwrap();
    for frame in buffer.iter_mut() {
        socket.send_to(&frame.raw.encode(cfg.mss), peer)?;
        frame.retransmitted = true;
    }
    Ok(())
}

/// Consumes ACKs, drives [`CongestionFsm`] and [`RtoEstimator`], and
/// retransmits on duplicate ACK or timeout. Returns `(total_timeouts,
/// total_fast_resends)`.
fn run_rx_task(
    socket: &dyn DatagramSocket,
    peer: SocketAddr,
    sign: u16,
    cfg: &SessionConfig,
    shared: &SharedState,
    observer: &dyn TelemetryObserver,
) -> Result<(u32, u32)> {
    let mut congestion = CongestionFsm::new(cfg.initial_ssthresh);
    let mut rto = RtoEstimator::new(cfg);
    let mut consecutive_timeouts = 0u32;

    loop {
        if shared.closed.load(Ordering::Acquire) && shared.buffer.lock().unwrap().is_empty() {
            break;
        }

        socket.set_read_timeout(Some(rto.rto()))?;
        let mut buf = vec![0u8; 8 + cfg.mss];
        let event = match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                buf.truncate(n);
                let raw = match RawFrame::decode(&buf, cfg.mss) {
                    Some(raw) => raw,
                    None => {
                        warn!("dropped malformed ACK from {from}");
                        continue;
                    }
                };
                if raw.sign != sign {
                    warn!("dropped ACK with sign {} from {from}, expected {sign}", raw.sign);
                    continue;
                }
                classify(raw, shared)
            }
            Err(e) if is_timeout(&e) => AckEvent::Timeout,
            Err(e) => return Err(e.into()),
        };

        match event {
            AckEvent::Ack {
                through_seq,
                rwnd_frames,
            } => {
                consecutive_timeouts = 0;
                shared.rwnd_frames.store(rwnd_frames as u32, Ordering::Release);
                congestion.note_forward_ack();

                let mut sample_rtt = None;
                {
                    let mut buffer = shared.buffer.lock().unwrap();
                    while let Some(front) = buffer.front() {
                        if front.seq >= through_seq {
                            break;
                        }
                        let popped = buffer.pop_front().unwrap();
                        congestion.on_ack_step();
                        if !popped.retransmitted {
                            sample_rtt = Some(popped.sent_at.elapsed());
                        }
                    }
                }
                shared.unacked_seq.store(through_seq, Ordering::Release);
                if let Some(rtt) = sample_rtt {
                    rto.sample(rtt);
                }

                shared
                    .window_frames
                    .store(congestion.window_frames(shared.rwnd()), Ordering::Release);
                observer.on_sample(rwnd_frames, congestion.cwnd, rto.rto());
            }
            AckEvent::Stale => {
                consecutive_timeouts = 0;
                congestion.note_stale_ack();
            }
            AckEvent::DupAck => {
                if congestion.note_dup_ack() {
                    thread::sleep(FAST_RETRANSMIT_SLEEP);
                    retransmit_buffered(socket, peer, cfg, shared)?;
                    congestion.enter_fast_recovery();
                    shared
                        .window_frames
                        .store(congestion.window_frames(shared.rwnd()), Ordering::Release);
                    observer.on_sample(shared.rwnd(), congestion.cwnd, rto.rto());
                }
            }
            AckEvent::Timeout => {
                consecutive_timeouts += 1;
                if consecutive_timeouts >= cfg.timeout_count {
                    congestion.close();
                    shared.closed.store(true, Ordering::Release);
                    warn!("sender {sign}: aborting after {consecutive_timeouts} ACK timeouts");
                    return Err(Error::SenderTimeout(consecutive_timeouts));
                }
                congestion.on_timeout();
                shared
                    .window_frames
                    .store(congestion.window_frames(shared.rwnd()), Ordering::Release);
                retransmit_buffered(socket, peer, cfg, shared)?;
                observer.on_sample(shared.rwnd(), congestion.cwnd, rto.rto());
            }
        }
    }

    congestion.close();
    Ok((congestion.total_timeouts, congestion.total_fast_resends))
}

/// Interprets a raw ACK frame against the sender's current `unacked_seq`.
fn classify(raw: RawFrame, shared: &SharedState) -> AckEvent {
    let content = Content::from_ack_frame(&raw);
    let rwnd_frames = match content {
        Content::Ack { rwnd_frames } => rwnd_frames,
        _ => unreachable!(),
    };
    let unacked = shared.unacked_seq.load(Ordering::Acquire);

    if raw.seq > unacked {
        AckEvent::Ack {
            through_seq: raw.seq,
            rwnd_frames,
        }
    } else if raw.seq == unacked {
        AckEvent::DupAck
    } else {
        AckEvent::Stale
    }
}
