//! Top-level orchestration: wires the handshake outcome into the sender or
//! receiver engine. This is the thin seam the demo binaries drive; it owns
//! no protocol state of its own.

use std::net::SocketAddr;
use std::sync::Arc;

use log::info;

use crate::config::{command, SessionConfig};
use crate::error::{Error, Result};
use crate::handshake::{negotiate_as_initiator, negotiate_as_responder, DataRole, HandshakeOutcome};
use crate::prompt::ResumeDecision;
use crate::receiver::{run_receiver, ReceiveOutcome};
use crate::sender::{run_sender, SendOutcome};
use crate::socket::DatagramSocket;
use crate::store::FileStore;
use crate::telemetry::TelemetryObserver;
use crate::wire::RawFrame;

/// What a completed session produced, for the caller's exit-code decision.
#[derive(Debug)]
pub enum SessionOutcome {
    Sent(SendOutcome),
    Received(ReceiveOutcome),
}

/// Runs a full client-side session: requests a port from the dispatcher,
/// negotiates the handshake as the initiator, then runs whichever engine the
/// negotiated role calls for. `store` backs both the handshake's file-info
/// comparison and, if it doesn't borrow-conflict, the data phase itself —
/// callers pass it in twice (once to negotiate, once owned for the engine)
/// since the engine threads take ownership for the session's lifetime.
#[allow(clippy::too_many_arguments)]
pub fn run_as_client(
    dispatcher_socket: &dyn DatagramSocket,
    dispatcher_addr: SocketAddr,
    session_socket: Arc<dyn DatagramSocket>,
    sign: u16,
    cfg: &SessionConfig,
    filename: &str,
    intent: DataRole,
    handshake_store: &mut dyn FileStore,
    data_store: Box<dyn FileStore>,
    decision: &dyn ResumeDecision,
    observer: Arc<dyn TelemetryObserver>,
) -> Result<SessionOutcome> {
    let port = request_session_port(dispatcher_socket, dispatcher_addr, sign, cfg)?;
    let mut peer = dispatcher_addr;
    peer.set_port(port);

    let outcome = negotiate_as_initiator(
        &*session_socket,
        peer,
        sign,
        crate::config::STARTNUM,
        cfg,
        filename,
        intent,
        handshake_store,
        decision,
    )?;

    run_data_phase(session_socket, cfg, outcome, data_store, observer)
}

/// Asks the dispatcher for a fresh per-session port, retrying with a new
/// `sign` if it reports a collision (§8 scenario 6).
fn request_session_port(
    socket: &dyn DatagramSocket,
    dispatcher_addr: SocketAddr,
    sign: u16,
    cfg: &SessionConfig,
) -> Result<u16> {
    let payload = format!("{}{}{}", command::REQUEST_PORT, crate::config::SPLITER, cfg.mss);
    let request = RawFrame {
        sign,
        wnd: cfg.default_rwnd,
        seq: crate::config::STARTNUM,
        payload: payload.into_bytes(),
    };
    socket.set_read_timeout(Some(cfg.handshake_timeout))?;
    socket.send_to(&request.encode(cfg.re_mss), dispatcher_addr)?;

    let mut buf = vec![0u8; 8 + cfg.re_mss];
    let (n, _from) = socket.recv_from(&mut buf)?;
    buf.truncate(n);
    let raw = RawFrame::decode(&buf, cfg.re_mss)
        .ok_or_else(|| Error::MalformedHandshake("bad port-reply frame".into()))?;

    let text = String::from_utf8_lossy(&raw.payload)
        .trim_end_matches('\0')
        .to_string();
    if text == command::RESET {
        return Err(Error::SignCollision(sign));
    }
    text.parse::<u16>()
        .map_err(|_| Error::MalformedHandshake(text))
}

/// Dispatches to the sender or receiver engine based on the negotiated role.
fn run_data_phase(
    socket: Arc<dyn DatagramSocket>,
    cfg: &SessionConfig,
    outcome: HandshakeOutcome,
    store: Box<dyn FileStore>,
    observer: Arc<dyn TelemetryObserver>,
) -> Result<SessionOutcome> {
    match outcome.role {
        DataRole::Sender => {
            info!("session {}: sending from offset {}", outcome.sign, outcome.offset);
            Ok(SessionOutcome::Sent(run_sender(
                socket,
                outcome.peer_addr,
                outcome.sign,
                outcome.seq,
                outcome.offset,
                cfg,
                store,
                observer,
            )?))
        }
        DataRole::Receiver => {
            info!("session {}: receiving at offset {}", outcome.sign, outcome.offset);
            Ok(SessionOutcome::Received(run_receiver(
                socket,
                outcome.peer_addr,
                outcome.sign,
                outcome.seq,
                outcome.offset,
                outcome.file_size,
                &outcome.file_md5,
                cfg,
                store,
            )?))
        }
    }
}

/// Runs a full server-side worker: the dispatcher has already allocated
/// `port` and relayed the peer's decoded intent; this negotiates the
/// responder leg on a socket bound to that port and then runs the data
/// phase. `store` is consulted during the handshake (hence `&mut`) and then
/// re-homed into the data-phase engine, matching the borrow the handshake
/// genuinely needs before ownership can move.
#[allow(clippy::too_many_arguments)]
pub fn run_as_server_worker(
    session_socket: Arc<dyn DatagramSocket>,
    peer: SocketAddr,
    sign: u16,
    cfg: &SessionConfig,
    filename: &str,
    peer_wants: DataRole,
    peer_reported_size: u64,
    peer_reported_md5: &str,
    mut store: Box<dyn FileStore>,
    observer: Arc<dyn TelemetryObserver>,
) -> Result<SessionOutcome> {
    let outcome = negotiate_as_responder(
        &*session_socket,
        peer,
        sign,
        crate::config::STARTNUM,
        cfg,
        filename,
        peer_wants,
        peer_reported_size,
        peer_reported_md5,
        &mut *store,
    )?;

    run_data_phase(session_socket, cfg, outcome, store, observer)
}
