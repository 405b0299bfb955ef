//! Two-leg handshake (§4.3): negotiates data-phase role, filename, size,
//! MD5, and produces a starting offset and RESEND/COSEND decision.
//!
//! The initiator (`C`, whoever spoke to the dispatcher first) always holds
//! final say over RESEND vs COSEND — only `C` is driven by an interactive
//! operator, so only `C`'s [`ResumeDecision`] is ever consulted, regardless
//! of which data-phase role it ends up playing. Whichever side plays
//! [`DataRole::Sender`] classifies eligibility, since only the authoritative
//! (complete) copy can be compared against a peer's partial prefix (§3).

use std::net::SocketAddr;

use log::{info, warn};

use crate::config::{command, SessionConfig};
use crate::error::{Error, Result};
use crate::fileinfo::{classify_resume, file_info, Resume};
use crate::prompt::{ResumeDecision, ResumePolicy};
use crate::socket::{is_timeout, DatagramSocket};
use crate::store::FileStore;
use crate::wire::RawFrame;

/// Which side of the data phase this peer will play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRole {
    Sender,
    Receiver,
}

/// Everything the data phase needs, handed off by a completed handshake.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub peer_addr: SocketAddr,
    pub sign: u16,
    pub seq: u32,
    pub role: DataRole,
    pub offset: u64,
    pub file_size: u64,
    pub file_md5: String,
}

fn encode_text(sign: u16, seq: u32, wnd: u16, text: &str) -> RawFrame {
    RawFrame {
        sign,
        wnd,
        seq,
        payload: text.as_bytes().to_vec(),
    }
}

fn trim_nul(payload: &[u8]) -> &[u8] {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    &payload[..end]
}

fn decode_text(raw: &RawFrame) -> String {
    String::from_utf8_lossy(trim_nul(&raw.payload)).into_owned()
}

/// Sends `frame`, retrying on receive-timeout with the same bytes, until a
/// reply with matching `sign` and `seq` arrives. Frames from the wrong peer,
/// wrong sign, or wrong seq are dropped without counting against the retry
/// budget. Aborts with [`Error::HandshakeTimeout`] after
/// `cfg.handshake_timeout_count` consecutive timeouts.
fn send_until_reply(
    socket: &dyn DatagramSocket,
    peer: &mut SocketAddr,
    cfg: &SessionConfig,
    frame: &RawFrame,
) -> Result<RawFrame> {
    socket.set_read_timeout(Some(cfg.handshake_timeout))?;
    let encoded = frame.encode(cfg.mss);

    let mut timeouts = 0u32;
    loop {
        socket.send_to(&encoded, *peer)?;

        let mut buf = vec![0u8; 8 + cfg.mss];
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => {
                buf.truncate(n);
                let reply = match RawFrame::decode(&buf, cfg.mss) {
                    Some(r) => r,
                    None => {
                        warn!("dropped malformed handshake datagram from {from}");
                        continue;
                    }
                };
                if reply.sign != frame.sign || reply.seq != frame.seq {
                    warn!(
                        "dropped unexpected handshake frame (sign {}, seq {}) from {from}",
                        reply.sign, reply.seq
                    );
                    continue;
                }
                *peer = from;
                return Ok(reply);
            }
            Err(e) if is_timeout(&e) => {
                timeouts += 1;
                if timeouts == cfg.handshake_timeout_count {
                    return Err(Error::HandshakeTimeout(timeouts));
                }
                warn!("handshake leg timed out ({timeouts}/{}), resending", cfg.handshake_timeout_count);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Runs the handshake as `C`, the initiator: speaks first, and holds final
/// say over RESEND vs COSEND.
#[allow(clippy::too_many_arguments)]
pub fn negotiate_as_initiator(
    socket: &dyn DatagramSocket,
    mut peer: SocketAddr,
    sign: u16,
    seq0: u32,
    cfg: &SessionConfig,
    filename: &str,
    intent: DataRole,
    store: &mut dyn FileStore,
    decision: &dyn ResumeDecision,
) -> Result<HandshakeOutcome> {
    let mut seq = seq0;
    let own_info = file_info(store)?;

    let command_token = match intent {
        DataRole::Sender => command::SEND,
        DataRole::Receiver => command::RECEIVE,
    };
    let payload = format!(
        "{command_token}{sep}{filename}{sep}{size}{sep}{md5}",
        sep = crate::config::SPLITER,
        size = own_info.size,
        md5 = own_info.md5_hex,
    );
    let intent_frame = encode_text(sign, seq, cfg.default_rwnd, &payload);

    let reply = send_until_reply(socket, &mut peer, cfg, &intent_frame)?;
    seq += 1;
    let reply_text = decode_text(&reply);
    let mut parts = reply_text.splitn(3, crate::config::SPLITER);

    match intent {
        DataRole::Sender => {
            // S (Receiver) reported its own (possibly partial) file: no tag.
            let peer_size: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::MalformedHandshake(reply_text.clone()))?;
            let peer_md5 = parts
                .next()
                .ok_or_else(|| Error::MalformedHandshake(reply_text.clone()))?;

            let resume = classify_resume(store, peer_size, peer_md5)?;
            let final_token = resolve_decision(resume, decision, filename, peer_size);
            let offset = if final_token == command::COSEND { peer_size } else { 0 };

            let decision_frame = encode_text(sign, seq, cfg.default_rwnd, final_token);
            socket.send_to(&decision_frame.encode(cfg.mss), peer)?;

            info!("handshake complete, sending {filename} from offset {offset}");
            Ok(HandshakeOutcome {
                peer_addr: peer,
                sign,
                seq: seq + 1,
                role: DataRole::Sender,
                offset,
                file_size: own_info.size,
                file_md5: own_info.md5_hex,
            })
        }
        DataRole::Receiver => {
            let tag = parts.next().ok_or_else(|| Error::MalformedHandshake(reply_text.clone()))?;
            if tag == command::FILE_NOT_FOUND {
                return Err(Error::FileNotFound);
            }
            let peer_size: u64 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::MalformedHandshake(reply_text.clone()))?;
            let peer_md5 = parts
                .next()
                .ok_or_else(|| Error::MalformedHandshake(reply_text.clone()))?
                .to_string();

            let eligible = tag == command::COSEND;
            let final_token = if eligible {
                match decision.decide(filename, own_info.size) {
                    ResumePolicy::Cosend => command::COSEND,
                    ResumePolicy::Resend => command::RESEND,
                }
            } else {
                command::RESEND
            };
            let offset = if final_token == command::COSEND { own_info.size } else { 0 };

            let decision_frame = encode_text(sign, seq, cfg.default_rwnd, final_token);
            socket.send_to(&decision_frame.encode(cfg.mss), peer)?;

            info!("handshake complete, receiving {filename} at offset {offset}");
            Ok(HandshakeOutcome {
                peer_addr: peer,
                sign,
                seq: seq + 1,
                role: DataRole::Receiver,
                offset,
                file_size: peer_size,
                file_md5: peer_md5,
            })
        }
    }
}

/// Runs the handshake as `S`, the per-session responder: the dispatcher has
/// already relayed the peer's first intent frame out of band (it was
/// consumed to decide which port to spawn this worker on).
#[allow(clippy::too_many_arguments)]
pub fn negotiate_as_responder(
    socket: &dyn DatagramSocket,
    mut peer: SocketAddr,
    sign: u16,
    mut seq: u32,
    cfg: &SessionConfig,
    filename: &str,
    peer_wants: DataRole,
    peer_reported_size: u64,
    peer_reported_md5: &str,
    store: &mut dyn FileStore,
) -> Result<HandshakeOutcome> {
    let own_info = file_info(store)?;

    let my_role = match peer_wants {
        DataRole::Sender => DataRole::Receiver,
        DataRole::Receiver => DataRole::Sender,
    };

    let reply_payload = match my_role {
        DataRole::Receiver => {
            // Peer is authoritative; we just report our own current file.
            format!(
                "{size}{sep}{md5}",
                sep = crate::config::SPLITER,
                size = own_info.size,
                md5 = own_info.md5_hex,
            )
        }
        DataRole::Sender => {
            if !store.exists() {
                let reply = encode_text(sign, seq, cfg.default_rwnd, command::FILE_NOT_FOUND);
                socket.send_to(&reply.encode(cfg.mss), peer)?;
                return Err(Error::FileNotFound);
            }
            let resume = classify_resume(store, peer_reported_size, peer_reported_md5)?;
            let tag = match resume {
                Resume::Resend => command::RESEND,
                Resume::CosendEligible => command::COSEND,
            };
            format!(
                "{tag}{sep}{size}{sep}{md5}",
                sep = crate::config::SPLITER,
                size = own_info.size,
                md5 = own_info.md5_hex,
            )
        }
    };

    let reply_frame = encode_text(sign, seq, cfg.default_rwnd, &reply_payload);
    seq += 1;
    socket.set_read_timeout(Some(cfg.handshake_timeout))?;

    let decision_frame = {
        let encoded = reply_frame.encode(cfg.mss);
        let mut timeouts = 0u32;
        loop {
            socket.send_to(&encoded, peer)?;
            let mut buf = vec![0u8; 8 + cfg.mss];
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    buf.truncate(n);
                    let frame = match RawFrame::decode(&buf, cfg.mss) {
                        Some(f) => f,
                        None => {
                            warn!("dropped malformed handshake datagram from {from}");
                            continue;
                        }
                    };
                    if frame.sign != sign || frame.seq != seq {
                        warn!(
                            "dropped unexpected handshake frame (sign {}, seq {}) from {from}",
                            frame.sign, frame.seq
                        );
                        continue;
                    }
                    peer = from;
                    break frame;
                }
                Err(e) if is_timeout(&e) => {
                    timeouts += 1;
                    if timeouts == cfg.handshake_timeout_count {
                        return Err(Error::HandshakeTimeout(timeouts));
                    }
                    warn!(
                        "handshake leg timed out ({timeouts}/{}), resending",
                        cfg.handshake_timeout_count
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    };

    let final_token = decode_text(&decision_frame);
    let offset = match my_role {
        DataRole::Receiver => {
            if final_token == command::COSEND {
                own_info.size
            } else {
                0
            }
        }
        DataRole::Sender => {
            if final_token == command::COSEND {
                peer_reported_size
            } else {
                0
            }
        }
    };

    let (file_size, file_md5) = match my_role {
        DataRole::Sender => (own_info.size, own_info.md5_hex.clone()),
        DataRole::Receiver => (peer_reported_size, peer_reported_md5.to_string()),
    };

    info!("handshake complete as responder: {filename} role={my_role:?} offset={offset}");
    Ok(HandshakeOutcome {
        peer_addr: peer,
        sign,
        seq: seq + 1,
        role: my_role,
        offset,
        file_size,
        file_md5,
    })
}

fn resolve_decision(
    resume: Resume,
    decision: &dyn ResumeDecision,
    filename: &str,
    peer_prefix_len: u64,
) -> &'static str {
    match resume {
        Resume::Resend => command::RESEND,
        Resume::CosendEligible => match decision.decide(filename, peer_prefix_len) {
            ResumePolicy::Cosend => command::COSEND,
            ResumePolicy::Resend => command::RESEND,
        },
    }
}

/// The intent a dispatcher worker decodes from `C`'s first datagram, before
/// calling [`negotiate_as_responder`].
#[derive(Debug, Clone)]
pub struct PeerIntent {
    pub filename: String,
    pub wants: DataRole,
    pub reported_size: u64,
    pub reported_md5: String,
}

/// Parses the intent-frame payload grammar:
/// `("s"|"r") "$^!&" filename "$^!&" size "$^!&" md5hex`.
pub fn parse_intent(raw: &RawFrame) -> Result<PeerIntent> {
    let text = decode_text(raw);
    let mut parts = text.splitn(4, crate::config::SPLITER);
    let cmd = parts.next().ok_or_else(|| Error::MalformedHandshake(text.clone()))?;
    let wants = match cmd {
        command::SEND => DataRole::Sender,
        command::RECEIVE => DataRole::Receiver,
        other => return Err(Error::UnexpectedToken(other.to_string())),
    };
    let filename = parts
        .next()
        .ok_or_else(|| Error::MalformedHandshake(text.clone()))?
        .to_string();
    let reported_size: u64 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::MalformedHandshake(text.clone()))?;
    let reported_md5 = parts
        .next()
        .ok_or_else(|| Error::MalformedHandshake(text.clone()))?
        .to_string();

    Ok(PeerIntent {
        filename,
        wants,
        reported_size,
        reported_md5,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{AlwaysCosend, AlwaysResend};
    use crate::store::LocalFile;
    use std::collections::VecDeque;
    use std::io;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn addr() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    /// One direction of a loopback pair: `send_to` pushes straight into the
    /// peer's queue (shared via `Arc`), so there is no separate pump step —
    /// `Mutex` (not `RefCell`) lets the two sides run on separate threads.
    struct LoopbackHalf {
        incoming: Arc<Mutex<VecDeque<Vec<u8>>>>,
        outgoing: Arc<Mutex<VecDeque<Vec<u8>>>>,
    }

    impl DatagramSocket for LoopbackHalf {
        fn send_to(&self, buf: &[u8], _addr: SocketAddr) -> io::Result<usize> {
            self.outgoing.lock().unwrap().push_back(buf.to_vec());
            Ok(buf.len())
        }

        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            match self.incoming.lock().unwrap().pop_front() {
                Some(data) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), addr()))
                }
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "empty")),
            }
        }

        fn set_read_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }

    fn loopback_pair() -> (LoopbackHalf, LoopbackHalf) {
        let c_to_s = Arc::new(Mutex::new(VecDeque::new()));
        let s_to_c = Arc::new(Mutex::new(VecDeque::new()));
        (
            LoopbackHalf {
                incoming: s_to_c.clone(),
                outgoing: c_to_s.clone(),
            },
            LoopbackHalf {
                incoming: c_to_s,
                outgoing: s_to_c,
            },
        )
    }

    fn cfg() -> SessionConfig {
        let mut c = SessionConfig::default();
        c.handshake_timeout = Duration::from_millis(10);
        c.handshake_timeout_count = 2;
        c
    }

    /// Drives a full initiator/responder exchange across two threads over a
    /// pair of directly cross-wired in-memory queues.
    fn run_pair(
        initiator_intent: DataRole,
        initiator_store: &mut (dyn FileStore + Send),
        responder_store: &mut (dyn FileStore + Send),
        decision: &(dyn ResumeDecision + Sync),
        filename: &str,
    ) -> (HandshakeOutcome, HandshakeOutcome) {
        let cfg = cfg();
        let (c_sock, s_sock) = loopback_pair();

        let own_info = file_info(initiator_store).unwrap();
        let payload = format!(
            "{}{}{}{}{}{}{}",
            match initiator_intent {
                DataRole::Sender => command::SEND,
                DataRole::Receiver => command::RECEIVE,
            },
            crate::config::SPLITER,
            filename,
            crate::config::SPLITER,
            own_info.size,
            crate::config::SPLITER,
            own_info.md5_hex,
        );
        let intent_frame = encode_text(7, 0, cfg.default_rwnd, &payload);
        let intent_wire = intent_frame.encode(cfg.mss);
        let peer_intent = parse_intent(&RawFrame::decode(&intent_wire, cfg.mss).unwrap()).unwrap();

        let (initiator, responder) = std::thread::scope(|scope| {
            let responder_handle = scope.spawn(|| {
                negotiate_as_responder(
                    &s_sock,
                    addr(),
                    7,
                    0,
                    &cfg,
                    &peer_intent.filename,
                    peer_intent.wants,
                    peer_intent.reported_size,
                    &peer_intent.reported_md5,
                    responder_store,
                )
            });

            let initiator_result = negotiate_as_initiator(
                &c_sock,
                addr(),
                7,
                0,
                &cfg,
                filename,
                initiator_intent,
                initiator_store,
                decision,
            );
            let responder_result = responder_handle.join().unwrap();
            (initiator_result, responder_result)
        });

        (initiator.unwrap(), responder.unwrap())
    }

    #[test]
    fn fresh_send_from_initiator_resends_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut sender_store = LocalFile::new(dir.path().join("src.bin"));
        std::fs::write(dir.path().join("src.bin"), b"0123456789").unwrap();
        let mut receiver_store = LocalFile::new(dir.path().join("dst.bin"));

        let (c, s) = run_pair(
            DataRole::Sender,
            &mut sender_store,
            &mut receiver_store,
            &AlwaysResend,
            "f.bin",
        );
        assert_eq!(c.role, DataRole::Sender);
        assert_eq!(c.offset, 0);
        assert_eq!(s.role, DataRole::Receiver);
        assert_eq!(s.offset, 0);
        assert_eq!(s.file_size, 10);
    }

    #[test]
    fn matching_prefix_cosends_when_policy_allows() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src.bin"), b"0123456789abcdef").unwrap();
        let mut sender_store = LocalFile::new(dir.path().join("src.bin"));

        std::fs::write(dir.path().join("dst.bin"), b"01234567").unwrap();
        let mut receiver_store = LocalFile::new(dir.path().join("dst.bin"));

        let (c, s) = run_pair(
            DataRole::Sender,
            &mut sender_store,
            &mut receiver_store,
            &AlwaysCosend,
            "f.bin",
        );
        assert_eq!(c.offset, 8);
        assert_eq!(s.offset, 8);
    }

    #[test]
    fn initiator_receiving_can_downgrade_cosend_to_resend() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src.bin"), b"0123456789abcdef").unwrap();
        let mut sender_store = LocalFile::new(dir.path().join("src.bin"));
        std::fs::write(dir.path().join("dst.bin"), b"01234567").unwrap();
        let mut receiver_store = LocalFile::new(dir.path().join("dst.bin"));

        // Now the initiator is the Receiver; decision authority is C.
        let (c, s) = run_pair(
            DataRole::Receiver,
            &mut receiver_store,
            &mut sender_store,
            &AlwaysResend,
            "f.bin",
        );
        assert_eq!(c.role, DataRole::Receiver);
        assert_eq!(c.offset, 0);
        assert_eq!(s.role, DataRole::Sender);
        assert_eq!(s.offset, 0);
    }

    #[test]
    fn responder_missing_file_reports_file_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut receiver_store = LocalFile::new(dir.path().join("dst.bin"));
        let mut missing_sender_store = LocalFile::new(dir.path().join("missing.bin"));

        let cfg = cfg();
        let (_c_sock, s_sock) = loopback_pair();
        let own_info = file_info(&mut receiver_store).unwrap();
        let payload = format!(
            "{}{}{}{}{}{}{}",
            command::RECEIVE,
            crate::config::SPLITER,
            "f.bin",
            crate::config::SPLITER,
            own_info.size,
            crate::config::SPLITER,
            own_info.md5_hex,
        );
        let intent_frame = encode_text(7, 0, cfg.default_rwnd, &payload);
        let intent_wire = intent_frame.encode(cfg.mss);
        let peer_intent = parse_intent(&RawFrame::decode(&intent_wire, cfg.mss).unwrap()).unwrap();

        let result = negotiate_as_responder(
            &s_sock,
            addr(),
            7,
            0,
            &cfg,
            &peer_intent.filename,
            peer_intent.wants,
            peer_intent.reported_size,
            &peer_intent.reported_md5,
            &mut missing_sender_store,
        );
        assert!(matches!(result, Err(Error::FileNotFound)));
    }
}
