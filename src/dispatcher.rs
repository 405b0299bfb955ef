//! Session dispatcher (§4.2): listens on the well-known port, hands each new
//! peer a fresh port to continue on, and tracks which signs/ports are
//! currently live.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use log::{info, warn};

use crate::config::{self, command, SessionConfig};
use crate::error::{Error, Result};
use crate::socket::{is_timeout, DatagramSocket};
use crate::wire::RawFrame;

/// A freshly arrived REQUESTPORT, with the session worker's future address.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub sign: u16,
    pub client_rwnd: u16,
    pub client_mss: usize,
    pub peer_addr: SocketAddr,
}

/// Hands out session ports starting at [`config::STARTPORT`], wrapping to
/// [`config::PORT_WRAP`] once the range is exhausted, per §9's "port-release
/// tracking" resolution.
#[derive(Debug)]
pub struct PortAllocator {
    next: u16,
    in_use: HashSet<u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        PortAllocator {
            next: config::STARTPORT,
            in_use: HashSet::new(),
        }
    }

    /// Allocates the next free port, wrapping once and failing with
    /// [`Error::PortsExhausted`] if every port in the range is already live.
    pub fn allocate(&mut self) -> Result<u16> {
        let start = self.next;
        loop {
            let candidate = self.next;
            self.next = self.next.checked_add(1).unwrap_or(config::PORT_WRAP);
            if !self.in_use.contains(&candidate) {
                self.in_use.insert(candidate);
                return Ok(candidate);
            }
            if self.next == start {
                return Err(Error::PortsExhausted);
            }
        }
    }

    pub fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_nul(payload: &[u8]) -> &[u8] {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    &payload[..end]
}

/// Owns the well-known-port socket and the live-sign/port-allocation tables.
pub struct Dispatcher<S: DatagramSocket> {
    socket: S,
    cfg: SessionConfig,
    used: HashMap<u16, SocketAddr>,
    ports: PortAllocator,
}

impl<S: DatagramSocket> Dispatcher<S> {
    pub fn new(socket: S, cfg: SessionConfig) -> Self {
        Dispatcher {
            socket,
            cfg,
            used: HashMap::new(),
            ports: PortAllocator::new(),
        }
    }

    /// Services one incoming REQUESTPORT datagram, if any arrived before the
    /// socket's read timeout. Returns `Ok(None)` for a timeout, a malformed
    /// frame, an unrecognized command, or a same-peer retry of a sign
    /// already in flight (all dropped, matching §4.2's "ignore" rule) — only
    /// a genuinely new request yields `Some`.
    pub fn serve_one(&mut self) -> Result<Option<(u16, SessionRequest)>> {
        let mut buf = vec![0u8; 8 + self.cfg.re_mss];
        let (n, peer) = match self.socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(e) if is_timeout(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        buf.truncate(n);

        let raw = match RawFrame::decode(&buf, self.cfg.re_mss) {
            Some(raw) => raw,
            None => {
                warn!("dropped malformed port-request datagram from {peer}");
                return Ok(None);
            }
        };

        if raw.seq != config::STARTNUM {
            warn!("dropped out-of-sequence port-request from {peer}");
            return Ok(None);
        }

        let text = String::from_utf8_lossy(trim_nul(&raw.payload)).into_owned();
        let mut parts = text.splitn(2, config::SPLITER);
        let cmd = parts.next().unwrap_or_default();
        if cmd != command::REQUEST_PORT {
            warn!("dropped unrecognized dispatcher command {cmd:?} from {peer}");
            return Ok(None);
        }
        let client_mss: usize = match parts.next().and_then(|s| s.parse().ok()) {
            Some(mss) => mss,
            None => {
                warn!("dropped port-request with unparsable MSS from {peer}");
                return Ok(None);
            }
        };

        if let Some(&existing) = self.used.get(&raw.sign) {
            if existing != peer {
                warn!("sign {} already in use by {existing}, resetting {peer}", raw.sign);
                let reset = RawFrame {
                    sign: raw.sign,
                    wnd: raw.wnd,
                    seq: raw.seq,
                    payload: command::RESET.as_bytes().to_vec(),
                };
                self.socket.send_to(&reset.encode(self.cfg.re_mss), peer)?;
            }
            return Ok(None);
        }

        let port = self.ports.allocate()?;
        self.used.insert(raw.sign, peer);
        info!("dispatching sign {} from {peer} to port {port}", raw.sign);

        let reply = RawFrame {
            sign: raw.sign,
            wnd: raw.wnd,
            seq: raw.seq,
            payload: port.to_string().into_bytes(),
        };
        self.socket.send_to(&reply.encode(self.cfg.re_mss), peer)?;

        Ok(Some((
            port,
            SessionRequest {
                sign: raw.sign,
                client_rwnd: raw.wnd,
                client_mss,
                peer_addr: peer,
            },
        )))
    }

    /// Releases a sign/port pair once its session worker has finished.
    pub fn release(&mut self, sign: u16, port: u16) {
        self.used.remove(&sign);
        self.ports.release(port);
    }
}
