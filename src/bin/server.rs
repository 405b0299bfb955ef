//! Minimal long-running host: listens on the dispatcher port and spawns one
//! worker thread per incoming session. Argument parsing, multi-file
//! recursion, and colorized output are the out-of-scope CLI's job — this is
//! just enough to drive the engine end to end.

use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use fxfer::config::{self, SessionConfig};
use fxfer::dispatcher::{Dispatcher, SessionRequest};
use fxfer::error::{Error, Result};
use fxfer::handshake::parse_intent;
use fxfer::session::run_as_server_worker;
use fxfer::socket::DatagramSocket;
use fxfer::store::{FileStore, LocalFile};
use fxfer::telemetry::NullObserver;
use fxfer::wire::RawFrame;

fn main() {
    env_logger::init();

    let bind_host = std::env::args().nth(1).unwrap_or_else(|| "127.0.0.1".to_string());
    let cfg = SessionConfig::default();

    let dispatcher_addr: SocketAddr = format!("{bind_host}:{}", config::DISPATCHER_PORT)
        .parse()
        .expect("invalid bind address");
    let dispatcher_socket = UdpSocket::bind(dispatcher_addr).expect("failed to bind dispatcher port");
    dispatcher_socket
        .set_read_timeout(Some(Duration::from_millis(200)))
        .expect("failed to set dispatcher read timeout");

    let dispatcher = Arc::new(Mutex::new(Dispatcher::new(dispatcher_socket, cfg)));
    log::info!("dispatcher listening on {dispatcher_addr}");

    loop {
        let served = dispatcher.lock().unwrap().serve_one();
        match served {
            Ok(Some((port, request))) => {
                let dispatcher = dispatcher.clone();
                let bind_host = bind_host.clone();
                let sign = request.sign;
                thread::spawn(move || {
                    if let Err(e) = serve_session(&bind_host, port, request, cfg) {
                        log::warn!("session {sign} on port {port} failed: {e}");
                    }
                    dispatcher.lock().unwrap().release(sign, port);
                });
            }
            Ok(None) => continue,
            Err(e) => log::warn!("dispatcher error: {e}"),
        }
    }
}

fn serve_session(
    bind_host: &str,
    port: u16,
    request: SessionRequest,
    cfg: SessionConfig,
) -> Result<()> {
    let bind_addr: SocketAddr = format!("{bind_host}:{port}").parse().unwrap();
    let socket = UdpSocket::bind(bind_addr)?;
    socket.set_read_timeout(Some(cfg.handshake_timeout))?;

    let mut buf = vec![0u8; 8 + cfg.mss];
    let (n, peer) = socket.recv_from(&mut buf)?;
    buf.truncate(n);
    let raw = RawFrame::decode(&buf, cfg.mss)
        .ok_or_else(|| Error::MalformedHandshake("bad intent frame".into()))?;
    let intent = parse_intent(&raw)?;

    log::info!(
        "session {}: {peer} wants to {:?} {}",
        request.sign, intent.wants, intent.filename
    );

    let store: Box<dyn FileStore> = Box::new(LocalFile::new(format!("received/{}", intent.filename)));
    let observer: Arc<dyn fxfer::telemetry::TelemetryObserver> = Arc::new(NullObserver);
    let socket: Arc<dyn DatagramSocket> = Arc::new(socket);

    run_as_server_worker(
        socket,
        peer,
        request.sign,
        &cfg,
        &intent.filename,
        intent.wants,
        intent.reported_size,
        &intent.reported_md5,
        store,
        observer,
    )?;
    Ok(())
}
