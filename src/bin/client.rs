//! Minimal initiator: requests a port from a running server, negotiates the
//! handshake, and runs one send or receive to completion. Directory
//! recursion and a real argument parser are the out-of-scope CLI's job.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use rand::Rng;

use fxfer::config::{self, SessionConfig};
use fxfer::handshake::DataRole;
use fxfer::prompt::AlwaysCosend;
use fxfer::session::run_as_client;
use fxfer::socket::DatagramSocket;
use fxfer::store::{FileStore, LocalFile};
use fxfer::telemetry::NullObserver;

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let usage = "usage: fxfer-client <host> <send|receive> <path>";
    let host = args.next().expect(usage);
    let mode = args.next().expect(usage);
    let path = args.next().expect(usage);

    let intent = match mode.as_str() {
        "send" => DataRole::Sender,
        "receive" => DataRole::Receiver,
        other => panic!("unknown mode {other:?}, expected send or receive"),
    };

    let cfg = SessionConfig::default();
    let dispatcher_addr: SocketAddr = format!("{host}:{}", config::DISPATCHER_PORT)
        .parse()
        .expect("invalid host");

    let dispatcher_socket = UdpSocket::bind("0.0.0.0:0").expect("failed to bind local port");
    let session_socket = UdpSocket::bind("0.0.0.0:0").expect("failed to bind session port");
    let session_socket: Arc<dyn DatagramSocket> = Arc::new(session_socket);

    let sign: u16 = rand::thread_rng().gen();
    let filename = path
        .rsplit('/')
        .next()
        .unwrap_or(path.as_str())
        .to_string();

    let mut handshake_store = LocalFile::new(&path);
    let data_store: Box<dyn FileStore> = Box::new(LocalFile::new(&path));
    let decision = AlwaysCosend;
    let observer: Arc<dyn fxfer::telemetry::TelemetryObserver> = Arc::new(NullObserver);

    let outcome = run_as_client(
        &dispatcher_socket,
        dispatcher_addr,
        session_socket,
        sign,
        &cfg,
        &filename,
        intent,
        &mut handshake_store,
        data_store,
        &decision,
        observer,
    )
    .expect("session failed");

    println!("{outcome:?}");
}
