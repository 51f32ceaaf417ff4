#![allow(dead_code)]

use duplexio::net::{ByteChannel, ReadOutcome, TcpAcceptor, TcpChannel};

use std::sync::Once;
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Installs a test subscriber once per test binary.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// A connected loopback pair: `(client, server)`.
pub fn connected_pair() -> (TcpChannel, TcpChannel) {
    let acceptor = TcpAcceptor::bind("127.0.0.1:0").expect("Failed to bind acceptor");
    let addr = acceptor.local_addr().expect("Failed to get local address");

    let client = TcpChannel::connect(addr).expect("Failed to connect");
    let (server, _) = acceptor.accept().expect("Failed to accept connection");

    (client, server)
}

/// Reads until end-of-stream.
pub fn read_to_end(channel: &impl ByteChannel) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0u8; 1024];

    while let ReadOutcome::Data(n) = channel.read(&mut buf).expect("Failed to read") {
        received.extend_from_slice(&buf[..n]);
    }

    received
}
