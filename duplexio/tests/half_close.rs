mod common;

#[cfg(test)]
mod tests {
    use super::common::{connected_pair, init_test_logging, read_to_end};

    use duplexio::net::{ByteChannel, ReadOutcome, TcpAcceptor, TcpChannel};
    use duplexio::state::Phase;
    use duplexio::{Error, ErrorKind};

    use std::thread;
    use std::time::Duration;

    const READ_TIMEOUT: Option<Duration> = Some(Duration::from_secs(1));

    fn read_byte(channel: &TcpChannel) -> ReadOutcome {
        let mut buf = [0u8; 1];
        let outcome = channel.read(&mut buf).expect("Failed to read");

        if outcome == ReadOutcome::Data(1) {
            assert_eq!(buf[0], 1);
        }

        outcome
    }

    /// Client and server exchange one byte each, the server shutting down
    /// its output after its byte.
    fn exchange_then_server_oshut() -> (TcpChannel, TcpChannel) {
        let (client, server) = connected_pair();

        client.set_read_timeout(READ_TIMEOUT);
        server.set_read_timeout(READ_TIMEOUT);

        client.write_all(&[1]).expect("Failed to write");
        assert_eq!(read_byte(&server), ReadOutcome::Data(1));

        server.write_all(&[1]).expect("Failed to write");
        server.shutdown_output().expect("Failed to shut down output");

        assert_eq!(read_byte(&client), ReadOutcome::Data(1));

        (client, server)
    }

    #[test]
    fn test_half_close() {
        init_test_logging();

        let (client, server) = connected_pair();

        client.write_all(b"request").expect("Failed to write request");
        client.shutdown_output().expect("Failed to shut down client output");

        assert_eq!(read_to_end(&server), b"request");
        assert_eq!(
            server.read(&mut [0u8; 8]).expect("Failed to read"),
            ReadOutcome::EndOfStream
        );

        // Seeing end-of-stream does not close the local input.
        assert!(!server.is_input_shutdown());
        assert!(!server.is_output_shutdown());
        assert_eq!(server.phase(), Phase::BothOpen);

        server.write_all(b"response").expect("Failed to write response");
        server.shutdown_output().expect("Failed to shut down server output");

        assert_eq!(read_to_end(&client), b"response");

        assert!(client.is_output_shutdown());
        assert!(!client.is_input_shutdown());
        assert_eq!(client.phase(), Phase::HalfShut);

        client.close();
        server.close();

        assert!(client.is_closed());
        assert!(server.is_closed());
    }

    #[test]
    fn test_half_close_client_server() {
        init_test_logging();

        let acceptor = TcpAcceptor::bind("127.0.0.1:0").expect("Failed to bind acceptor");
        let addr = acceptor.local_addr().expect("Failed to get local address");

        let server = thread::spawn(move || {
            let (channel, _) = acceptor.accept().expect("Failed to accept connection");

            let request = read_to_end(&channel);
            assert!(!channel.is_input_shutdown());

            channel.write_all(&request).expect("Failed to echo request");
            channel.shutdown_output().expect("Failed to shut down output");

            // Input is still open after our own output shutdown; the peer
            // already finished, so it reads end-of-stream again.
            assert_eq!(
                channel.read(&mut [0u8; 4]).expect("Failed to read"),
                ReadOutcome::EndOfStream
            );

            channel.close();
        });

        let client = TcpChannel::connect(addr).expect("Failed to connect");
        client.write_all(b"Hello World").expect("Failed to write");
        client.shutdown_output().expect("Failed to shut down output");

        assert_eq!(read_to_end(&client), b"Hello World");

        server.join().expect("Server thread panicked");
    }

    #[test]
    fn test_half_close_full_teardown() {
        init_test_logging();

        let (client, server) = exchange_then_server_oshut();

        // Client reads end-of-stream, then tears down step by step.
        assert_eq!(read_byte(&client), ReadOutcome::EndOfStream);
        assert!(!client.is_input_shutdown());

        client.shutdown_input().expect("Failed to shut down input");
        client.shutdown_output().expect("Failed to shut down output");
        client.close();
        assert!(client.is_closed());

        // Server sees the teardown as end-of-stream. Platforms that report
        // the final FIN as a reset surface it as one.
        let mut buf = [0u8; 1];
        match server.read(&mut buf) {
            Ok(outcome) => assert_eq!(outcome, ReadOutcome::EndOfStream),
            Err(err) if cfg!(not(target_os = "linux")) => {
                assert_eq!(err.kind(), ErrorKind::ConnectionReset);
            }
            Err(err) => panic!("unexpected error: {err:?}"),
        }
        assert!(!server.is_input_shutdown());

        server.shutdown_input().expect("Failed to shut down input");
        assert!(server.is_input_shutdown());

        // Nothing closes the server but an explicit close.
        assert!(!server.is_closed());
        assert_eq!(server.phase(), Phase::FullShut);

        server.close();
        assert!(server.is_closed());
    }

    #[test]
    fn test_half_close_write_after_eof() {
        init_test_logging();

        let (client, server) = exchange_then_server_oshut();

        assert_eq!(read_byte(&client), ReadOutcome::EndOfStream);
        assert!(!client.is_input_shutdown());

        // Half closed: the client can still write and the server read.
        client.write_all(&[1]).expect("Failed to write after end-of-stream");
        assert_eq!(read_byte(&server), ReadOutcome::Data(1));

        server.close();

        // End-of-stream again, not a broken connection.
        assert_eq!(read_byte(&client), ReadOutcome::EndOfStream);
        assert!(!client.is_input_shutdown());

        thread::sleep(Duration::from_millis(100));

        assert_eq!(read_byte(&client), ReadOutcome::EndOfStream);
        assert!(!client.is_input_shutdown());

        // The first write to the closed peer is still accepted locally.
        client.write_all(&[1]).expect("Failed to write to closed peer");

        let mut failure = None;

        for _ in 0..100_000 {
            if let Err(err) = client.write(&[1]) {
                failure = Some(err);
                break;
            }
        }

        let err = failure.expect("Writes to a closed peer never failed");
        assert!(err.is_transport(), "unexpected error: {err:?}");
    }

    #[test]
    fn test_half_close_bad_client() {
        init_test_logging();

        let (client, server) = connected_pair();

        // The client disappears without reading anything.
        client.close();

        assert_eq!(read_to_end(&server), b"");
        assert!(!server.is_output_shutdown());

        let mut failure = None;

        for _ in 0..100_000 {
            match server.write(b"x") {
                Ok(_) => continue,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let err = failure.expect("Writes to a closed peer never failed");
        assert!(
            matches!(err.kind(), ErrorKind::BrokenConnection | ErrorKind::ConnectionReset),
            "unexpected error: {err:?}"
        );
        assert!(err.is_transport());
    }

    #[test]
    fn test_shutdown_both_directions() {
        init_test_logging();

        let (client, server) = connected_pair();

        server.shutdown_input().expect("Failed to shut down input");
        assert_eq!(server.phase(), Phase::HalfShut);

        server.shutdown_output().expect("Failed to shut down output");
        assert_eq!(server.phase(), Phase::FullShut);

        assert!(matches!(server.write(b"late"), Err(Error::BrokenConnection)));
        assert_eq!(
            server.read(&mut [0u8; 4]).expect("Failed to read"),
            ReadOutcome::EndOfStream
        );

        assert_eq!(read_to_end(&client), b"");

        server.close();
        assert_eq!(server.phase(), Phase::Closed);
        assert!(matches!(server.shutdown_input(), Err(Error::Closed)));
    }
}
