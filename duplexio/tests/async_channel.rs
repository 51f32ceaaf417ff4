mod common;

#[cfg(test)]
mod tests {
    use super::common::init_test_logging;

    use duplexio::completion::{AsyncGroup, AsyncGroupBuilder, AsyncTcpChannel, AsyncTcpListener};
    use duplexio::net::ReadOutcome;
    use duplexio::{Error, ErrorKind};

    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn connect(group: &AsyncGroup) -> (AsyncTcpListener, AsyncTcpChannel, AsyncTcpChannel) {
        let listener = AsyncTcpListener::bind(group, "127.0.0.1:0").expect("Failed to bind listener");
        let addr = listener.local_addr().expect("Failed to get local address");

        let mut accepted = listener.accept();
        let mut connected = AsyncTcpChannel::connect(group, addr);

        let server = accepted.wait_timeout(WAIT).expect("Failed to accept connection");
        let client = connected.wait_timeout(WAIT).expect("Failed to connect");

        (listener, client, server)
    }

    #[test]
    fn test_async_socket_channel() {
        init_test_logging();

        let group = AsyncGroupBuilder::new()
            .name("async-test")
            .build()
            .expect("Failed to start group");
        assert_eq!(group.name(), "async-test");

        let (_listener, client, server) = connect(&group);

        let message = b"Testing 1 2 3".to_vec();
        let mut write = client.write(message.clone());
        let mut read = server.read(vec![0u8; 64]);

        let written = write.wait_timeout(WAIT).expect("Failed to write");
        assert_eq!(written.outcome, ReadOutcome::Data(message.len()));

        let transfer = read.wait_timeout(WAIT).expect("Failed to read");
        assert_eq!(transfer.bytes(), &message[..]);

        assert_eq!(
            server.peer_addr().expect("Failed to get peer address"),
            client.local_addr().expect("Failed to get local address")
        );
    }

    #[test]
    fn test_wait_timeout_does_not_cancel() {
        init_test_logging();

        let group = AsyncGroup::new().expect("Failed to start group");
        let (_listener, client, server) = connect(&group);

        let mut read = server.read(vec![0u8; 16]);

        let err = read
            .wait_timeout(Duration::from_millis(50))
            .expect_err("Read completed without data");
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!read.is_done());

        client
            .write(b"late".to_vec())
            .wait_timeout(WAIT)
            .expect("Failed to write");

        let transfer = read.wait_timeout(WAIT).expect("Failed to read");
        assert_eq!(transfer.bytes(), b"late");
    }

    #[test]
    fn test_async_end_of_stream() {
        init_test_logging();

        let group = AsyncGroup::new().expect("Failed to start group");
        let (_listener, client, server) = connect(&group);

        client.shutdown_output().expect("Failed to shut down output");

        let transfer = server
            .read(vec![0u8; 16])
            .wait_timeout(WAIT)
            .expect("Failed to read");
        assert!(transfer.is_eof());

        let err = client
            .write(b"nope".to_vec())
            .wait_timeout(WAIT)
            .expect_err("Write after shutdown succeeded");
        assert!(matches!(err, Error::BrokenConnection));
    }

    #[test]
    fn test_close_cancels_pending_read() {
        init_test_logging();

        let group = AsyncGroup::new().expect("Failed to start group");
        let (_listener, _client, server) = connect(&group);

        let mut read = server.read(vec![0u8; 16]);
        server.close();

        assert!(matches!(read.wait_timeout(WAIT), Err(Error::Cancelled)));
        assert!(matches!(
            server.read(vec![0u8; 16]).wait_timeout(WAIT),
            Err(Error::Closed)
        ));
    }

    #[test]
    fn test_cancel_completion() {
        init_test_logging();

        let group = AsyncGroup::new().expect("Failed to start group");
        let (_listener, client, server) = connect(&group);

        let read = server.read(vec![0u8; 16]);
        assert!(read.cancel());
        assert!(matches!(read.wait(), Err(Error::Cancelled)));

        // The cancelled read consumed nothing.
        client
            .write(b"kept".to_vec())
            .wait_timeout(WAIT)
            .expect("Failed to write");

        let transfer = server
            .read(vec![0u8; 16])
            .wait_timeout(WAIT)
            .expect("Failed to read");
        assert_eq!(transfer.bytes(), b"kept");
    }

    #[test]
    fn test_shutdown_cancels_pending_accept() {
        init_test_logging();

        let group = AsyncGroup::new().expect("Failed to start group");
        let listener = AsyncTcpListener::bind(&group, "127.0.0.1:0").expect("Failed to bind listener");

        let mut accept = listener.accept();
        group.shutdown();

        assert!(group.is_shutdown());
        assert!(matches!(accept.wait_timeout(WAIT), Err(Error::Cancelled)));
        assert!(matches!(listener.accept().wait_timeout(WAIT), Err(Error::Cancelled)));
    }

    #[test]
    fn test_connect_refused() {
        init_test_logging();

        let group = AsyncGroup::new().expect("Failed to start group");

        let addr = {
            let listener = AsyncTcpListener::bind(&group, "127.0.0.1:0").expect("Failed to bind listener");
            listener.local_addr().expect("Failed to get local address")
        };

        // Give the driver time to close the listener.
        std::thread::sleep(Duration::from_millis(50));

        let result = AsyncTcpChannel::connect(&group, addr).wait_timeout(WAIT);
        assert!(result.is_err());
    }
}
