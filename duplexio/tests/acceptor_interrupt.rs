mod common;

#[cfg(test)]
mod tests {
    use super::common::{init_test_logging, read_to_end};

    use duplexio::net::{ByteChannel, TcpAcceptor, TcpChannel};
    use duplexio::{CancelToken, Error};

    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_server_channel_interrupt() {
        init_test_logging();

        let acceptor = Arc::new(TcpAcceptor::bind("127.0.0.1:0").expect("Failed to bind acceptor"));
        let addr = acceptor.local_addr().expect("Failed to get local address");
        let token = CancelToken::new().expect("Failed to create token");

        // One connection is accepted before the cancellation.
        let client = TcpChannel::connect(addr).expect("Failed to connect");
        let (accepted, _) = acceptor
            .accept_cancellable(&token)
            .expect("Failed to accept connection");

        let (done, outcome) = mpsc::channel();
        let accepting = acceptor.clone();
        let waiting = token.clone();

        let handle = thread::spawn(move || {
            let result = accepting.accept_cancellable(&waiting);
            done.send(result.map(|_| ())).expect("Failed to report outcome");
        });

        thread::sleep(Duration::from_millis(100));
        token.cancel();

        let result = outcome
            .recv_timeout(Duration::from_secs(10))
            .expect("Accept was not interrupted");

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(!acceptor.is_open());
        assert!(matches!(acceptor.accept(), Err(Error::Closed)));

        handle.join().expect("Acceptor thread panicked");

        // The connection accepted earlier is untouched.
        client.write_all(b"still here").expect("Failed to write");
        client.shutdown_output().expect("Failed to shut down output");
        assert_eq!(read_to_end(&accepted), b"still here");
    }

    #[test]
    fn test_cancelled_token_is_sticky() {
        init_test_logging();

        let acceptor = TcpAcceptor::bind("127.0.0.1:0").expect("Failed to bind acceptor");
        let token = CancelToken::new().expect("Failed to create token");

        token.cancel();

        assert!(matches!(acceptor.accept_cancellable(&token), Err(Error::Cancelled)));
        assert!(token.is_cancelled());
        assert!(!acceptor.is_open());
    }
}
