mod common;

#[cfg(test)]
mod tests {
    use super::common::{connected_pair, init_test_logging};

    use duplexio::ErrorKind;
    use duplexio::net::ReadOutcome;

    use std::time::Duration;

    #[test]
    fn test_reset() {
        init_test_logging();

        let (client, server) = connected_pair();

        client
            .set_linger(Some(Duration::ZERO))
            .expect("Failed to set linger");
        client.close();

        let err = server
            .read(&mut [0u8; 16])
            .expect_err("Read after a reset must fail");

        assert_eq!(err.kind(), ErrorKind::ConnectionReset);
        assert!(server.state().reset_observed());
        assert!(!server.state().eof_observed());
        assert!(!server.is_input_shutdown());
    }

    #[test]
    fn test_graceful_close_is_not_a_reset() {
        init_test_logging();

        let (client, server) = connected_pair();

        client.close();

        assert_eq!(
            server.read(&mut [0u8; 16]).expect("Failed to read"),
            ReadOutcome::EndOfStream
        );
        assert!(server.state().eof_observed());
        assert!(!server.state().reset_observed());
    }
}
