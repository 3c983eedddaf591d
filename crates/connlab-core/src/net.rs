use std::io::{Error, ErrorKind};

/// True for errors that mean the peer went away rather than misbehaved.
///
/// These are expected when an exchange is torn down deliberately and are
/// swallowed when a stream is configured to ignore errors.
pub fn is_teardown_error(err: &Error) -> bool {
    match err.kind() {
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::UnexpectedEof
        | ErrorKind::NotConnected => {
            return true;
        }
        _ => {}
    }

    #[cfg(not(windows))]
    {
        matches!(
            err.raw_os_error(),
            Some(code) if code == libc::ECONNRESET || code == libc::EPIPE || code == libc::ESHUTDOWN
        )
    }
    #[cfg(windows)]
    {
        // WSAECONNRESET = 10054, WSAESHUTDOWN = 10058
        const WSAECONNRESET: i32 = 10054;
        const WSAESHUTDOWN: i32 = 10058;
        matches!(
            err.raw_os_error(),
            Some(code) if code == WSAECONNRESET || code == WSAESHUTDOWN
        )
    }
}

pub fn is_interrupted(err: &Error) -> bool {
    matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_and_eof_are_teardown() {
        assert!(is_teardown_error(&Error::from(ErrorKind::ConnectionReset)));
        assert!(is_teardown_error(&Error::from(ErrorKind::UnexpectedEof)));
        #[cfg(not(windows))]
        assert!(is_teardown_error(&Error::from_raw_os_error(libc::EPIPE)));
    }

    #[test]
    fn other_errors_are_not_teardown() {
        assert!(!is_teardown_error(&Error::from(ErrorKind::InvalidData)));
        assert!(!is_teardown_error(&Error::from(ErrorKind::PermissionDenied)));
        assert!(is_interrupted(&Error::from(ErrorKind::Interrupted)));
    }
}
