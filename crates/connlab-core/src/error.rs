use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Where a transport fault happened relative to the connection pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportPhase {
    /// Dialling, accepting or pairing the two ends.
    Connect,
    /// Any byte exchange after both ends exist.
    Exchange,
}

impl fmt::Display for TransportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportPhase::Connect => f.write_str("connect"),
            TransportPhase::Exchange => f.write_str("exchange"),
        }
    }
}

/// Outcome classification an operation is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Success,
    /// The exchange finished but the final status was not a success.
    ProtocolError,
    RequestCanceled,
    ConnectFailure,
    /// The peer sent bytes that do not frame as HTTP/1.1.
    ReceiveFailure,
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Success => "Success",
            ErrorKind::ProtocolError => "ProtocolError",
            ErrorKind::RequestCanceled => "RequestCanceled",
            ErrorKind::ConnectFailure => "ConnectFailure",
            ErrorKind::ReceiveFailure => "ReceiveFailure",
            ErrorKind::Timeout => "Timeout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("assertion failed: {0}")]
    Assertion(String),
    #[error("transport fault during {phase}: {source}")]
    Transport {
        phase: TransportPhase,
        #[source]
        source: io::Error,
    },
    #[error("operation {operation} was not admitted within {waited:?}")]
    AdmissionTimeout { operation: u64, waited: Duration },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("operation canceled")]
    Canceled,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("contract violation: {0}")]
    Contract(String),
}

impl HarnessError {
    pub fn assertion(message: impl Into<String>) -> Self {
        HarnessError::Assertion(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        HarnessError::Protocol(message.into())
    }

    pub fn contract(message: impl Into<String>) -> Self {
        HarnessError::Contract(message.into())
    }

    pub fn connect(source: io::Error) -> Self {
        HarnessError::Transport {
            phase: TransportPhase::Connect,
            source,
        }
    }

    pub fn exchange(source: io::Error) -> Self {
        HarnessError::Transport {
            phase: TransportPhase::Exchange,
            source,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, HarnessError::Canceled)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::Transport {
                phase: TransportPhase::Connect,
                ..
            } => ErrorKind::ConnectFailure,
            HarnessError::Transport { .. } | HarnessError::Canceled => ErrorKind::RequestCanceled,
            HarnessError::AdmissionTimeout { .. } | HarnessError::Timeout(_) => ErrorKind::Timeout,
            HarnessError::Protocol(_) => ErrorKind::ReceiveFailure,
            // Assertion and contract failures are test bugs, not wire outcomes.
            HarnessError::Assertion(_) | HarnessError::Contract(_) => ErrorKind::ProtocolError,
        }
    }
}

impl Clone for HarnessError {
    fn clone(&self) -> Self {
        match self {
            HarnessError::Assertion(message) => HarnessError::Assertion(message.clone()),
            HarnessError::Transport { phase, source } => HarnessError::Transport {
                phase: *phase,
                source: io::Error::new(source.kind(), source.to_string()),
            },
            HarnessError::AdmissionTimeout { operation, waited } => HarnessError::AdmissionTimeout {
                operation: *operation,
                waited: *waited,
            },
            HarnessError::Protocol(message) => HarnessError::Protocol(message.clone()),
            HarnessError::Canceled => HarnessError::Canceled,
            HarnessError::Timeout(after) => HarnessError::Timeout(*after),
            HarnessError::Contract(message) => HarnessError::Contract(message.clone()),
        }
    }
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_the_phase_of_transport_faults() {
        let reset = || io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(HarnessError::connect(reset()).kind(), ErrorKind::ConnectFailure);
        assert_eq!(HarnessError::exchange(reset()).kind(), ErrorKind::RequestCanceled);
        assert_eq!(HarnessError::Canceled.kind(), ErrorKind::RequestCanceled);
        assert_eq!(HarnessError::protocol("x").kind(), ErrorKind::ReceiveFailure);
        assert_eq!(
            HarnessError::Timeout(Duration::from_secs(1)).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn clone_keeps_transport_details() {
        let err = HarnessError::exchange(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let copy = err.clone();
        match copy {
            HarnessError::Transport { phase, source } => {
                assert_eq!(phase, TransportPhase::Exchange);
                assert_eq!(source.kind(), io::ErrorKind::BrokenPipe);
                assert!(source.to_string().contains("gone"));
            }
            other => panic!("unexpected clone {other:?}"),
        }
    }
}
