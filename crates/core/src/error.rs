use crate::status::Status;

/// Errors surfaced by the vmnet forwarding core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("interface failed to start: {0}")]
    InterfaceStartFailed(String),

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("kernel packet buffers exhausted")]
    TransientBufferExhausted,

    #[error("packet of {len} bytes exceeds maximum payload of {max} bytes")]
    PacketTooLarge { len: usize, max: usize },

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("invalid packet length {len} on stream (max {max})")]
    ProtocolViolation { len: usize, max: usize },

    #[error("interface {op} failed: {status}")]
    Interface { op: &'static str, status: Status },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error only says the connection went away.
    ///
    /// Closure is normal termination for a forwarder and is never reported.
    pub fn is_peer_closed(&self) -> bool {
        match self {
            Error::PeerClosed => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_packet_too_large() {
        let err = Error::PacketTooLarge {
            len: 1600,
            max: 1500,
        };
        assert_eq!(
            err.to_string(),
            "packet of 1600 bytes exceeds maximum payload of 1500 bytes"
        );
    }

    #[test]
    fn error_display_protocol_violation() {
        let err = Error::ProtocolViolation { len: 0, max: 1500 };
        assert_eq!(err.to_string(), "invalid packet length 0 on stream (max 1500)");
    }

    #[test]
    fn error_display_interface() {
        let err = Error::Interface {
            op: "read",
            status: Status::InvalidArgument,
        };
        assert_eq!(
            err.to_string(),
            "interface read failed: invalid argument specified"
        );
    }

    #[test]
    fn peer_closed_is_closure() {
        assert!(Error::PeerClosed.is_peer_closed());
    }

    #[test]
    fn connection_reset_is_closure() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(err.is_peer_closed());
    }

    #[test]
    fn broken_pipe_is_closure() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(err.is_peer_closed());
    }

    #[test]
    fn protocol_violation_is_not_closure() {
        assert!(!Error::ProtocolViolation { len: 0, max: 1500 }.is_peer_closed());
    }

    #[test]
    fn other_io_is_not_closure() {
        let err: Error = std::io::Error::other("boom").into();
        assert!(!err.is_peer_closed());
    }
}
