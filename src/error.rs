use std::io::ErrorKind;
use std::str::Utf8Error;
use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failure to establish a link to an instrument.
///
/// Every variant names the target so that a log line is actionable on its own.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("could not resolve {target}: {source}")]
    Unresolved {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {target} refused")]
    Refused { target: String },

    #[error("{target} is unreachable: {source}")]
    Unreachable {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out after {timeout:?} connecting to {target}")]
    TimedOut { target: String, timeout: Duration },

    #[error("invalid resource identifier {resource:?}: {reason}")]
    InvalidResource { resource: String, reason: String },

    #[error("resource {resource:?} uses an unsupported interface ({interface})")]
    UnsupportedResource { resource: String, interface: String },

    #[error("protocol error while opening {target}: {reason}")]
    Protocol { target: String, reason: String },

    #[error("I/O error connecting to {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConnectError {
    pub(crate) fn from_io(target: impl Into<String>, timeout: Duration, err: std::io::Error) -> Self {
        let target = target.into();
        match err.kind() {
            ErrorKind::ConnectionRefused => ConnectError::Refused { target },
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectError::TimedOut { target, timeout },
            ErrorKind::HostUnreachable
            | ErrorKind::NetworkUnreachable
            | ErrorKind::NetworkDown
            | ErrorKind::AddrNotAvailable => ConnectError::Unreachable { target, source: err },
            _ => ConnectError::Io { target, source: err },
        }
    }

    /// Short operator hint for the failure class.
    pub fn remediation(&self) -> &'static str {
        match self {
            ConnectError::Unresolved { .. } => "check the host name or IP address spelling",
            ConnectError::Refused { .. } => {
                "the host answered but nothing listens on that port: check the port and that the remote interface is enabled, and that no firewall rejects the connection"
            }
            ConnectError::Unreachable { .. } => {
                "check the cabling, the IP address and that the instrument is on the same network"
            }
            ConnectError::TimedOut { .. } => {
                "check that the instrument is powered on, the IP address is correct and the firewall allows the connection"
            }
            ConnectError::InvalidResource { .. } => {
                "use a resource string such as TCPIP0::<host>::inst0::INSTR or TCPIP0::<host>::5025::SOCKET"
            }
            ConnectError::UnsupportedResource { .. } => "only TCPIP resources are supported",
            ConnectError::Protocol { .. } => {
                "the instrument does not speak the expected protocol on that address"
            }
            ConnectError::Io { .. } => "check the network configuration of this host",
        }
    }
}

/// Byte-level failure on an open transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not open")]
    NotOpen,

    #[error("timed out waiting for the instrument")]
    TimedOut,

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(std::io::Error),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::WouldBlock | ErrorKind::TimedOut => TransportError::TimedOut,
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected => TransportError::ConnectionClosed,
            _ => TransportError::Io(err),
        }
    }
}

/// A command rejected before any I/O took place.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("command is empty")]
    Empty,

    #[error("command contains an embedded line terminator")]
    EmbeddedTerminator,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("channel is not connected")]
    NotConnected,

    #[error("invalid command: {0}")]
    InvalidCommand(#[from] CommandError),

    #[error("write failed: {0}")]
    WriteFailed(#[source] TransportError),
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("channel is not connected")]
    NotConnected,

    #[error("invalid command: {0}")]
    InvalidCommand(#[from] CommandError),

    #[error("write failed: {0}")]
    WriteFailed(#[source] TransportError),

    #[error("no response within {0:?}")]
    ReadTimeout(Duration),

    #[error("read failed: {0}")]
    ReadFailed(#[source] TransportError),

    #[error("response is not valid text: {0}")]
    DecodeFailed(#[source] Utf8Error),
}

impl From<SendError> for QueryError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::NotConnected => QueryError::NotConnected,
            SendError::InvalidCommand(e) => QueryError::InvalidCommand(e),
            SendError::WriteFailed(e) => QueryError::WriteFailed(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_timeouts_map_to_timed_out() {
        let err: TransportError = io::Error::from(ErrorKind::WouldBlock).into();
        assert!(matches!(err, TransportError::TimedOut));

        let err: TransportError = io::Error::from(ErrorKind::TimedOut).into();
        assert!(matches!(err, TransportError::TimedOut));
    }

    #[test]
    fn io_resets_map_to_connection_closed() {
        for kind in [ErrorKind::ConnectionReset, ErrorKind::BrokenPipe, ErrorKind::UnexpectedEof] {
            let err: TransportError = io::Error::from(kind).into();
            assert!(matches!(err, TransportError::ConnectionClosed), "{kind:?}");
        }
    }

    #[test]
    fn other_io_errors_are_kept() {
        let err: TransportError = io::Error::from(ErrorKind::PermissionDenied).into();
        assert!(matches!(err, TransportError::Io(e) if e.kind() == ErrorKind::PermissionDenied));
    }

    #[test]
    fn connect_errors_are_classified_by_kind() {
        let timeout = Duration::from_secs(5);
        let refused = ConnectError::from_io("a:1", timeout, io::Error::from(ErrorKind::ConnectionRefused));
        assert!(matches!(refused, ConnectError::Refused { .. }));

        let timed_out = ConnectError::from_io("a:1", timeout, io::Error::from(ErrorKind::TimedOut));
        assert!(matches!(timed_out, ConnectError::TimedOut { timeout: t, .. } if t == timeout));

        let unreachable = ConnectError::from_io("a:1", timeout, io::Error::from(ErrorKind::HostUnreachable));
        assert!(matches!(unreachable, ConnectError::Unreachable { .. }));
    }

    #[test]
    fn connect_error_messages_name_the_target() {
        let err = ConnectError::Refused { target: "10.0.0.2:5025".into() };
        assert_eq!(err.to_string(), "connection to 10.0.0.2:5025 refused");
        assert!(!err.remediation().is_empty());
    }

    #[test]
    fn send_errors_convert_to_query_errors() {
        assert!(matches!(QueryError::from(SendError::NotConnected), QueryError::NotConnected));
        assert!(matches!(
            QueryError::from(SendError::InvalidCommand(CommandError::Empty)),
            QueryError::InvalidCommand(CommandError::Empty)
        ));
        assert!(matches!(
            QueryError::from(SendError::WriteFailed(TransportError::ConnectionClosed)),
            QueryError::WriteFailed(TransportError::ConnectionClosed)
        ));
    }
}
