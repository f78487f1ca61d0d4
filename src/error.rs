use crate::protocol::ReplyCode;
use std::{fmt, io};
use thiserror::Error;

/// ProtocolError is a malformed or unsupported SOCKS5 frame
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("stream ended or failed mid-frame: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("unknown reply code: {0:#04x}")]
    UnknownReply(u8),

    #[error("invalid username/password sub-negotiation version: {0:#04x}")]
    InvalidAuthVersion(u8),

    #[error("{field} too long: {len} bytes (max 255)")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("timed out waiting for {0}")]
    IdleTimeout(&'static str),
}

impl ProtocolError {
    /// reply_code is the command reply a client receives for this error
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            ProtocolError::UnsupportedCommand(_) => ReplyCode::CommandNotSupported,
            ProtocolError::UnsupportedAddressType(_) => ReplyCode::AddrTypeUnsupported,
            _ => ReplyCode::ServerFailure,
        }
    }
}

/// AuthenticationError is a failed method negotiation or RFC 1929 exchange
/// with the upstream proxy
#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("upstream proxy rejected credentials (status {status:#04x})")]
    Rejected { status: u8 },

    #[error("upstream proxy accepted none of the offered methods (selected {0:#04x})")]
    NoAcceptableMethod(u8),

    #[error("upstream proxy requires username/password but none are configured")]
    CredentialsRequired,

    #[error("{0} longer than 255 bytes")]
    CredentialTooLong(&'static str),
}

/// ConnectFailure classifies why an outbound connect did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    Refused,
    NetworkUnreachable,
    HostUnreachable,
    TimedOut,
    Rejected(ReplyCode),
    Other,
}

impl ConnectFailure {
    /// from_io classifies a transport error by its kind
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectFailure::Refused,
            io::ErrorKind::NetworkUnreachable => ConnectFailure::NetworkUnreachable,
            io::ErrorKind::HostUnreachable => ConnectFailure::HostUnreachable,
            io::ErrorKind::TimedOut => ConnectFailure::TimedOut,
            _ => ConnectFailure::Other,
        }
    }

    pub fn reply_code(self) -> ReplyCode {
        match self {
            ConnectFailure::Refused => ReplyCode::ConnectionRefused,
            ConnectFailure::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            ConnectFailure::HostUnreachable => ReplyCode::HostUnreachable,
            ConnectFailure::TimedOut => ReplyCode::TtlExpired,
            ConnectFailure::Rejected(ReplyCode::Succeeded) => ReplyCode::ServerFailure,
            ConnectFailure::Rejected(code) => code,
            ConnectFailure::Other => ReplyCode::ServerFailure,
        }
    }
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::Refused => f.write_str("refused"),
            ConnectFailure::NetworkUnreachable => f.write_str("network unreachable"),
            ConnectFailure::HostUnreachable => f.write_str("host unreachable"),
            ConnectFailure::TimedOut => f.write_str("timed out"),
            ConnectFailure::Rejected(code) => write!(f, "rejected by upstream: {code}"),
            ConnectFailure::Other => f.write_str("failed"),
        }
    }
}

/// ConnectError is any failure to obtain a connected outbound socket
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connecting to {target}: {failure}")]
    Transport {
        target: String,
        failure: ConnectFailure,
        #[source]
        source: io::Error,
    },

    #[error("upstream proxy replied: {0}")]
    Rejected(ReplyCode),

    #[error(transparent)]
    Authentication(#[from] AuthenticationError),

    #[error("upstream proxy: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectError {
    /// transport wraps an I/O failure, classifying it by kind
    pub fn transport(target: impl Into<String>, source: io::Error) -> Self {
        ConnectError::Transport {
            target: target.into(),
            failure: ConnectFailure::from_io(&source),
            source,
        }
    }

    pub fn failure(&self) -> ConnectFailure {
        match self {
            ConnectError::Transport { failure, .. } => *failure,
            ConnectError::Rejected(code) => ConnectFailure::Rejected(*code),
            ConnectError::Authentication(_) | ConnectError::Protocol(_) => ConnectFailure::Other,
        }
    }

    /// reply_code is the command reply sent to the local client for this error
    pub fn reply_code(&self) -> ReplyCode {
        self.failure().reply_code()
    }
}

/// ListenerStateError is a lifecycle call made in the wrong state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ListenerStateError {
    #[error("server already running")]
    AlreadyRunning,

    #[error("server not running")]
    NotRunning,
}

/// Error is the crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("session I/O: {0}")]
    SessionIo(#[source] io::Error),

    #[error(transparent)]
    ListenerState(#[from] ListenerStateError),

    #[error("binding {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accepting connection: {0}")]
    Accept(#[source] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_classify_by_kind() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, ReplyCode::ConnectionRefused),
            (io::ErrorKind::TimedOut, ReplyCode::TtlExpired),
            (io::ErrorKind::NetworkUnreachable, ReplyCode::NetworkUnreachable),
            (io::ErrorKind::HostUnreachable, ReplyCode::HostUnreachable),
            (io::ErrorKind::PermissionDenied, ReplyCode::ServerFailure),
        ];
        for (kind, expected) in cases {
            let err = ConnectError::transport("10.0.0.1:25", io::Error::from(kind));
            assert_eq!(err.reply_code(), expected, "{kind:?}");
        }
    }

    #[test]
    fn upstream_reply_is_forwarded() {
        let err = ConnectError::Rejected(ReplyCode::ConnectionNotAllowed);
        assert_eq!(err.reply_code(), ReplyCode::ConnectionNotAllowed);

        // a "rejection" carrying SUCCEEDED makes no sense on the wire
        let err = ConnectError::Rejected(ReplyCode::Succeeded);
        assert_eq!(err.reply_code(), ReplyCode::ServerFailure);
    }

    #[test]
    fn authentication_maps_to_general_failure() {
        let err: ConnectError = AuthenticationError::Rejected { status: 0x01 }.into();
        assert_eq!(err.reply_code(), ReplyCode::ServerFailure);
    }

    #[test]
    fn protocol_errors_pick_specific_replies() {
        assert_eq!(
            ProtocolError::UnsupportedAddressType(0x02).reply_code(),
            ReplyCode::AddrTypeUnsupported
        );
        assert_eq!(
            ProtocolError::UnsupportedCommand(0x02).reply_code(),
            ReplyCode::CommandNotSupported
        );
        assert_eq!(
            ProtocolError::Io(io::ErrorKind::UnexpectedEof.into()).reply_code(),
            ReplyCode::ServerFailure
        );
    }
}
