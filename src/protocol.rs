//! Wire-level constants for SOCKS5 (RFC 1928) and the username/password
//! sub-negotiation (RFC 1929).

use std::fmt;

// RSV: Fields marked RESERVED (RSV) must be set to X'00'.
pub const RSV: u8 = 0x00;

/// Version byte of the RFC 1929 username/password sub-negotiation
pub const USERPASS_VERSION: u8 = 0x01;

/// Fixed answer to every method selection request: SOCKS5, no authentication
pub const METHOD_SELECTION_RESPONSE: [u8; 2] = [Version::SOCKS5 as u8, AuthMethod::NoAuth as u8];

/// Version represents available SOCKS proxy versions. Only SOCKS5 is spoken.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    SOCKS5 = 0x05,
}

/// AuthMethod represents available SOCKS5
/// authentication methods
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth = 0x00,
    Gssapi = 0x01,
    UserPass = 0x02,
    // 0x03 - 0x7f: IANA reserved
    // 0x80 - 0xFE: private methods
    NoAcceptable = 0xFF,
}

/// AuthMethod implementation block
impl AuthMethod {
    /// from_byte converts a byte to its related authentication method
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(AuthMethod::NoAuth),
            0x01 => Some(AuthMethod::Gssapi),
            0x02 => Some(AuthMethod::UserPass),
            0xFF => Some(AuthMethod::NoAcceptable),
            _ => None,
        }
    }
}

/// Command represents SOCKS5 protocol commands
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

/// Command implementation block
impl Command {
    /// from_byte converts a byte to its related SOCKS5 protocol command
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Command::Connect),
            0x02 => Some(Command::Bind),
            0x03 => Some(Command::UdpAssociate),
            _ => None,
        }
    }
}

/// AddressType represents the SOCKS5 address types:
/// IPv4, Domain Name, IPv6
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressType {
    IPv4 = 0x01,
    DomainName = 0x03,
    IPv6 = 0x04,
}

/// AddressType implementation block
impl AddressType {
    /// from_byte converts a byte to its related network address type
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(AddressType::IPv4),
            0x03 => Some(AddressType::DomainName),
            0x04 => Some(AddressType::IPv6),
            _ => None,
        }
    }
}

/// ReplyCode is the REP field of a command reply
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddrTypeUnsupported = 0x08,
    // 0x09 - 0xFF: unassigned
}

impl ReplyCode {
    /// from_byte converts a byte to its reply code, `None` for unassigned values
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ReplyCode::Succeeded),
            0x01 => Some(ReplyCode::ServerFailure),
            0x02 => Some(ReplyCode::ConnectionNotAllowed),
            0x03 => Some(ReplyCode::NetworkUnreachable),
            0x04 => Some(ReplyCode::HostUnreachable),
            0x05 => Some(ReplyCode::ConnectionRefused),
            0x06 => Some(ReplyCode::TtlExpired),
            0x07 => Some(ReplyCode::CommandNotSupported),
            0x08 => Some(ReplyCode::AddrTypeUnsupported),
            _ => None,
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::ServerFailure => "general SOCKS server failure",
            ReplyCode::ConnectionNotAllowed => "connection not allowed by ruleset",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::TtlExpired => "TTL expired",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddrTypeUnsupported => "address type not supported",
        };
        f.write_str(text)
    }
}

/// AuthStatus is the STATUS field of a username/password response
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success = 0x00,
    /// any non-zero status
    Failure = 0x01,
}

impl AuthStatus {
    /// from_byte maps 0x00 to success and everything else to failure
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => AuthStatus::Success,
            _ => AuthStatus::Failure,
        }
    }
}
