//! Codec for the SOCKS5 frames exchanged during a handshake and the
//! RFC 1929 username/password sub-negotiation.
//!
//! Every frame has an `encode` producing the exact wire bytes and an async
//! `read_from` that consumes exactly one frame from a stream.

use crate::address::Address;
use crate::error::ProtocolError;
use crate::protocol::{AuthStatus, Command, RSV, ReplyCode, USERPASS_VERSION, Version};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt};

/// MethodSelectionRequest is the client greeting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSelectionRequest {
    pub version: u8,
    pub methods: Vec<u8>,
}

impl MethodSelectionRequest {
    pub fn new(methods: Vec<u8>) -> Self {
        Self {
            version: Version::SOCKS5 as u8,
            methods,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        // +----+----------+----------+
        // |VER | NMETHODS | METHODS  |
        // +----+----------+----------+
        // | 1  |    1     | 1 to 255 |
        // +----+----------+----------+
        let mut buf = Vec::with_capacity(2 + self.methods.len());
        buf.push(self.version);
        buf.push(self.methods.len() as u8);
        buf.extend_from_slice(&self.methods);
        buf
    }

    /// read_from consumes the whole greeting. Version and method ids are
    /// returned as read, without validation.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await?;

        let mut methods = vec![0u8; buf[1] as usize];
        reader.read_exact(&mut methods).await?;

        Ok(Self {
            version: buf[0],
            methods,
        })
    }
}

/// MethodSelectionResponse is the server's choice of authentication method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSelectionResponse {
    pub version: u8,
    pub method: u8,
}

impl MethodSelectionResponse {
    pub fn encode(&self) -> [u8; 2] {
        [self.version, self.method]
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await?;
        Ok(Self {
            version: buf[0],
            method: buf[1],
        })
    }
}

/// CommandRequest asks the proxy to act on a target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    pub version: u8,
    pub command: Command,
    pub address: Address,
    pub port: u16,
}

impl CommandRequest {
    pub fn connect(address: Address, port: u16) -> Self {
        Self {
            version: Version::SOCKS5 as u8,
            command: Command::Connect,
            address,
            port,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        // +----+-----+-------+------+----------+----------+
        // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
        // +----+-----+-------+------+----------+----------+
        // | 1  |  1  | X'00' |  1   | Variable |    2     |
        // +----+-----+-------+------+----------+----------+
        let mut buf = vec![self.version, self.command as u8, RSV];
        self.address.write_to(&mut buf)?;
        buf.extend_from_slice(&self.port.to_be_bytes());
        Ok(buf)
    }

    /// read_from consumes one request frame. An unknown command is reported
    /// only after the address and port have been read, so the stream stays in
    /// step with the client. An unknown address type cannot be sized and is
    /// reported as soon as the ATYP byte is seen.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        // VER, CMD, RSV, ATYP
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;

        let address = Address::read_from(reader, header[3]).await?;
        let port = reader.read_u16().await?;

        let command =
            Command::from_byte(header[1]).ok_or(ProtocolError::UnsupportedCommand(header[1]))?;

        Ok(Self {
            version: header[0],
            command,
            address,
            port,
        })
    }

    /// target renders the destination as `host:port`
    pub fn target(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// CommandReply answers a CommandRequest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub reply: ReplyCode,
    pub bind_address: Address,
    pub bind_port: u16,
}

impl CommandReply {
    pub fn new(reply: ReplyCode, bound: SocketAddr) -> Self {
        Self {
            reply,
            bind_address: bound.into(),
            bind_port: bound.port(),
        }
    }

    /// failure builds a reply carrying `0.0.0.0:0`
    pub fn failure(reply: ReplyCode) -> Self {
        Self {
            reply,
            bind_address: Address::unspecified(),
            bind_port: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        // +----+-----+-------+------+----------+----------+
        // |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
        // +----+-----+-------+------+----------+----------+
        // | 1  |  1  | X'00' |  1   | Variable |    2     |
        // +----+-----+-------+------+----------+----------+
        let mut buf = vec![Version::SOCKS5 as u8, self.reply as u8, RSV];
        self.bind_address.write_to(&mut buf)?;
        buf.extend_from_slice(&self.bind_port.to_be_bytes());
        Ok(buf)
    }

    /// read_from consumes one reply frame including the bind address,
    /// whatever its type, before judging the reply code
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        reader.read_exact(&mut header).await?;

        if header[0] != Version::SOCKS5 as u8 {
            return Err(ProtocolError::UnsupportedVersion(header[0]));
        }

        let bind_address = Address::read_from(reader, header[3]).await?;
        let bind_port = reader.read_u16().await?;

        let reply = ReplyCode::from_byte(header[1]).ok_or(ProtocolError::UnknownReply(header[1]))?;

        Ok(Self {
            reply,
            bind_address,
            bind_port,
        })
    }
}

/// UserPassRequest is the RFC 1929 client request
#[derive(Clone, PartialEq, Eq)]
pub struct UserPassRequest {
    pub username: Vec<u8>,
    pub password: Vec<u8>,
}

impl UserPassRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        // +----+------+----------+------+----------+
        // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
        // +----+------+----------+------+----------+
        // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
        // +----+------+----------+------+----------+
        let ulen = checked_len("username", &self.username)?;
        let plen = checked_len("password", &self.password)?;

        let mut buf = Vec::with_capacity(3 + self.username.len() + self.password.len());
        buf.push(USERPASS_VERSION);
        buf.push(ulen);
        buf.extend_from_slice(&self.username);
        buf.push(plen);
        buf.extend_from_slice(&self.password);
        Ok(buf)
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let version = reader.read_u8().await?;
        if version != USERPASS_VERSION {
            return Err(ProtocolError::InvalidAuthVersion(version));
        }

        let ulen = reader.read_u8().await?;
        let mut username = vec![0u8; ulen as usize];
        reader.read_exact(&mut username).await?;

        let plen = reader.read_u8().await?;
        let mut password = vec![0u8; plen as usize];
        reader.read_exact(&mut password).await?;

        Ok(Self { username, password })
    }
}

impl std::fmt::Debug for UserPassRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserPassRequest")
            .field("username", &String::from_utf8_lossy(&self.username))
            .field("password", &"<redacted>")
            .finish()
    }
}

/// UserPassResponse is the RFC 1929 server verdict; status 0x00 is success
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserPassResponse {
    pub version: u8,
    pub status: u8,
}

impl UserPassResponse {
    pub fn encode(&self) -> [u8; 2] {
        [self.version, self.status]
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await?;
        Ok(Self {
            version: buf[0],
            status: buf[1],
        })
    }

    pub fn is_success(&self) -> bool {
        AuthStatus::from_byte(self.status) == AuthStatus::Success
    }
}

fn checked_len(field: &'static str, value: &[u8]) -> Result<u8, ProtocolError> {
    u8::try_from(value.len()).map_err(|_| ProtocolError::FieldTooLong {
        field,
        len: value.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[tokio::test]
    async fn command_request_round_trips() {
        let addresses = [
            Address::IPv4(Ipv4Addr::new(192, 168, 1, 20)),
            Address::DomainName("mail.example.org".into()),
            Address::IPv6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 25)),
        ];
        for address in addresses {
            for port in [0u16, 25, 587, 65535] {
                for command in [Command::Connect, Command::Bind, Command::UdpAssociate] {
                    let request = CommandRequest {
                        version: 0x05,
                        command,
                        address: address.clone(),
                        port,
                    };
                    let bytes = request.encode().unwrap();
                    let decoded = CommandRequest::read_from(&mut &bytes[..]).await.unwrap();
                    assert_eq!(decoded, request);
                }
            }
        }
    }

    #[test]
    fn command_request_bytes_are_exact() {
        let request = CommandRequest::connect(Address::DomainName("example.com".into()), 80);
        let mut expected = vec![0x05, 0x01, 0x00, 0x03, 11];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x00, 0x50]);
        assert_eq!(request.encode().unwrap(), expected);
    }

    #[tokio::test]
    async fn unknown_command_consumes_the_whole_frame() {
        let mut bytes = vec![0x05, 0x09, 0x00, 0x01, 10, 0, 0, 1, 0x01, 0xBB];
        bytes.push(0xAA); // next byte on the stream
        let mut reader = &bytes[..];

        let err = CommandRequest::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedCommand(0x09)));
        assert_eq!(reader, &[0xAA]);
    }

    #[tokio::test]
    async fn unknown_address_type_is_reported() {
        let bytes = [0x05, 0x01, 0x00, 0x07, 1, 2, 3, 4, 0, 25];
        let err = CommandRequest::read_from(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedAddressType(0x07)));
    }

    #[tokio::test]
    async fn truncated_request_is_an_io_error() {
        let bytes = [0x05, 0x01, 0x00, 0x01, 127, 0];
        let err = CommandRequest::read_from(&mut &bytes[..]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Io(_)));
    }

    #[test]
    fn command_reply_bytes_follow_bound_family() {
        let v4 = CommandReply::new(ReplyCode::Succeeded, "10.0.0.2:40000".parse().unwrap());
        assert_eq!(
            v4.encode().unwrap(),
            vec![0x05, 0x00, 0x00, 0x01, 10, 0, 0, 2, 0x9C, 0x40]
        );

        let v6 = CommandReply::new(ReplyCode::Succeeded, "[::1]:1".parse().unwrap());
        let bytes = v6.encode().unwrap();
        assert_eq!(bytes.len(), 4 + 16 + 2);
        assert_eq!(bytes[3], 0x04);

        let failed = CommandReply::failure(ReplyCode::ConnectionRefused);
        assert_eq!(
            failed.encode().unwrap(),
            vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn command_reply_drains_domain_bind_address() {
        let mut bytes = vec![0x05, 0x00, 0x00, 0x03, 4];
        bytes.extend_from_slice(b"host");
        bytes.extend_from_slice(&[0x04, 0x38]);
        bytes.extend_from_slice(b"payload");
        let mut reader = &bytes[..];

        let reply = CommandReply::read_from(&mut reader).await.unwrap();
        assert_eq!(reply.bind_address, Address::DomainName("host".into()));
        assert_eq!(reply.bind_port, 1080);
        assert_eq!(reader, b"payload");
    }

    #[tokio::test]
    async fn method_selection_request_ignores_method_values() {
        let bytes = [0x05, 0x03, 0x00, 0x02, 0x80];
        let request = MethodSelectionRequest::read_from(&mut &bytes[..]).await.unwrap();
        assert_eq!(request.methods, vec![0x00, 0x02, 0x80]);
        assert_eq!(request.encode(), bytes);
    }

    #[tokio::test]
    async fn userpass_request_encodes_rfc1929() {
        let request = UserPassRequest {
            username: b"u".to_vec(),
            password: b"p".to_vec(),
        };
        let bytes = request.encode().unwrap();
        assert_eq!(bytes, vec![0x01, 0x01, b'u', 0x01, b'p']);

        let decoded = UserPassRequest::read_from(&mut &bytes[..]).await.unwrap();
        assert_eq!(decoded, request);
        assert!(!format!("{decoded:?}").contains("\"p\""));
    }

    #[test]
    fn userpass_request_rejects_long_fields() {
        let request = UserPassRequest {
            username: vec![b'a'; 256],
            password: b"p".to_vec(),
        };
        assert!(matches!(
            request.encode(),
            Err(ProtocolError::FieldTooLong { field: "username", .. })
        ));
    }

    #[tokio::test]
    async fn userpass_response_status() {
        let ok = UserPassResponse::read_from(&mut &[0x01, 0x00][..]).await.unwrap();
        assert!(ok.is_success());
        let denied = UserPassResponse::read_from(&mut &[0x01, 0x01][..]).await.unwrap();
        assert!(!denied.is_success());
    }
}
