use crate::error::ProtocolError;
use crate::protocol::AddressType;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Address represents a network address or domain name carried in a
/// SOCKS5 DST.ADDR / BND.ADDR field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    IPv4(Ipv4Addr),
    DomainName(String),
    IPv6(Ipv6Addr),
}

impl Address {
    /// address_type returns the ATYP byte that precedes this address on the wire
    pub fn address_type(&self) -> AddressType {
        match self {
            Address::IPv4(_) => AddressType::IPv4,
            Address::DomainName(_) => AddressType::DomainName,
            Address::IPv6(_) => AddressType::IPv6,
        }
    }

    /// unspecified is the `0.0.0.0` placeholder used in failure replies
    pub fn unspecified() -> Self {
        Address::IPv4(Ipv4Addr::UNSPECIFIED)
    }

    /// read_from parses the address body for the given ATYP byte. The ATYP
    /// itself must already have been consumed.
    pub async fn read_from<R>(reader: &mut R, atyp: u8) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        match AddressType::from_byte(atyp) {
            Some(AddressType::IPv4) => {
                let mut addr = [0u8; 4];
                reader.read_exact(&mut addr).await?;
                Ok(Address::IPv4(Ipv4Addr::from(addr)))
            }
            Some(AddressType::DomainName) => {
                // First octet in DomainName contains the number of
                // octets to follow
                let len = reader.read_u8().await?;
                let mut domain = vec![0u8; len as usize];
                reader.read_exact(&mut domain).await?;

                if domain.is_empty() {
                    return Err(ProtocolError::InvalidDomain("empty".into()));
                }
                let domain = String::from_utf8(domain)
                    .map_err(|e| ProtocolError::InvalidDomain(e.to_string()))?;
                Ok(Address::DomainName(domain))
            }
            Some(AddressType::IPv6) => {
                let mut addr = [0u8; 16];
                reader.read_exact(&mut addr).await?;
                Ok(Address::IPv6(Ipv6Addr::from(addr)))
            }
            None => Err(ProtocolError::UnsupportedAddressType(atyp)),
        }
    }

    /// write_to appends ATYP and the address body
    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        buf.push(self.address_type() as u8);
        match self {
            Address::IPv4(ip) => buf.extend_from_slice(&ip.octets()),
            Address::IPv6(ip) => buf.extend_from_slice(&ip.octets()),
            Address::DomainName(domain) => {
                let len = domain.len();
                if len == 0 {
                    return Err(ProtocolError::InvalidDomain("empty".into()));
                }
                if len > u8::MAX as usize {
                    return Err(ProtocolError::FieldTooLong {
                        field: "domain name",
                        len,
                    });
                }
                buf.push(len as u8);
                buf.extend_from_slice(domain.as_bytes());
            }
        }
        Ok(())
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Address::IPv4(ip),
            IpAddr::V6(ip) => Address::IPv6(ip),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        addr.ip().into()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::IPv4(ip) => write!(f, "{ip}"),
            Address::DomainName(domain) => f.write_str(domain),
            Address::IPv6(ip) => write!(f, "[{ip}]"),
        }
    }
}
