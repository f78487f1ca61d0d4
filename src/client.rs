//! Outbound SOCKS5 client: dials the upstream proxy, negotiates
//! authentication and issues a CONNECT for the final target.

use crate::address::Address;
use crate::auth::{self, ProxyCredentials};
use crate::config::{DEFAULT_CONNECT_TIMEOUT, ProxyEndpoint};
use crate::error::{ConnectError, ConnectFailure, ProtocolError};
use crate::message::{CommandReply, CommandRequest};
use crate::protocol::{AuthMethod, ReplyCode};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Socks5Client opens connections through one upstream proxy
#[derive(Debug, Clone)]
pub struct Socks5Client {
    endpoint: Arc<ProxyEndpoint>,
    connect_timeout: Duration,
}

impl Socks5Client {
    pub fn new(endpoint: Arc<ProxyEndpoint>) -> Self {
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }

    /// connect reaches `address:port` through the upstream, authenticating
    /// with the endpoint's credentials when it has any
    pub async fn connect(&self, address: &Address, port: u16) -> Result<TcpStream, ConnectError> {
        let stream = self.open().await?;
        handshake(stream, self.endpoint.credentials.as_ref(), address, port).await
    }

    /// connect_anonymous reaches `address:port` offering only "no authentication"
    pub async fn connect_anonymous(
        &self,
        address: &Address,
        port: u16,
    ) -> Result<TcpStream, ConnectError> {
        let stream = self.open().await?;
        handshake(stream, None, address, port).await
    }

    /// open establishes the TCP leg to the upstream proxy, trying every
    /// resolved address in turn
    async fn open(&self) -> Result<TcpStream, ConnectError> {
        let target = self.endpoint.address();

        let addrs = lookup_host(&target).await.map_err(|e| ConnectError::Transport {
            target: target.clone(),
            failure: ConnectFailure::HostUnreachable,
            source: e,
        })?;

        let mut last_err =
            io::Error::new(io::ErrorKind::HostUnreachable, "proxy host resolved to no addresses");

        for addr in addrs {
            match bounded(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(stream) => {
                    debug!("connected to upstream proxy {addr}");
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }

        Err(ConnectError::transport(target, last_err))
    }
}

/// bounded runs a connect attempt under `limit`; running out of time is a
/// `TimedOut` error like any other transport failure
async fn bounded<T>(
    limit: Duration,
    connecting: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    timeout(limit, connecting).await.unwrap_or_else(|_| {
        Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no answer within {limit:?}"),
        ))
    })
}

/// handshake runs method negotiation, optional username/password
/// sub-negotiation and the CONNECT exchange over an already open stream,
/// returning the stream ready to carry payload
pub async fn handshake<S>(
    mut stream: S,
    credentials: Option<&ProxyCredentials>,
    address: &Address,
    port: u16,
) -> Result<S, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let method = auth::negotiate_method(&mut stream, credentials).await?;

    if let (AuthMethod::UserPass, Some(credentials)) = (method, credentials) {
        auth::authenticate_userpass(&mut stream, credentials).await?;
    }

    let request = CommandRequest::connect(address.clone(), port).encode()?;
    trace!("sending CONNECT {:02x?}", request);
    stream.write_all(&request).await.map_err(ProtocolError::from)?;
    stream.flush().await.map_err(ProtocolError::from)?;

    let reply = CommandReply::read_from(&mut stream).await?;
    debug!(
        "upstream replied {} for {address}:{port}, bound {}:{}",
        reply.reply, reply.bind_address, reply.bind_port
    );

    match reply.reply {
        ReplyCode::Succeeded => Ok(stream),
        code => {
            let _ = stream.shutdown().await;
            Err(ConnectError::Rejected(code))
        }
    }
}
