use crate::bridge::Socks5Bridge;
use crate::config::{DEFAULT_IDLE_TIMEOUT, DEFAULT_RELAY_BUFFER_SIZE};
use crate::error::{Error, ProtocolError};
use crate::message::{CommandReply, CommandRequest, MethodSelectionRequest};
use crate::protocol::{Command, METHOD_SELECTION_RESPONSE, ReplyCode};
use crate::relay::{RelayPipe, RelayStats, StopReason};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{error::Elapsed, timeout};
use tracing::{debug, info, trace, warn};

/// SessionState tracks where a session is in the SOCKS5 exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    AwaitMethodSelection,
    MethodAcked,
    AwaitCommand,
    CommandParsed,
    Connecting,
    Relaying,
    Closed,
}

/// Session is one accepted client connection
pub struct Session<S = TcpStream> {
    id: u64,
    stream: S,
    client_addr: SocketAddr,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(id: u64, stream: S, client_addr: SocketAddr) -> Self {
        info!("SESSION[{id}] opened from {client_addr}");
        Self {
            id,
            stream,
            client_addr,
            state: SessionState::AwaitMethodSelection,
        }
    }

    fn transition(&mut self, next: SessionState) {
        trace!("SESSION[{}] {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.stream.write_all(bytes).await.map_err(Error::SessionIo)?;
        self.stream.flush().await.map_err(Error::SessionIo)
    }

    /// reply writes a command reply; the reply is the last thing a client
    /// hears before either the relay or the close
    async fn reply(&mut self, reply: CommandReply) -> Result<(), Error> {
        let bytes = reply.encode()?;
        trace!("SESSION[{}] reply {:02x?}", self.id, bytes);
        self.write(&bytes).await
    }

    async fn close(mut self) {
        self.transition(SessionState::Closed);
        let _ = self.stream.shutdown().await;
        info!("SESSION[{}] closed", self.id);
    }
}

impl<S> fmt::Display for Session<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SESSION[{}]@{}", self.id, self.client_addr)
    }
}

/// SessionOutcome is how a session ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// the client went away or stalled before the method acknowledgement
    Abandoned(ProtocolError),
    /// a failure reply was sent and no relay started
    Rejected(ReplyCode),
    /// the relay ran and has now stopped
    Relayed(RelayStats),
}

/// SessionHandler drives one session from greeting to teardown
pub struct SessionHandler<B> {
    bridge: Arc<B>,
    idle_timeout: Duration,
    relay_buffer_size: usize,
}

impl<B> Clone for SessionHandler<B> {
    fn clone(&self) -> Self {
        Self {
            bridge: Arc::clone(&self.bridge),
            idle_timeout: self.idle_timeout,
            relay_buffer_size: self.relay_buffer_size,
        }
    }
}

impl<B: Socks5Bridge> SessionHandler<B> {
    pub fn new(bridge: Arc<B>) -> Self {
        Self {
            bridge,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_relay_buffer_size(mut self, relay_buffer_size: usize) -> Self {
        self.relay_buffer_size = relay_buffer_size;
        self
    }

    /// handle runs the session to completion. Protocol and connect failures
    /// are answered on the wire and reported as an outcome; only I/O errors
    /// while acknowledging the client come back as `Err`.
    pub async fn handle<S>(&self, mut session: Session<S>) -> Result<SessionOutcome, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let idle = self.idle_timeout;

        // method selection: whatever the client offers, it gets "no auth"
        let greeting = timeout(idle, MethodSelectionRequest::read_from(&mut session.stream)).await;
        let greeting = match idle_bounded(greeting, "method selection") {
            Ok(greeting) => greeting,
            Err(e) => {
                debug!("SESSION[{}] abandoned before method selection: {e}", session.id);
                session.close().await;
                return Ok(SessionOutcome::Abandoned(e));
            }
        };
        trace!("SESSION[{}] offered methods {:02x?}", session.id, greeting.methods);

        if let Err(e) = session.write(&METHOD_SELECTION_RESPONSE).await {
            session.close().await;
            return Err(e);
        }
        session.transition(SessionState::MethodAcked);

        session.transition(SessionState::AwaitCommand);
        let request = timeout(idle, CommandRequest::read_from(&mut session.stream)).await;
        let request = match idle_bounded(request, "command request") {
            Ok(request) => request,
            Err(e) => {
                let code = e.reply_code();
                debug!("SESSION[{}] will close, because {e}", session.id);
                return self.reject(session, code).await;
            }
        };
        session.transition(SessionState::CommandParsed);

        if request.command != Command::Connect {
            debug!(
                "SESSION[{}] will close, because {:?} is not supported",
                session.id, request.command
            );
            return self.reject(session, ReplyCode::CommandNotSupported).await;
        }

        session.transition(SessionState::Connecting);
        let outbound = match self
            .bridge
            .connect(session.id, &request.address, request.port)
            .await
        {
            Ok(outbound) => outbound,
            Err(e) => {
                let code = e.reply_code();
                warn!(
                    "SESSION[{}] connect {} [{}] exception: {e}",
                    session.id,
                    request.target(),
                    code
                );
                return self.reject(session, code).await;
            }
        };

        let bound = outbound
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        if let Err(e) = session.reply(CommandReply::new(ReplyCode::Succeeded, bound)).await {
            session.close().await;
            return Err(e);
        }

        session.transition(SessionState::Relaying);
        let id = session.id;
        let stats = RelayPipe::new(session.stream, outbound)
            .with_name(format!("SESSION[{id}]"))
            .with_buffer_size(self.relay_buffer_size)
            .add_listener(|event| {
                if let StopReason::Error(e) = event.reason {
                    debug!("Pipe[{}] {} {e}", event.pipe, event.direction);
                }
            })
            .start()
            .wait()
            .await;

        if let Some(e) = &stats.error {
            debug!("SESSION[{id}] relay ended on I/O error: {e}");
        }
        info!(
            "SESSION[{id}] closed: {} bytes from client, {} bytes from server",
            stats.forward_bytes, stats.backward_bytes
        );

        Ok(SessionOutcome::Relayed(stats))
    }

    /// reject answers with a failure reply and closes without relaying
    async fn reject<S>(&self, mut session: Session<S>, code: ReplyCode) -> Result<SessionOutcome, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Err(e) = session.reply(CommandReply::failure(code)).await {
            debug!("SESSION[{}] could not deliver {code} reply: {e}", session.id);
        }
        session.close().await;
        Ok(SessionOutcome::Rejected(code))
    }
}

fn idle_bounded<T>(
    read: Result<Result<T, ProtocolError>, Elapsed>,
    what: &'static str,
) -> Result<T, ProtocolError> {
    read.unwrap_or(Err(ProtocolError::IdleTimeout(what)))
}
