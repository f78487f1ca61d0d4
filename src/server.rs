use crate::bridge::{AuthenticatingBridge, Socks5Bridge};
use crate::config::BridgeConfig;
use crate::error::{Error, ListenerStateError, Result};
use crate::session::{Session, SessionHandler, SessionOutcome};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tokio::sync::{Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const LISTEN_BACKLOG: u32 = 1024;

/// Listener is the accepting side of the server
pub(crate) trait Listener: Send + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Listener for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// BridgeServer is the relay listener: it accepts local clients and hands
/// each one to a session handler on a bounded pool of tasks
pub struct BridgeServer<B> {
    config: BridgeConfig,
    handler: SessionHandler<B>,
    sessions: Mutex<Option<Arc<Semaphore>>>,
    next_session: Arc<AtomicU64>,
    flags: Arc<Flags>,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<Result<()>>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// flags shared between the owner and the accept loop
struct Flags {
    running: AtomicBool,
    stopping: AtomicBool,
    closed: Notify,
}

impl BridgeServer<AuthenticatingBridge> {
    /// authenticating builds a server that reaches every target through the
    /// configured upstream proxy
    pub fn authenticating(config: BridgeConfig) -> Self {
        let bridge = AuthenticatingBridge::new(config.endpoint.clone())
            .with_connect_timeout(config.connect_timeout);
        Self::new(config, Arc::new(bridge))
    }
}

impl<B: Socks5Bridge> BridgeServer<B> {
    pub fn new(config: BridgeConfig, bridge: Arc<B>) -> Self {
        let handler = SessionHandler::new(bridge)
            .with_idle_timeout(config.idle_timeout)
            .with_relay_buffer_size(config.relay_buffer_size);
        let (shutdown, _) = watch::channel(false);

        Self {
            sessions: Mutex::new(None),
            config,
            handler,
            next_session: Arc::new(AtomicU64::new(1)),
            flags: Arc::new(Flags {
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                closed: Notify::new(),
            }),
            shutdown,
            accept_task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.flags.stopping.load(Ordering::SeqCst)
    }

    /// local_addr is the bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// start binds the listening socket and spawns the accept loop
    pub async fn start(&self) -> Result<SocketAddr> {
        self.claim()?;

        match self.bind().await {
            Ok((listener, addr)) => {
                self.launch(listener, addr);
                Ok(addr)
            }
            Err(e) => {
                self.flags.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// claim flips the listener to running, failing if it already is
    fn claim(&self) -> Result<()> {
        self.flags
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| ListenerStateError::AlreadyRunning.into())
    }

    /// launch spawns the accept loop over a bound listener with a fresh
    /// session pool
    fn launch<L: Listener>(&self, listener: L, addr: SocketAddr) {
        let sessions = Arc::new(Semaphore::new(self.config.max_sessions));

        self.shutdown.send_replace(false);
        let task = tokio::spawn(accept_loop(
            listener,
            self.handler.clone(),
            Arc::clone(&sessions),
            Arc::clone(&self.next_session),
            Arc::clone(&self.flags),
            self.shutdown.subscribe(),
        ));

        *self.sessions.lock().unwrap_or_else(PoisonError::into_inner) = Some(sessions);
        *self.accept_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);

        info!(
            "SOCKS5 bridge listening on {addr}, forwarding to {}",
            self.config.endpoint
        );
    }

    /// stop closes the listening socket and the session pool, then waits for
    /// the accept loop to return. Connections still queued for a pool slot
    /// are dropped; sessions that hold one run on to completion.
    pub async fn stop(&self) -> Result<()> {
        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return Err(ListenerStateError::NotRunning.into());
        };

        self.flags.stopping.store(true, Ordering::SeqCst);
        self.shutdown.send_replace(true);
        if let Some(sessions) = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            sessions.close();
        }

        let result = match task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Accept(io::Error::other(e))),
        };

        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.flags.running.store(false, Ordering::SeqCst);
        self.flags.stopping.store(false, Ordering::SeqCst);
        info!("SOCKS5 bridge stopped");
        result
    }

    /// closed completes once the accept loop has ended on its own, after a
    /// fatal accept error
    pub async fn closed(&self) {
        self.flags.closed.notified().await
    }

    async fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        let addr = self.config.listen_addr();
        let bind_err = |source| Error::Bind {
            addr: addr.clone(),
            source,
        };

        let resolved = lookup_host(&addr)
            .await
            .map_err(bind_err)?
            .next()
            .ok_or_else(|| {
                bind_err(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "bind host resolved to no addresses",
                ))
            })?;

        let socket = if resolved.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(resolved).map_err(bind_err)?;

        let listener = socket.listen(LISTEN_BACKLOG).map_err(bind_err)?;
        let local = listener.local_addr().map_err(bind_err)?;
        Ok((listener, local))
    }
}

async fn accept_loop<B: Socks5Bridge, L: Listener>(
    listener: L,
    handler: SessionHandler<B>,
    sessions: Arc<Semaphore>,
    next_session: Arc<AtomicU64>,
    flags: Arc<Flags>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => {
                debug!("listener closed");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("accept failed, listener going down: {e}");
                flags.running.store(false, Ordering::SeqCst);
                flags.closed.notify_one();
                return Err(Error::Accept(e));
            }
        };

        let id = next_session.fetch_add(1, Ordering::Relaxed);
        let handler = handler.clone();
        let sessions = Arc::clone(&sessions);

        tokio::spawn(async move {
            // hold a pool slot for the session's whole life, relay included
            let Ok(_permit) = sessions.acquire_owned().await else {
                debug!("SESSION[{id}] dropped, listener stopped before a slot freed up");
                return;
            };
            let session = Session::new(id, stream, peer);
            debug!("dispatching {session}");

            match handler.handle(session).await {
                Ok(SessionOutcome::Relayed(_)) => {}
                Ok(outcome) => debug!("SESSION[{id}] ended without relay: {outcome:?}"),
                Err(e) => warn!("SESSION[{id}] failed: {e}"),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::config::ProxyEndpoint;
    use crate::error::ConnectError;
    use crate::protocol::ReplyCode;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    /// RefusingBridge never reaches anything
    struct RefusingBridge;

    impl Socks5Bridge for RefusingBridge {
        async fn connect(
            &self,
            _session_id: u64,
            _address: &Address,
            _port: u16,
        ) -> std::result::Result<TcpStream, ConnectError> {
            Err(ConnectError::Rejected(ReplyCode::ConnectionNotAllowed))
        }
    }

    fn server(max_sessions: usize) -> BridgeServer<RefusingBridge> {
        let config = BridgeConfig::new(0, ProxyEndpoint::new("127.0.0.1", 1080))
            .with_max_sessions(max_sessions)
            .with_idle_timeout(Duration::from_secs(5));
        BridgeServer::new(config, Arc::new(RefusingBridge))
    }

    async fn ack(stream: &mut TcpStream) -> [u8; 2] {
        stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut ack = [0u8; 2];
        stream.read_exact(&mut ack).await.unwrap();
        ack
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let server = server(4);
        server.start().await.unwrap();
        assert!(server.is_running());

        let err = server.start().await.unwrap_err();
        assert!(matches!(
            err,
            Error::ListenerState(ListenerStateError::AlreadyRunning)
        ));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_rejected() {
        let err = server(4).stop().await.unwrap_err();
        assert!(matches!(err, Error::ListenerState(ListenerStateError::NotRunning)));
    }

    #[tokio::test]
    async fn stop_closes_listener_and_allows_restart() {
        let server = server(4);
        let first = server.start().await.unwrap();
        assert_eq!(server.local_port(), Some(first.port()));

        timeout(Duration::from_secs(5), server.stop())
            .await
            .unwrap()
            .unwrap();
        assert!(!server.is_running());
        assert!(!server.is_stopping());
        assert_eq!(server.local_port(), None);
        assert!(TcpStream::connect(first).await.is_err());

        let second = server.start().await.unwrap();
        let mut client = TcpStream::connect(second).await.unwrap();
        assert_eq!(ack(&mut client).await, [0x05, 0x00]);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn bridge_failure_reaches_client_as_reply() {
        let server = server(4);
        let addr = server.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        ack(&mut client).await;
        client
            .write_all(&[0x05, 0x01, 0x00, 0x03, 4, b'm', b'a', b'i', b'l', 0, 25])
            .await
            .unwrap();

        let mut reply = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, vec![0x05, 0x02, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn sessions_beyond_capacity_wait_for_a_slot() {
        let server = server(1);
        let addr = server.start().await.unwrap();

        // the first client occupies the only slot without saying anything
        let first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut ack = [0u8; 2];
        assert!(
            timeout(Duration::from_millis(200), second.read_exact(&mut ack))
                .await
                .is_err()
        );

        drop(first);
        timeout(Duration::from_secs(5), second.read_exact(&mut ack))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ack, [0x05, 0x00]);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_drops_sessions_still_waiting_for_a_slot() {
        let server = server(1);
        let addr = server.start().await.unwrap();

        let first = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.stop().await.unwrap();
        // the slot frees up only after the pool has been closed
        drop(first);

        let mut rest = Vec::new();
        let read = timeout(Duration::from_secs(5), second.read_to_end(&mut rest))
            .await
            .unwrap();
        // closed, possibly reset because the greeting was never read
        assert!(read.is_err() || rest.is_empty());
    }

    /// BrokenListener fails every accept
    struct BrokenListener;

    impl Listener for BrokenListener {
        async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
            Err(io::Error::other("too many open files"))
        }
    }

    #[tokio::test]
    async fn failed_accept_takes_listener_down() {
        let server = server(4);
        server.claim().unwrap();
        server.launch(BrokenListener, "127.0.0.1:1080".parse().unwrap());

        timeout(Duration::from_secs(5), server.closed())
            .await
            .unwrap();
        assert!(!server.is_running());

        let err = server.stop().await.unwrap_err();
        assert!(matches!(err, Error::Accept(_)));
        assert!(matches!(
            server.stop().await.unwrap_err(),
            Error::ListenerState(ListenerStateError::NotRunning)
        ));

        // a fresh start is allowed after the failure
        server.start().await.unwrap();
        server.stop().await.unwrap();
    }
}
