use crate::address::Address;
use crate::client::Socks5Client;
use crate::config::ProxyEndpoint;
use crate::error::ConnectError;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::info;

/// Socks5Bridge opens the outbound leg for an accepted session. This is the
/// seam the session handler depends on; implementations decide how the
/// target is reached.
pub trait Socks5Bridge: Send + Sync + 'static {
    fn connect(
        &self,
        session_id: u64,
        address: &Address,
        port: u16,
    ) -> impl Future<Output = Result<TcpStream, ConnectError>> + Send;
}

/// AuthenticatingBridge reaches targets through the configured upstream
/// proxy, authenticating when the endpoint carries credentials and
/// connecting anonymously otherwise
#[derive(Debug, Clone)]
pub struct AuthenticatingBridge {
    client: Socks5Client,
}

impl AuthenticatingBridge {
    pub fn new(endpoint: ProxyEndpoint) -> Self {
        Self {
            client: Socks5Client::new(Arc::new(endpoint)),
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.client = self.client.with_connect_timeout(connect_timeout);
        self
    }

    pub fn endpoint(&self) -> &ProxyEndpoint {
        self.client.endpoint()
    }
}

impl Socks5Bridge for AuthenticatingBridge {
    async fn connect(
        &self,
        session_id: u64,
        address: &Address,
        port: u16,
    ) -> Result<TcpStream, ConnectError> {
        let endpoint = self.client.endpoint();
        if endpoint.requires_authentication() {
            info!("SESSION[{session_id}] bridging to remote proxy {endpoint}");
            self.client.connect(address, port).await
        } else {
            info!("SESSION[{session_id}] bridging anonymously to remote proxy {endpoint}");
            self.client.connect_anonymous(address, port).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ProxyCredentials;
    use crate::message::{CommandRequest, MethodSelectionRequest, UserPassRequest};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    /// stub_upstream accepts one connection, answers the handshake and
    /// reports the greeting it saw and whether sub-negotiation happened
    async fn stub_upstream(select: u8) -> (u16, tokio::task::JoinHandle<(Vec<u8>, bool)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let greeting = MethodSelectionRequest::read_from(&mut stream).await.unwrap();
            stream.write_all(&[0x05, select]).await.unwrap();

            let mut authenticated = false;
            if select == 0x02 {
                let request = UserPassRequest::read_from(&mut stream).await.unwrap();
                authenticated = request.username == b"u" && request.password == b"p";
                stream.write_all(&[0x01, 0x00]).await.unwrap();
            }

            CommandRequest::read_from(&mut stream).await.unwrap();
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
                .await
                .unwrap();
            (greeting.methods, authenticated)
        });

        (port, handle)
    }

    #[tokio::test]
    async fn credentials_select_authenticated_path() {
        let (port, upstream) = stub_upstream(0x02).await;
        let endpoint = ProxyEndpoint::new("127.0.0.1", port)
            .with_auth(Some(ProxyCredentials::new("u", "p")));

        let bridge = AuthenticatingBridge::new(endpoint);
        let target = Address::DomainName("example.com".into());
        bridge.connect(1, &target, 80).await.unwrap();

        let (methods, authenticated) = upstream.await.unwrap();
        assert_eq!(methods, vec![0x00, 0x02]);
        assert!(authenticated);
    }

    #[tokio::test]
    async fn no_credentials_select_anonymous_path() {
        let (port, upstream) = stub_upstream(0x00).await;
        let bridge = AuthenticatingBridge::new(ProxyEndpoint::new("127.0.0.1", port));

        let target = Address::DomainName("example.com".into());
        bridge.connect(2, &target, 80).await.unwrap();

        let (methods, authenticated) = upstream.await.unwrap();
        assert_eq!(methods, vec![0x00]);
        assert!(!authenticated);
    }
}
