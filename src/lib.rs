//! A local SOCKS5 bridge to an authenticating upstream proxy
//!
//! Applications that can only speak anonymous SOCKS5 connect to a local port;
//! every session is forwarded through one remote SOCKS5 proxy that requires
//! username/password authentication.
//!
//! - Features:
//!     - Anonymous SOCKS5 server side, CONNECT only
//!     - Username/Password sub-negotiation towards the upstream proxy
//!     - Upstream reply codes forwarded unchanged to the local client
//!     - Bounded pool of concurrent sessions
//!     - Full-duplex relay with per-direction byte counts
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)
//!
//! # Example
//! ```no_run
//! use socks5_bridge::{BridgeConfig, BridgeServer, ProxyCredentials, ProxyEndpoint};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = ProxyEndpoint::new("proxy.example.net", 1080)
//!         .with_auth(Some(ProxyCredentials::new("user", "secret")));
//!     let server = BridgeServer::authenticating(BridgeConfig::new(1080, endpoint));
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod address;
pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod session;

// Re-export main types at crate root for convenience
pub use address::Address;
pub use auth::ProxyCredentials;
pub use bridge::{AuthenticatingBridge, Socks5Bridge};
pub use client::Socks5Client;
pub use config::{BridgeConfig, ProxyEndpoint};
pub use error::{
    AuthenticationError, ConnectError, ConnectFailure, Error, ListenerStateError, ProtocolError,
    Result,
};
pub use protocol::{AuthMethod, Command, ReplyCode, Version};
pub use server::BridgeServer;
