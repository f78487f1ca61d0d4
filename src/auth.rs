use crate::error::{AuthenticationError, ConnectError, ProtocolError};
use crate::message::{MethodSelectionRequest, MethodSelectionResponse, UserPassRequest, UserPassResponse};
use crate::protocol::{AuthMethod, Version};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// ProxyCredentials holds the username/password presented to the
/// upstream proxy
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl ProxyCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// negotiate_method sends the client greeting and returns the method the
/// upstream selected. Username/password is only offered when credentials
/// are configured.
pub async fn negotiate_method<S>(
    stream: &mut S,
    credentials: Option<&ProxyCredentials>,
) -> Result<AuthMethod, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let methods = match credentials {
        Some(_) => vec![AuthMethod::NoAuth as u8, AuthMethod::UserPass as u8],
        None => vec![AuthMethod::NoAuth as u8],
    };
    let greeting = MethodSelectionRequest::new(methods).encode();
    trace!("sending greeting {:02x?}", greeting);
    write_frame(stream, &greeting).await?;

    let selection = MethodSelectionResponse::read_from(stream).await?;
    trace!("upstream selected {:02x?}", selection.encode());

    if selection.version != Version::SOCKS5 as u8 {
        return Err(ProtocolError::UnsupportedVersion(selection.version).into());
    }

    match AuthMethod::from_byte(selection.method) {
        Some(AuthMethod::NoAuth) => Ok(AuthMethod::NoAuth),
        Some(AuthMethod::UserPass) if credentials.is_some() => Ok(AuthMethod::UserPass),
        Some(AuthMethod::UserPass) => Err(AuthenticationError::CredentialsRequired.into()),
        _ => Err(AuthenticationError::NoAcceptableMethod(selection.method).into()),
    }
}

/// authenticate_userpass runs the RFC 1929 exchange. On a non-zero status
/// the stream is shut down before the error is returned.
pub async fn authenticate_userpass<S>(
    stream: &mut S,
    credentials: &ProxyCredentials,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if credentials.username.len() > u8::MAX as usize {
        return Err(AuthenticationError::CredentialTooLong("username").into());
    }
    if credentials.password.len() > u8::MAX as usize {
        return Err(AuthenticationError::CredentialTooLong("password").into());
    }

    let request = UserPassRequest {
        username: credentials.username.as_bytes().to_vec(),
        password: credentials.password.as_bytes().to_vec(),
    };
    write_frame(stream, &request.encode()?).await?;

    let response = UserPassResponse::read_from(stream).await?;
    if !response.is_success() {
        // Close connection if authentication failed
        let _ = stream.shutdown().await;
        return Err(AuthenticationError::Rejected {
            status: response.status,
        }
        .into());
    }

    debug!("authenticated to upstream as {}", credentials.username);
    Ok(())
}

async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}
