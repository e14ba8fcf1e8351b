//! SOCKS5 frontend: RFC 1928 greeting, RFC 1929 username/password
//! sub-negotiation (the only method offered), CONNECT only.
//!
//! The username/password pair doubles as the routing key: authentication
//! succeeds exactly when the identity has an upstream in the route table.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::app_state::AppState;
use crate::error::ProxyError;
use crate::relay;
use crate::routes::RouteTable;
use crate::session::SessionInfo;
use crate::upstream::socks5::{
    ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, AUTH_VERSION, CMD_CONNECT, METHOD_NO_ACCEPT,
    METHOD_USERPASS, REP_CMD_NOT_SUPPORTED, REP_GENERAL_FAILURE, REP_SUCCESS, VERSION5,
};
use crate::upstream::UpstreamSpec;

const AUTH_OK: [u8; 2] = [AUTH_VERSION, 0x00];
const AUTH_FAIL: [u8; 2] = [AUTH_VERSION, 0x01];

/// Accept loop. Runs until `shutdown` is notified; every connection gets
/// its own task.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: Arc<Notify>) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, client_addr)) => {
                    let state = state.clone();
                    tokio::spawn(handle_client(stream, client_addr, state));
                }
                Err(e) => {
                    tracing::warn!("socks5 accept error: {}", e);
                }
            },
            _ = shutdown.notified() => return,
        }
    }
}

async fn handle_client(mut stream: TcpStream, client_addr: SocketAddr, state: AppState) {
    let negotiated = timeout(
        state.handshake_timeout,
        negotiate(&mut stream, &state),
    )
    .await;

    let (username, spec, target) = match negotiated {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            tracing::debug!("socks5 {}: {}", client_addr, e);
            return;
        }
        Err(_) => {
            tracing::debug!("socks5 {}: handshake timed out", client_addr);
            return;
        }
    };

    let upstream = match state.connector.connect(&spec, &target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!("socks5 {} -> {}: {}", client_addr, target, e);
            let _ = stream.write_all(&reply(REP_GENERAL_FAILURE)).await;
            return;
        }
    };

    if stream.write_all(&reply(REP_SUCCESS)).await.is_err() {
        return;
    }

    let session = SessionInfo::new(client_addr, username.clone(), target.clone());
    let id = state.sessions.register(session).await;
    tracing::info!(
        "socks5 {} user {} tunneled to {}",
        client_addr,
        username,
        target
    );

    let (sent, received) = relay::splice(stream, upstream, state.idle_timeout).await;
    state.sessions.finish(id).await;
    tracing::info!(
        "socks5 {} -> {} closed (sent: {}, received: {})",
        client_addr,
        target,
        sent,
        received
    );
}

/// Runs the pre-relay phases: method selection, sub-negotiation, CONNECT
/// parsing. Writes exactly one reply per phase; every error reply a phase
/// owns is written here before the error is returned.
async fn negotiate<S>(
    stream: &mut S,
    state: &AppState,
) -> Result<(String, UpstreamSpec, String), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // greeting: VER NMETHODS METHODS
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != VERSION5 {
        return Err(ProxyError::MalformedRequest(format!(
            "version {:#04x} in greeting",
            header[0]
        )));
    }
    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_USERPASS) {
        stream.write_all(&[VERSION5, METHOD_NO_ACCEPT]).await?;
        return Err(ProxyError::AuthRequired);
    }
    stream.write_all(&[VERSION5, METHOD_USERPASS]).await?;

    // sub-negotiation: VER ULEN UNAME PLEN PASSWD
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != AUTH_VERSION {
        return Err(ProxyError::MalformedRequest(format!(
            "auth version {:#04x}",
            header[0]
        )));
    }
    let mut username = vec![0u8; header[1] as usize];
    stream.read_exact(&mut username).await?;
    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut password = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut password).await?;

    // Table keys are UTF-8 strings (they come from YAML or the registrar),
    // so credentials that are not valid UTF-8 cannot match any entry.
    let (username, password) = match (String::from_utf8(username), String::from_utf8(password)) {
        (Ok(u), Ok(p)) => (u, p),
        _ => {
            stream.write_all(&AUTH_FAIL).await?;
            return Err(ProxyError::AuthRejected("<non-utf8>".to_string()));
        }
    };

    let identity = RouteTable::identity(&username, &password);
    let spec = match state.routes.lookup(&identity).await {
        Some(spec) => spec,
        None => {
            stream.write_all(&AUTH_FAIL).await?;
            return Err(ProxyError::AuthRejected(username));
        }
    };
    stream.write_all(&AUTH_OK).await?;

    // request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != VERSION5 {
        return Err(ProxyError::MalformedRequest(format!(
            "version {:#04x} in request",
            request[0]
        )));
    }
    if request[1] != CMD_CONNECT {
        stream.write_all(&reply(REP_CMD_NOT_SUPPORTED)).await?;
        return Err(ProxyError::UnsupportedCommand(format!(
            "socks5 command {:#04x}",
            request[1]
        )));
    }

    let target = read_target(stream, request[3]).await?;
    Ok((username, spec, target))
}

async fn read_target<S>(stream: &mut S, atyp: u8) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| {
                ProxyError::MalformedRequest("non-ASCII domain in request".to_string())
            })?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            format!("[{}]", std::net::Ipv6Addr::from(octets))
        }
        other => {
            return Err(ProxyError::MalformedRequest(format!(
                "address type {:#04x}",
                other
            )))
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(format!("{}:{}", host, u16::from_be_bytes(port)))
}

fn reply(rep: u8) -> [u8; 10] {
    [VERSION5, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Frontend bound to an ephemeral port with one routable identity.
    async fn start_frontend(forward: &str) -> SocketAddr {
        let state = AppState::new(&crate::config::Config::default());
        state
            .routes
            .upsert(
                RouteTable::identity("alice", "pw"),
                UpstreamSpec::parse(forward).unwrap(),
            )
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, state, Arc::new(Notify::new())));
        addr
    }

    #[tokio::test]
    async fn greeting_without_userpass_is_rejected() {
        let addr = start_frontend("http://127.0.0.1:1").await;
        let mut conn = TcpStream::connect(addr).await.unwrap();

        conn.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut selection = [0u8; 2];
        conn.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, METHOD_NO_ACCEPT]);
    }

    #[tokio::test]
    async fn wrong_password_fails_auth_and_closes() {
        let addr = start_frontend("http://127.0.0.1:1").await;
        let mut conn = TcpStream::connect(addr).await.unwrap();

        conn.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut selection = [0u8; 2];
        conn.read_exact(&mut selection).await.unwrap();
        assert_eq!(selection, [0x05, 0x02]);

        conn.write_all(&[0x01, 5]).await.unwrap();
        conn.write_all(b"alice").await.unwrap();
        conn.write_all(&[5]).await.unwrap();
        conn.write_all(b"wrong").await.unwrap();

        let mut status = [0u8; 2];
        conn.read_exact(&mut status).await.unwrap();
        assert_eq!(status, AUTH_FAIL);

        let mut rest = Vec::new();
        conn.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn bind_command_gets_command_not_supported() {
        let addr = start_frontend("http://127.0.0.1:1").await;
        let mut conn = TcpStream::connect(addr).await.unwrap();

        conn.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut selection = [0u8; 2];
        conn.read_exact(&mut selection).await.unwrap();

        conn.write_all(&[0x01, 5]).await.unwrap();
        conn.write_all(b"alice").await.unwrap();
        conn.write_all(&[2]).await.unwrap();
        conn.write_all(b"pw").await.unwrap();
        let mut status = [0u8; 2];
        conn.read_exact(&mut status).await.unwrap();
        assert_eq!(status, AUTH_OK);

        // CMD=BIND
        conn.write_all(&[0x05, 0x02, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0x00, 0x50])
            .await
            .unwrap();
        let mut rep = [0u8; 10];
        conn.read_exact(&mut rep).await.unwrap();
        assert_eq!(rep[1], REP_CMD_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn unreachable_upstream_answers_general_failure() {
        // port 1 is closed; the dial fails fast
        let addr = start_frontend("http://127.0.0.1:1").await;
        let mut conn = TcpStream::connect(addr).await.unwrap();

        conn.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut selection = [0u8; 2];
        conn.read_exact(&mut selection).await.unwrap();
        conn.write_all(&[0x01, 5]).await.unwrap();
        conn.write_all(b"alice").await.unwrap();
        conn.write_all(&[2]).await.unwrap();
        conn.write_all(b"pw").await.unwrap();
        let mut status = [0u8; 2];
        conn.read_exact(&mut status).await.unwrap();
        assert_eq!(status, AUTH_OK);

        let mut request = vec![0x05, CMD_CONNECT, 0x00, ATYP_DOMAIN, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&80u16.to_be_bytes());
        conn.write_all(&request).await.unwrap();

        let mut rep = [0u8; 10];
        conn.read_exact(&mut rep).await.unwrap();
        assert_eq!(rep[0], VERSION5);
        assert_eq!(rep[1], REP_GENERAL_FAILURE);
    }
}
