//! HTTP CONNECT spoken as a client towards an upstream proxy.

use base64::Engine;
use byte_pool::BytePool;
use lazy_static::lazy_static;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;
use crate::upstream::ProxyAuth;

const INITIAL_HEAD_SIZE: usize = 1024;
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

lazy_static! {
    static ref HEAD_POOL: BytePool<Vec<u8>> = BytePool::<Vec<u8>>::new();
}

/// Issues `CONNECT target HTTP/1.1` on an already-established stream and
/// consumes the response head. Only a `200` opens the tunnel; anything else
/// (including a malformed status line or a mid-handshake close) is
/// `UpstreamRejected`.
pub async fn connect_through<S>(
    stream: &mut S,
    target: &str,
    auth: Option<&ProxyAuth>,
) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = HEAD_POOL.alloc(INITIAL_HEAD_SIZE);
    head.clear();
    head.extend_from_slice(b"CONNECT ");
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b" HTTP/1.1\r\nHost: ");
    head.extend_from_slice(target.as_bytes());
    head.extend_from_slice(b"\r\n");
    if let Some(auth) = auth {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", auth.username, auth.password));
        head.extend_from_slice(b"Proxy-Authorization: Basic ");
        head.extend_from_slice(token.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    stream.write_all(&head).await?;

    let status = read_response_status(stream).await?;
    if status != 200 {
        return Err(ProxyError::UpstreamRejected(format!(
            "proxy answered {} to CONNECT {}",
            status, target
        )));
    }
    Ok(())
}

/// Reads the response head byte by byte up to and including the blank line,
/// so no tunneled byte is ever consumed, and returns the status code.
async fn read_response_status<S>(stream: &mut S) -> Result<u16, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(ProxyError::UpstreamRejected(
                "oversized CONNECT response head".to_string(),
            ));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| ProxyError::UpstreamRejected(format!("reading CONNECT response: {}", e)))?;
        if n == 0 {
            return Err(ProxyError::UpstreamRejected(
                "connection closed during CONNECT handshake".to_string(),
            ));
        }
        head.push(byte[0]);
    }
    parse_status_line(&head)
}

fn parse_status_line(head: &[u8]) -> Result<u16, ProxyError> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| ProxyError::UpstreamRejected("non-ASCII status line".to_string()))?;

    let mut parts = line.split_whitespace();
    match parts.next() {
        Some(version) if version.starts_with("HTTP/") => {}
        _ => {
            return Err(ProxyError::UpstreamRejected(format!(
                "malformed status line {:?}",
                line
            )))
        }
    }
    parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| ProxyError::UpstreamRejected(format!("malformed status line {:?}", line)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_parses_code() {
        assert_eq!(
            parse_status_line(b"HTTP/1.1 200 Connection Established\r\n\r\n").unwrap(),
            200
        );
        assert_eq!(parse_status_line(b"HTTP/1.0 407 Nope\r\n\r\n").unwrap(), 407);
    }

    #[test]
    fn garbage_status_line_is_rejected() {
        assert!(parse_status_line(b"SSH-2.0-OpenSSH\r\n\r\n").is_err());
        assert!(parse_status_line(b"HTTP/1.1 abc\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn connect_sends_auth_header_and_accepts_200() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let auth = ProxyAuth {
            username: "alice".to_string(),
            password: "pw".to_string(),
        };

        let driver = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 Connection Established\r\nVia: test\r\n\r\n")
                .await
                .unwrap();
            request
        });

        connect_through(&mut client, "example.com:443", Some(&auth))
            .await
            .unwrap();

        let request = driver.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:443\r\n"));
        // alice:pw
        assert!(request.contains("Proxy-Authorization: Basic YWxpY2U6cHc=\r\n"));
    }

    #[tokio::test]
    async fn non_200_is_upstream_rejected() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
                .await
                .unwrap();
        });

        let err = connect_through(&mut client, "example.com:80", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamRejected(_)));
    }
}
