//! SOCKS5 spoken as a client towards an upstream proxy, plus the wire
//! constants shared with the client-facing frontend.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;
use crate::upstream::{split_host_port, ProxyAuth};

pub const VERSION5: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

pub const METHOD_NONE: u8 = 0x00;
pub const METHOD_USERPASS: u8 = 0x02;
pub const METHOD_NO_ACCEPT: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;

/// Greeting and (when the server asks for it) username/password
/// sub-negotiation against a freshly dialed SOCKS5 proxy.
pub async fn handshake<S>(stream: &mut S, auth: Option<&ProxyAuth>) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offered = if auth.is_some() {
        METHOD_USERPASS
    } else {
        METHOD_NONE
    };
    stream.write_all(&[VERSION5, 1, offered]).await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != VERSION5 {
        return Err(ProxyError::UpstreamRejected(format!(
            "bad version {:#04x} in method selection",
            selection[0]
        )));
    }
    match selection[1] {
        METHOD_NO_ACCEPT => Err(ProxyError::UpstreamRejected(
            "no acceptable auth method".to_string(),
        )),
        method if method != offered => Err(ProxyError::UpstreamRejected(format!(
            "server selected unoffered method {:#04x}",
            method
        ))),
        METHOD_USERPASS => {
            // offered implies auth is present
            let auth = auth.ok_or_else(|| {
                ProxyError::UpstreamRejected("server demanded credentials".to_string())
            })?;
            authenticate(stream, auth).await
        }
        _ => Ok(()),
    }
}

async fn authenticate<S>(stream: &mut S, auth: &ProxyAuth) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (user, pass) = (auth.username.as_bytes(), auth.password.as_bytes());
    if user.len() > 255 || pass.len() > 255 {
        return Err(ProxyError::UpstreamRejected(
            "credentials longer than 255 bytes".to_string(),
        ));
    }
    let mut packet = Vec::with_capacity(3 + user.len() + pass.len());
    packet.push(AUTH_VERSION);
    packet.push(user.len() as u8);
    packet.extend_from_slice(user);
    packet.push(pass.len() as u8);
    packet.extend_from_slice(pass);
    stream.write_all(&packet).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;
    if status[1] != 0x00 {
        return Err(ProxyError::UpstreamRejected(
            "username/password rejected".to_string(),
        ));
    }
    Ok(())
}

/// Sends `CMD=CONNECT` for `target` and checks the reply, consuming the
/// bound address whose length depends on the reply's ATYP.
pub async fn connect_through<S>(stream: &mut S, target: &str) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (host, port) = split_host_port(target)
        .ok_or_else(|| ProxyError::MalformedRequest(format!("bad target {:?}", target)))?;
    let port = port.unwrap_or(80);

    let mut request = vec![VERSION5, CMD_CONNECT, 0x00];
    encode_address(&mut request, &host)?;
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION5 {
        return Err(ProxyError::UpstreamRejected(format!(
            "bad version {:#04x} in CONNECT reply",
            reply[0]
        )));
    }
    if reply[1] != REP_SUCCESS {
        return Err(ProxyError::UpstreamRejected(format!(
            "CONNECT to {} refused, rep={:#04x}",
            target, reply[1]
        )));
    }
    discard_bound_address(stream, reply[3]).await?;
    Ok(())
}

/// ATYP + address bytes. IP literals go as themselves; everything else is a
/// length-prefixed domain, left to the proxy to resolve.
fn encode_address(buf: &mut Vec<u8>, host: &str) -> Result<(), ProxyError> {
    if let Ok(v4) = host.parse::<std::net::Ipv4Addr>() {
        buf.push(ATYP_IPV4);
        buf.extend_from_slice(&v4.octets());
    } else if let Ok(v6) = host.parse::<std::net::Ipv6Addr>() {
        buf.push(ATYP_IPV6);
        buf.extend_from_slice(&v6.octets());
    } else {
        let name = host.as_bytes();
        if name.len() > 255 {
            return Err(ProxyError::MalformedRequest(format!(
                "domain {:?} longer than 255 bytes",
                host
            )));
        }
        buf.push(ATYP_DOMAIN);
        buf.push(name.len() as u8);
        buf.extend_from_slice(name);
    }
    Ok(())
}

async fn discard_bound_address<S>(stream: &mut S, atyp: u8) -> Result<(), ProxyError>
where
    S: AsyncRead + Unpin,
{
    match atyp {
        ATYP_IPV4 => {
            let mut tail = [0u8; 6];
            stream.read_exact(&mut tail).await?;
        }
        ATYP_IPV6 => {
            let mut tail = [0u8; 18];
            stream.read_exact(&mut tail).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut tail = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut tail).await?;
        }
        other => {
            return Err(ProxyError::UpstreamRejected(format!(
                "bad ATYP {:#04x} in CONNECT reply",
                other
            )))
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ip_literals_and_domains() {
        let mut buf = Vec::new();
        encode_address(&mut buf, "10.0.0.1").unwrap();
        assert_eq!(buf, [ATYP_IPV4, 10, 0, 0, 1]);

        buf.clear();
        encode_address(&mut buf, "::1").unwrap();
        assert_eq!(buf[0], ATYP_IPV6);
        assert_eq!(buf.len(), 17);

        buf.clear();
        encode_address(&mut buf, "example.com").unwrap();
        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1], 11);
        assert_eq!(&buf[2..], b"example.com");
    }

    #[test]
    fn overlong_domain_is_an_error() {
        let mut buf = Vec::new();
        let long = "a".repeat(256);
        assert!(encode_address(&mut buf, &long).is_err());
    }

    #[tokio::test]
    async fn handshake_negotiates_userpass() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let auth = ProxyAuth {
            username: "u".to_string(),
            password: "p".to_string(),
        };

        let driver = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VERSION5, 1, METHOD_USERPASS]);
            server.write_all(&[VERSION5, METHOD_USERPASS]).await.unwrap();

            let mut auth_packet = [0u8; 5];
            server.read_exact(&mut auth_packet).await.unwrap();
            assert_eq!(auth_packet, [AUTH_VERSION, 1, b'u', 1, b'p']);
            server.write_all(&[AUTH_VERSION, 0x00]).await.unwrap();
        });

        handshake(&mut client, Some(&auth)).await.unwrap();
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn reply_with_domain_bound_address_is_consumed() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let driver = tokio::spawn(async move {
            let mut request = vec![0u8; 4 + 1 + 11 + 2];
            server.read_exact(&mut request).await.unwrap();
            assert_eq!(&request[..4], &[VERSION5, CMD_CONNECT, 0x00, ATYP_DOMAIN]);

            let mut reply = vec![VERSION5, REP_SUCCESS, 0x00, ATYP_DOMAIN, 4];
            reply.extend_from_slice(b"gate");
            reply.extend_from_slice(&8080u16.to_be_bytes());
            server.write_all(&reply).await.unwrap();
            // tunnel byte following the reply must survive untouched
            server.write_all(b"!").await.unwrap();
        });

        connect_through(&mut client, "example.com:80").await.unwrap();
        let mut first = [0u8; 1];
        client.read_exact(&mut first).await.unwrap();
        assert_eq!(&first, b"!");
        driver.await.unwrap();
    }

    #[tokio::test]
    async fn refused_connect_reports_rejection() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut request = vec![0u8; 4 + 4 + 2];
            server.read_exact(&mut request).await.unwrap();
            server
                .write_all(&[VERSION5, 0x05, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
        });

        let err = connect_through(&mut client, "10.0.0.1:443").await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamRejected(_)));
    }

    #[tokio::test]
    async fn handshake_without_credentials_offers_no_auth() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let driver = tokio::spawn(async move {
            let mut greeting = [0u8; 3];
            server.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [VERSION5, 1, METHOD_NONE]);
            server.write_all(&[VERSION5, METHOD_NONE]).await.unwrap();
        });
        handshake(&mut client, None).await.unwrap();
        driver.await.unwrap();
    }
}
