//! Opens a TCP stream to a target, tunneled through an [`UpstreamSpec`].

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::ProxyError;
use crate::upstream::{http, socks5, ProxyAuth, ProxyUrl, Scheme, UpstreamSpec};

/// Tunnel builder shared by both frontends.
///
/// For a chain, only the first hop is dialed directly; every subsequent hop
/// and the final target are reached with CONNECT commands issued *in the
/// first hop's protocol*, credentials presented to the first hop only.
/// Later hops therefore must accept the first hop's framing - a quirk of
/// the chain format that callers configuring mixed chains need to be aware
/// of. Hop credentials beyond the first are stripped, never forwarded.
#[derive(Debug, Clone, Copy)]
pub struct Connector {
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl Connector {
    pub fn new(dial_timeout: Duration, handshake_timeout: Duration) -> Self {
        Connector {
            dial_timeout,
            handshake_timeout,
        }
    }

    /// Establishes a stream whose far end is `target`, reached through
    /// `spec`. On any failure the partially built connection is dropped;
    /// no socket outlives the error.
    pub async fn connect(
        &self,
        spec: &UpstreamSpec,
        target: &str,
    ) -> Result<TcpStream, ProxyError> {
        let hops = spec.hops();
        let first = &hops[0];
        let mut stream = self.dial_first(first).await?;

        // With an HTTP first hop the credentials ride on the first CONNECT;
        // a SOCKS5 first hop has already consumed them in dial_first.
        let mut first_auth = match first.scheme {
            Scheme::Socks5 => None,
            Scheme::Http | Scheme::Https => first.auth.as_ref(),
        };

        for hop in &hops[1..] {
            self.connect_hop(&mut stream, first.scheme, first_auth.take(), &hop.endpoint())
                .await?;
        }
        self.connect_hop(&mut stream, first.scheme, first_auth.take(), target)
            .await?;
        Ok(stream)
    }

    async fn dial_first(&self, hop: &ProxyUrl) -> Result<TcpStream, ProxyError> {
        let addr = hop.endpoint();
        let mut stream = timeout(self.dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::UpstreamDialFailed(format!("dial {} timed out", addr)))?
            .map_err(|e| ProxyError::UpstreamDialFailed(format!("dial {}: {}", addr, e)))?;

        if hop.scheme == Scheme::Socks5 {
            timeout(
                self.handshake_timeout,
                socks5::handshake(&mut stream, hop.auth.as_ref()),
            )
            .await
            .map_err(|_| {
                ProxyError::UpstreamRejected(format!("handshake with {} timed out", addr))
            })??;
        }
        Ok(stream)
    }

    async fn connect_hop(
        &self,
        stream: &mut TcpStream,
        framing: Scheme,
        auth: Option<&ProxyAuth>,
        target: &str,
    ) -> Result<(), ProxyError> {
        let handshake = async {
            match framing {
                Scheme::Http | Scheme::Https => http::connect_through(stream, target, auth).await,
                Scheme::Socks5 => socks5::connect_through(stream, target).await,
            }
        };
        timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| {
                ProxyError::UpstreamRejected(format!("CONNECT to {} timed out", target))
            })?
    }
}
