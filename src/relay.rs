//! Bidirectional byte splice between a client stream and an upstream
//! stream. No framing awareness; a session's last stop.

use std::time::Duration;

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const RELAY_BUF_SIZE: usize = 16 * 1024;

/// Copies `a <-> b` until both directions have stopped and returns the byte
/// counts `(a_to_b, b_to_a)`.
///
/// When one direction hits EOF or an error, the opposite stream's write
/// half is shut down so the EOF propagates; the other direction then drains
/// and stops on its own. With `idle_timeout` set, a direction that sees no
/// bytes for that long is treated as finished.
pub async fn splice<A, B>(a: A, b: B, idle_timeout: Option<Duration>) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = io::split(a);
    let (b_read, b_write) = io::split(b);

    tokio::join!(
        copy_half(a_read, b_write, idle_timeout),
        copy_half(b_read, a_write, idle_timeout),
    )
}

async fn copy_half<R, W>(mut read: R, mut write: W, idle_timeout: Option<Duration>) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let read_result = match idle_timeout {
            Some(limit) => match timeout(limit, read.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => break,
            },
            None => read.read(&mut buf).await,
        };
        let n = match read_result {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if write.write_all(&buf[..n]).await.is_err() {
            break;
        }
        total += n as u64;
    }

    let _ = write.shutdown().await;
    total
}
