//! Stream plumbing: framed reads, the rate-paced copier, and the
//! bidirectional byte-accounting bridge.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::peer::PeerConnection;

/// Copy chunk size when no bandwidth cap applies
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Reads exactly `n` bytes
pub async fn read_n<R>(reader: &mut R, n: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buff = vec![0u8; n];
    reader.read_exact(&mut buff).await?;
    Ok(buff)
}

/// Reads a single byte
pub async fn read_byte<R>(reader: &mut R) -> io::Result<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buff = [0u8; 1];
    reader.read_exact(&mut buff).await?;
    Ok(buff[0])
}

/// Bridges a client and a destination stream, pumping both directions until
/// either side closes, errors out, or the connection handle is cancelled.
/// Both directions are driven inside the caller's task, so nothing outlives
/// the handle once this returns.
pub async fn proxy_bridge(
    ctl: &PeerConnection,
    client: &mut TcpStream,
    remote: &mut TcpStream,
) -> io::Result<()> {
    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();

    let tx = splice_conn(
        &mut client_read,
        &mut remote_write,
        || ctl.bandwidth_tx(),
        |n| ctl.account_tx(n),
    );
    let rx = splice_conn(
        &mut remote_read,
        &mut client_write,
        || ctl.bandwidth_rx(),
        |n| ctl.account_rx(n),
    );

    tokio::pin!(tx, rx);

    tokio::select! {
        res = &mut tx => res,
        res = &mut rx => res,
        _ = ctl.cancelled() => Ok(()),
    }
}

/// Forwards data from `src` to `dst` while limiting the data rate to the
/// sampled bandwidth and accounting the transferred volume. A `None` (or
/// zero) bandwidth sample means unlimited.
pub async fn splice_conn<R, W>(
    src: &mut R,
    dst: &mut W,
    bandwidth: impl Fn() -> Option<u32>,
    account: impl Fn(u64),
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let limit = bandwidth().filter(|val| *val > 0);

        // one chunk per second's worth of data when capped
        let chunk_size = match limit {
            Some(val) => val as usize,
            None => DEFAULT_CHUNK_SIZE,
        };

        let mut chunk = vec![0u8; chunk_size];
        let started = Instant::now();

        let read = src.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }

        dst.write_all(&chunk[..read]).await?;
        account(read as u64);

        if let Some(val) = limit {
            wait_tcio(val, read, started).await;
        }
    }
}

/// Sleeps out the remainder of the ideal wall-clock time for transferring
/// `size` bytes at `bandwidth` bytes per second.
pub async fn wait_tcio(bandwidth: u32, size: usize, started: Instant) {
    let ideal = duration_tcio(bandwidth, size);
    let elapsed = started.elapsed();
    if ideal > elapsed {
        tokio::time::sleep(ideal - elapsed).await;
    }
}

/// Expected duration of an IO operation. Bandwidth in bytes per second
pub fn duration_tcio(bandwidth: u32, size: usize) -> Duration {
    if bandwidth == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(size as f64 / bandwidth as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[tokio::test]
    async fn test_splice_accounts_written_bytes() {
        let payload = vec![0xABu8; 100 * 1024];

        let (mut src_w, mut src_r) = tokio::io::duplex(64 * 1024);
        let mut sink = Vec::new();

        let writer = tokio::spawn(async move {
            src_w.write_all(&payload).await.unwrap();
            src_w.shutdown().await.unwrap();
        });

        let total = AtomicU64::new(0);
        splice_conn(&mut src_r, &mut sink, || None, |n| {
            total.fetch_add(n, Ordering::Relaxed);
        })
        .await
        .unwrap();

        writer.await.unwrap();

        assert_eq!(total.load(Ordering::Relaxed), 100 * 1024);
        assert_eq!(sink.len(), 100 * 1024);
    }

    #[tokio::test]
    async fn test_splice_paces_capped_transfers() {
        tokio::time::pause();

        let (mut src_w, mut src_r) = tokio::io::duplex(64 * 1024);
        let mut sink = Vec::new();

        let writer = tokio::spawn(async move {
            src_w.write_all(&vec![0u8; 4096]).await.unwrap();
            src_w.shutdown().await.unwrap();
        });

        let started = Instant::now();
        splice_conn(&mut src_r, &mut sink, || Some(1024), |_| {}).await.unwrap();
        writer.await.unwrap();

        // 4 KiB at 1 KiB/s takes about four virtual seconds
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(sink.len(), 4096);
    }

    #[tokio::test]
    async fn test_read_n() {
        let mut input: &[u8] = &[1, 2, 3, 4, 5];

        assert_eq!(read_n(&mut input, 3).await.unwrap(), vec![1, 2, 3]);
        assert_eq!(read_byte(&mut input).await.unwrap(), 4);
        assert!(read_n(&mut input, 2).await.is_err());
    }
}
