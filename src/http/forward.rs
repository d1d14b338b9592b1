//! Forward-mode relays
//!
//! Each peer gets a lazily-created client holding a small pool of idle
//! upstream connections. Connections dial through the peer's dialer and own
//! a `PeerConnection` whose counters and bandwidth watermarks wrap every
//! body relay, so forward traffic is shaped and accounted exactly like
//! tunneled traffic. Redirects are never followed; they relay to the client
//! as-is.

use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;

use super::{find_header, Next, RequestHead, VIA_TAG};
use crate::io::{splice_conn, wait_tcio, DEFAULT_CHUNK_SIZE};
use crate::peer::{Peer, PeerConnection};

/// Most idle upstream connections kept around per peer
const MAX_IDLE_CONNS: usize = 10;

/// Idle upstream connections older than this are dropped
const IDLE_CONN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug)]
pub(crate) enum ForwardError {
    /// The request cannot be turned into an outbound one; answer 400
    BadRequest(String),
    /// Upstream dial or exchange failed before a status went out; answer 502
    Upstream(io::Error),
    /// Failure after the status line was already sent; just close
    Relay(io::Error),
}

/// Per-peer forward client: a keyed pool of idle upstream connections
pub struct ForwardClient {
    pool: Mutex<Vec<PooledConn>>,
}

struct PooledConn {
    key: String,
    conn: BufReader<TcpStream>,
    ctl: Arc<PeerConnection>,
    idle_since: Instant,
}

impl Default for ForwardClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardClient {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(Vec::new()),
        }
    }

    fn checkout(&self, key: &str) -> Option<(BufReader<TcpStream>, Arc<PeerConnection>)> {
        let mut pool = self.pool.lock().unwrap();

        prune(&mut pool);

        let idx = pool.iter().position(|entry| entry.key == key)?;
        let entry = pool.swap_remove(idx);

        Some((entry.conn, entry.ctl))
    }

    fn checkin(&self, key: String, conn: BufReader<TcpStream>, ctl: Arc<PeerConnection>) {
        let mut pool = self.pool.lock().unwrap();

        prune(&mut pool);

        if pool.len() >= MAX_IDLE_CONNS || ctl.is_closed() {
            ctl.close();
            return;
        }

        pool.push(PooledConn {
            key,
            conn,
            ctl,
            idle_since: Instant::now(),
        });
    }
}

impl Drop for ForwardClient {
    fn drop(&mut self) {
        for entry in self.pool.lock().unwrap().drain(..) {
            entry.ctl.close();
        }
    }
}

fn prune(pool: &mut Vec<PooledConn>) {
    pool.retain(|entry| {
        if entry.ctl.is_closed() || entry.idle_since.elapsed() > IDLE_CONN_TIMEOUT {
            entry.ctl.close();
            return false;
        }
        true
    });
}

/// Relays a single non-CONNECT request through the peer
pub(crate) async fn forward(
    client: &mut BufReader<TcpStream>,
    head: &RequestHead,
    peer: &Arc<Peer>,
    fw: &ForwardClient,
    host: &str,
    port: u16,
    host_tag: &str,
) -> Result<Next, ForwardError> {
    if head.target.starts_with("https://") {
        return Err(ForwardError::BadRequest(
            "https targets must use CONNECT".to_string(),
        ));
    }

    let (mut upstream, ctl) = match fw.checkout(host_tag) {
        Some(val) => val,
        None => {
            let ctl = peer
                .connection()
                .map_err(|err| ForwardError::Upstream(io::Error::other(err.to_string())))?;

            match peer.dialer().dial(host, port, ctl.cancel_token()).await {
                Ok(stream) => (BufReader::new(stream), ctl),
                Err(err) => {
                    ctl.close();
                    return Err(ForwardError::Upstream(err));
                }
            }
        }
    };

    match relay_exchange(client, &mut upstream, &ctl, head, host, host_tag).await {
        Ok((next, reuse_upstream)) => {
            if reuse_upstream {
                fw.checkin(host_tag.to_string(), upstream, ctl);
            } else {
                ctl.close();
            }
            Ok(next)
        }
        Err(err) => {
            ctl.close();
            Err(err)
        }
    }
}

async fn relay_exchange(
    client: &mut BufReader<TcpStream>,
    upstream: &mut BufReader<TcpStream>,
    ctl: &PeerConnection,
    head: &RequestHead,
    host: &str,
    host_tag: &str,
) -> Result<(Next, bool), ForwardError> {
    // outbound head: origin-form target, Host pinned to the destination,
    // hop-by-hop connection headers stripped
    let host_header = head
        .header("Host")
        .map(str::to_string)
        .unwrap_or_else(|| host.to_string());

    let mut out = format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\n",
        head.method,
        origin_form_target(&head.target),
        host_header,
    );

    for (key, val) in &head.headers {
        if key.eq_ignore_ascii_case("Host")
            || key.eq_ignore_ascii_case("Connection")
            || key.eq_ignore_ascii_case("Upgrade")
            || key.eq_ignore_ascii_case("Proxy-Connection")
        {
            continue;
        }
        out.push_str(&format!("{key}: {val}\r\n"));
    }
    out.push_str("\r\n");

    upstream
        .write_all(out.as_bytes())
        .await
        .map_err(ForwardError::Upstream)?;
    ctl.account_tx(out.len() as u64);

    let bandwidth_tx = || ctl.bandwidth_tx();
    let account_tx = |n: u64| ctl.account_tx(n);
    let bandwidth_rx = || ctl.bandwidth_rx();
    let account_rx = |n: u64| ctl.account_rx(n);

    // relay the request body, if any
    let request_chunked = head
        .header("Transfer-Encoding")
        .map(|val| val.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    if request_chunked {
        relay_chunked_raw(client, upstream, bandwidth_tx, account_tx)
            .await
            .map_err(ForwardError::Upstream)?;
    } else if let Some(val) = head.header("Content-Length") {
        let length: u64 = val
            .trim()
            .parse()
            .map_err(|_| ForwardError::BadRequest("invalid content length".to_string()))?;
        relay_exact(client, upstream, length, bandwidth_tx, account_tx)
            .await
            .map_err(ForwardError::Upstream)?;
    }

    let mut resp = read_response_head(upstream)
        .await
        .map_err(ForwardError::Upstream)?;
    ctl.account_rx(resp.raw_len);

    // informational responses pass through until the real status shows up
    while resp.status == 100 {
        client
            .write_all(b"HTTP/1.1 100 Continue\r\n\r\n")
            .await
            .map_err(ForwardError::Relay)?;

        resp = read_response_head(upstream)
            .await
            .map_err(ForwardError::Upstream)?;
        ctl.account_rx(resp.raw_len);
    }

    let chunked = resp
        .header("Transfer-Encoding")
        .map(|val| val.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);
    let content_length = resp
        .header("Content-Length")
        .and_then(|val| val.trim().parse::<u64>().ok());
    let head_only = head.method.eq_ignore_ascii_case("HEAD")
        || resp.status == 204
        || resp.status == 304;

    // chunked bodies are decoded on the way through, so without a length the
    // client-side framing falls back to connection close
    let close_delimited = !head_only && !chunked && content_length.is_none();

    let mut reply = format!("HTTP/1.1 {} {}\r\n", resp.status, resp.reason);
    reply.push_str(&format!("Via: {VIA_TAG}\r\n"));
    reply.push_str(&format!("X-Forwarded: to={host_tag}\r\n"));

    for (key, val) in &resp.headers {
        if key.eq_ignore_ascii_case("TE") || key.eq_ignore_ascii_case("Transfer-Encoding") {
            continue;
        }
        reply.push_str(&format!("{key}: {val}\r\n"));
    }

    if chunked || close_delimited {
        reply.push_str("Connection: close\r\n");
    }
    reply.push_str("\r\n");

    client
        .write_all(reply.as_bytes())
        .await
        .map_err(ForwardError::Relay)?;

    if head_only {
        // no body follows by definition
    } else if chunked {
        relay_chunked_decoded(upstream, client, bandwidth_rx, account_rx)
            .await
            .map_err(ForwardError::Relay)?;
    } else if let Some(length) = content_length {
        relay_exact(upstream, client, length, bandwidth_rx, account_rx)
            .await
            .map_err(ForwardError::Relay)?;
    } else {
        splice_conn(upstream, client, bandwidth_rx, account_rx)
            .await
            .map_err(ForwardError::Relay)?;
    }

    let resp_close = resp
        .header("Connection")
        .map(|val| val.to_ascii_lowercase().contains("close"))
        .unwrap_or(false);

    let reuse_upstream =
        !resp_close && (head_only || chunked || content_length.is_some());

    let next = if chunked || close_delimited || head.wants_close() {
        Next::Close
    } else {
        Next::KeepAlive
    };

    Ok((next, reuse_upstream))
}

struct ResponseHead {
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    raw_len: u64,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

async fn read_response_head(reader: &mut BufReader<TcpStream>) -> io::Result<ResponseHead> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "upstream closed before responding",
        ));
    }

    let mut raw_len = n as u64;

    let mut parts = line.trim_end().splitn(3, ' ');
    let _version = parts.next().unwrap_or_default();
    let status: u16 = parts
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid status line"))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated response head",
            ));
        }

        raw_len += n as u64;

        let line = line.trim();
        if line.is_empty() {
            break;
        }

        if let Some((key, val)) = line.split_once(':') {
            headers.push((key.trim().to_string(), val.trim().to_string()));
        }
    }

    Ok(ResponseHead {
        status,
        reason,
        headers,
        raw_len,
    })
}

/// Copies exactly `remaining` bytes, paced and accounted like the bridge
async fn relay_exact<R, W>(
    src: &mut R,
    dst: &mut W,
    mut remaining: u64,
    bandwidth: impl Fn() -> Option<u32> + Copy,
    account: impl Fn(u64) + Copy,
) -> io::Result<()>
where
    R: AsyncReadExt + Unpin,
    W: AsyncWrite + Unpin,
{
    while remaining > 0 {
        let limit = bandwidth().filter(|val| *val > 0);

        let chunk_size = match limit {
            Some(val) => val as usize,
            None => DEFAULT_CHUNK_SIZE,
        }
        .min(remaining.min(usize::MAX as u64) as usize);

        let mut chunk = vec![0u8; chunk_size];
        let started = Instant::now();

        let read = src.read(&mut chunk).await?;
        if read == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short body"));
        }

        dst.write_all(&chunk[..read]).await?;
        account(read as u64);
        remaining -= read as u64;

        if let Some(val) = limit {
            wait_tcio(val, read, started).await;
        }
    }

    Ok(())
}

/// Passes a chunked body through verbatim, framing included
async fn relay_chunked_raw<W>(
    src: &mut BufReader<TcpStream>,
    dst: &mut W,
    bandwidth: impl Fn() -> Option<u32> + Copy,
    account: impl Fn(u64) + Copy,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let mut line = String::new();
        if src.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated chunked body",
            ));
        }

        dst.write_all(line.as_bytes()).await?;
        account(line.len() as u64);

        let size = parse_chunk_size(&line)?;
        if size == 0 {
            // trailer section runs to an empty line
            loop {
                let mut line = String::new();
                if src.read_line(&mut line).await? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated chunk trailer",
                    ));
                }

                dst.write_all(line.as_bytes()).await?;
                account(line.len() as u64);

                if line.trim().is_empty() {
                    return Ok(());
                }
            }
        }

        // chunk data plus its trailing CRLF
        relay_exact(src, dst, size + 2, bandwidth, account).await?;
    }
}

/// Decodes a chunked body, streaming the payload bytes only
async fn relay_chunked_decoded<W>(
    src: &mut BufReader<TcpStream>,
    dst: &mut W,
    bandwidth: impl Fn() -> Option<u32> + Copy,
    account: impl Fn(u64) + Copy,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let mut line = String::new();
        if src.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated chunked body",
            ));
        }
        account(line.len() as u64);

        let size = parse_chunk_size(&line)?;
        if size == 0 {
            loop {
                let mut line = String::new();
                if src.read_line(&mut line).await? == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "truncated chunk trailer",
                    ));
                }
                account(line.len() as u64);

                if line.trim().is_empty() {
                    return Ok(());
                }
            }
        }

        relay_exact(src, dst, size, bandwidth, account).await?;

        let mut crlf = [0u8; 2];
        src.read_exact(&mut crlf).await?;
        account(2);
    }
}

fn parse_chunk_size(line: &str) -> io::Result<u64> {
    let val = line.trim().split(';').next().unwrap_or_default();
    u64::from_str_radix(val, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))
}

fn origin_form_target(target: &str) -> String {
    if let Some(rest) = target.strip_prefix("http://") {
        return match rest.find('/') {
            Some(idx) => rest[idx..].to_string(),
            None => "/".to_string(),
        };
    }

    target.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_form_target() {
        assert_eq!(origin_form_target("http://example.com/path?q=1"), "/path?q=1");
        assert_eq!(origin_form_target("http://example.com"), "/");
        assert_eq!(origin_form_target("/already/origin"), "/already/origin");
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size("1a\r\n").unwrap(), 26);
        assert_eq!(parse_chunk_size("0\r\n").unwrap(), 0);
        assert_eq!(parse_chunk_size("ff;ext=1\r\n").unwrap(), 255);
        assert!(parse_chunk_size("not-hex\r\n").is_err());
    }
}
