//! HTTP proxy slot service
//!
//! Serves two modes: CONNECT tunneling over the raw client stream, and
//! plain-text forward proxying through a per-peer upstream client. Both
//! authenticate with `Proxy-Authorization: Basic` against the slot's peers.

mod forward;

pub use forward::ForwardClient;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::hub::SlotService;
use crate::io::proxy_bridge;
use crate::net::{is_local_address, DnsHandle};
use crate::peer::{ConnCloser, Peer, PeerDelta, PeerError, PeerOptions, UserPassword};
use crate::slot::{AuthError, Slot, SlotError, SlotInfo, SlotOptions};

/// Deadline for the first request head on a fresh connection
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Value of the Via header stamped on every response
const VIA_TAG: &str = "nx-proxy";

type ForwardClients = Arc<Mutex<HashMap<Uuid, Arc<ForwardClient>>>>;

/// What to do with the client connection after a handled request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Next {
    KeepAlive,
    Close,
}

pub struct HttpService {
    slot: Arc<Slot>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
    accept_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HttpService {
    /// Binds the listener and starts accepting. The service is live once
    /// this returns.
    pub async fn bind(opts: SlotOptions, dns: DnsHandle) -> Result<Self, SlotError> {
        let bind_addr: SocketAddr = opts
            .bind_addr
            .parse()
            .map_err(|_| SlotError::InvalidBindAddr(opts.bind_addr.clone()))?;

        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;

        let slot = Arc::new(Slot::new(opts, dns));
        let cancel = CancellationToken::new();
        let clients: ForwardClients = Arc::new(Mutex::new(HashMap::new()));

        let accept_task = tokio::spawn(accept_conns(
            listener,
            slot.clone(),
            clients,
            cancel.clone(),
        ));

        info!("HTTP: listening on {local_addr}");

        Ok(Self {
            slot,
            cancel,
            local_addr,
            accept_task: tokio::sync::Mutex::new(Some(accept_task)),
        })
    }

    /// Actual listener address; useful when bound to port 0
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl SlotService for HttpService {
    fn info(&self) -> SlotInfo {
        self.slot.info(!self.cancel.is_cancelled())
    }

    fn deltas(&self) -> Vec<PeerDelta> {
        self.slot.deltas()
    }

    fn set_peers(&self, entries: Vec<PeerOptions>) {
        self.slot.set_peers(entries)
    }

    fn set_options(&self, opts: SlotOptions) -> Result<(), SlotError> {
        self.slot.set_options(opts)
    }

    async fn close(&self) -> Result<(), SlotError> {
        self.cancel.cancel();

        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }

        self.slot.close();
        Ok(())
    }
}

async fn accept_conns(
    listener: TcpListener,
    slot: Arc<Slot>,
    clients: ForwardClients,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            res = listener.accept() => res,
        };

        match next {
            Ok((stream, remote_addr)) => {
                let slot = slot.clone();
                let clients = clients.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(stream, remote_addr, slot, clients).await {
                        debug!(
                            "HTTP: connection closed: client_ip={} err={}",
                            remote_addr.ip(),
                            err,
                        );
                    }
                });
            }
            Err(err) => {
                if cancel.is_cancelled() {
                    return;
                }
                warn!("HTTP: accept connection: err={err}");
            }
        }
    }
}

async fn handle_conn(
    stream: TcpStream,
    remote_addr: SocketAddr,
    slot: Arc<Slot>,
    clients: ForwardClients,
) -> io::Result<()> {
    let client_ip = remote_addr.ip();
    let mut reader = BufReader::new(stream);
    let mut first = true;

    loop {
        let head = if first {
            first = false;
            tokio::time::timeout(HANDSHAKE_TIMEOUT, read_request_head(&mut reader))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "request head timed out"))??
        } else {
            read_request_head(&mut reader).await?
        };

        let Some(head) = head else {
            return Ok(());
        };

        match handle_request(&mut reader, head, client_ip, &slot, &clients).await? {
            Next::KeepAlive => continue,
            Next::Close => return Ok(()),
        }
    }
}

async fn handle_request(
    reader: &mut BufReader<TcpStream>,
    head: RequestHead,
    client_ip: IpAddr,
    slot: &Arc<Slot>,
    clients: &ForwardClients,
) -> io::Result<Next> {
    let is_connect = head.method.eq_ignore_ascii_case("CONNECT");

    let (host, port) = match request_host(&head, is_connect) {
        Ok(val) => val,
        Err(reason) => {
            debug!(
                "HTTP: request target invalid: client_ip={} target={} err={}",
                client_ip, head.target, reason,
            );
            respond(reader, 400, &head.target, &[close_header()]).await?;
            return Ok(Next::Close);
        }
    };

    let host_tag = format_host(&host, port);

    let creds = match proxy_request_credentials(&head) {
        Ok(val) => val,
        Err(reason) => {
            debug!(
                "HTTP: request auth invalid: client_ip={} host={} err={}",
                client_ip, host_tag, reason,
            );
            respond(
                reader,
                407,
                &host_tag,
                &[("Proxy-Authenticate", "Basic".to_string())],
            )
            .await?;
            return Ok(Next::Close);
        }
    };

    let peer = match slot.lookup_with_password(client_ip, &creds.user, &creds.password) {
        Ok(val) => val,
        Err(AuthError::RateLimited(err)) => {
            respond(
                reader,
                429,
                &host_tag,
                &[
                    ("Retry-After", err.retry_after().to_string()),
                    close_header(),
                ],
            )
            .await?;
            return Ok(Next::Close);
        }
        Err(err) => {
            debug!(
                "HTTP: invalid credentials: client_ip={} host={} err={}",
                client_ip, host_tag, err,
            );
            respond(reader, 403, &host_tag, &[close_header()]).await?;
            return Ok(Next::Close);
        }
    };

    if peer.is_disabled() {
        debug!(
            "HTTP: request cancelled; peer disabled: client_ip={} peer={} host={}",
            client_ip,
            peer.display_name(),
            host_tag,
        );
        respond(reader, 402, &host_tag, &[close_header()]).await?;
        return Ok(Next::Close);
    }

    if is_local_address(&host) {
        warn!(
            "HTTP: dest addr not allowed: client_ip={} host={}",
            client_ip, host_tag,
        );
        respond(reader, 502, &host_tag, &[close_header()]).await?;
        return Ok(Next::Close);
    }

    if is_connect {
        return handle_connect(reader, client_ip, &peer, &host, port, &host_tag).await;
    }

    let client = forward_client(clients, &peer);

    match forward::forward(reader, &head, &peer, &client, &host, port, &host_tag).await {
        Ok(next) => {
            debug!(
                "HTTP: forward: client_ip={} peer={} host={}",
                client_ip,
                peer.display_name(),
                host_tag,
            );
            Ok(next)
        }
        Err(forward::ForwardError::BadRequest(reason)) => {
            debug!(
                "HTTP: forward: unable to create forward request: client_ip={} peer={} host={} err={}",
                client_ip,
                peer.display_name(),
                host_tag,
                reason,
            );
            respond(reader, 400, &host_tag, &[close_header()]).await?;
            Ok(Next::Close)
        }
        Err(forward::ForwardError::Upstream(err)) => {
            debug!(
                "HTTP: forward: request: client_ip={} peer={} host={} err={}",
                client_ip,
                peer.display_name(),
                host_tag,
                err,
            );
            respond(reader, 502, &host_tag, &[close_header()]).await?;
            Ok(Next::Close)
        }
        Err(forward::ForwardError::Relay(err)) => {
            // the status already went out, nothing to signal but a close
            debug!(
                "HTTP: forward: write: client_ip={} peer={} host={} err={}",
                client_ip,
                peer.display_name(),
                host_tag,
                err,
            );
            Ok(Next::Close)
        }
    }
}

async fn handle_connect(
    reader: &mut BufReader<TcpStream>,
    client_ip: IpAddr,
    peer: &Arc<Peer>,
    host: &str,
    port: u16,
    host_tag: &str,
) -> io::Result<Next> {
    let ctl = match peer.connection() {
        Ok(val) => val,
        Err(err) => {
            debug!(
                "HTTP: connect: peer connection rejected: client_ip={} peer={} host={} err={}",
                client_ip,
                peer.display_name(),
                host_tag,
                err,
            );

            let status = match err {
                PeerError::TooManyConnections => 429,
                _ => 500,
            };

            respond(reader, status, host_tag, &[close_header()]).await?;
            return Ok(Next::Close);
        }
    };

    let _closer = ConnCloser(&ctl);

    let mut upstream = match peer.dialer().dial(host, port, ctl.cancel_token()).await {
        Ok(val) => val,
        Err(err) => {
            debug!(
                "HTTP: dial destination: client_ip={} peer={} host={} err={}",
                client_ip,
                peer.display_name(),
                host_tag,
                err,
            );
            respond(reader, 502, host_tag, &[close_header()]).await?;
            return Ok(Next::Close);
        }
    };

    write_connect_ack(reader, host_tag).await?;

    // flush anything the client pipelined behind the CONNECT head
    let trailer = reader.buffer().to_vec();
    if !trailer.is_empty() {
        Pin::new(&mut *reader).consume(trailer.len());
        upstream.write_all(&trailer).await?;
        ctl.account_tx(trailer.len() as u64);
    }

    debug!(
        "HTTP: connect: client_ip={} peer={} remote={}",
        client_ip,
        peer.display_name(),
        host_tag,
    );

    if let Err(err) = proxy_bridge(&ctl, reader.get_mut(), &mut upstream).await {
        debug!(
            "HTTP: connect: broken pipe: client_ip={} peer={} remote={} err={}",
            client_ip,
            peer.display_name(),
            host_tag,
            err,
        );
    }

    Ok(Next::Close)
}

fn forward_client(clients: &ForwardClients, peer: &Arc<Peer>) -> Arc<ForwardClient> {
    let mut map = clients.lock().unwrap();
    map.entry(peer.id())
        .or_insert_with(|| Arc::new(ForwardClient::new()))
        .clone()
}

/// Parsed request line plus headers
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn wants_close(&self) -> bool {
        let check = |name: &str| {
            self.header(name)
                .map(|val| val.to_ascii_lowercase().contains("close"))
                .unwrap_or(false)
        };

        check("Connection") || check("Proxy-Connection")
    }
}

pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, val)| val.as_str())
}

/// Reads one request head; None on a clean EOF between requests
async fn read_request_head(reader: &mut BufReader<TcpStream>) -> io::Result<Option<RequestHead>> {
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).await? == 0 {
        return Ok(None);
    }

    let mut parts = request_line.trim().split_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid request line",
        ));
    };

    let method = method.to_string();
    let target = target.to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated request head",
            ));
        }

        let line = line.trim();
        if line.is_empty() {
            break;
        }

        if let Some((key, val)) = line.split_once(':') {
            headers.push((key.trim().to_string(), val.trim().to_string()));
        }
    }

    Ok(Some(RequestHead {
        method,
        target,
        headers,
    }))
}

/// Destination host and port: the request target for CONNECT, the Host
/// header (or absolute target) otherwise
fn request_host(head: &RequestHead, is_connect: bool) -> Result<(String, u16), String> {
    if is_connect {
        return split_host_port(&head.target, None);
    }

    if let Some(host) = head.header("Host") {
        return split_host_port(host, Some(80));
    }

    if let Some(rest) = head.target.strip_prefix("http://") {
        let authority = rest.split('/').next().unwrap_or_default();
        return split_host_port(authority, Some(80));
    }

    Err("missing host".to_string())
}

fn split_host_port(val: &str, default_port: Option<u16>) -> Result<(String, u16), String> {
    if let Some(rest) = val.strip_prefix('[') {
        let (host, rest) = rest.split_once(']').ok_or("invalid host")?;

        if let Some(port) = rest.strip_prefix(':') {
            let port: u16 = port.parse().map_err(|_| "invalid port".to_string())?;
            return Ok((host.to_string(), port));
        }

        return match default_port {
            Some(port) => Ok((host.to_string(), port)),
            None => Err("missing port".to_string()),
        };
    }

    match val.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port.parse().map_err(|_| "invalid port".to_string())?;
            Ok((host.to_string(), port))
        }
        Some(_) => Err("invalid host".to_string()),
        None => match default_port {
            Some(port) => Ok((val.to_string(), port)),
            None => Err("missing port".to_string()),
        },
    }
}

pub(crate) fn format_host(host: &str, port: u16) -> String {
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn proxy_request_credentials(head: &RequestHead) -> Result<UserPassword, String> {
    let Some(value) = head.header("Proxy-Authorization") else {
        return Err("unauthorized".to_string());
    };

    let (scheme, token) = value.split_once(' ').unwrap_or((value, ""));
    if !scheme.trim().eq_ignore_ascii_case("basic") {
        return Err(format!("invalid auth scheme '{scheme}'"));
    }

    let decoded = STANDARD
        .decode(token.trim())
        .map_err(|err| err.to_string())?;
    let decoded = String::from_utf8(decoded).map_err(|err| err.to_string())?;

    let (user, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));
    if user.is_empty() {
        return Err("username is empty".to_string());
    }

    Ok(UserPassword {
        user: user.to_string(),
        password: password.to_string(),
    })
}

fn close_header() -> (&'static str, String) {
    ("Proxy-Connection", "Close".to_string())
}

/// Writes an empty response with the standard proxy headers attached
async fn respond<W>(
    writer: &mut W,
    status: u16,
    host_tag: &str,
    extra: &[(&str, String)],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!("HTTP/1.1 {} {}\r\n", status, status_reason(status));
    head.push_str(&format!("Via: {VIA_TAG}\r\n"));
    head.push_str(&format!("X-Forwarded: to={host_tag}\r\n"));

    for (key, val) in extra {
        head.push_str(&format!("{key}: {val}\r\n"));
    }

    head.push_str("Content-Length: 0\r\n\r\n");

    writer.write_all(head.as_bytes()).await
}

async fn write_connect_ack<W>(writer: &mut W, host_tag: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let date = chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT");

    let head = format!(
        "HTTP/1.1 200 Connection established\r\n\
         Date: {date}\r\n\
         Proxy-Connection: Keep-Alive\r\n\
         Via: {VIA_TAG}\r\n\
         X-Forwarded: to={host_tag}\r\n\r\n"
    );

    writer.write_all(head.as_bytes()).await
}

pub(crate) fn status_reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        402 => "Payment Required",
        403 => "Forbidden",
        407 => "Proxy Authentication Required",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        _ => "",
    }
}
