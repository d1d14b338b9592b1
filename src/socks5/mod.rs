//! SOCKS5 proxy slot service
//!
//! Serves the CONNECT command with user/password authentication against the
//! slot's peer set. BIND and UDP ASSOCIATE are recognized but rejected.

mod proto;

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::SlotService;
use crate::io::proxy_bridge;
use crate::net::{is_local_address, DnsHandle};
use crate::peer::{ConnCloser, Peer, PeerDelta, PeerError, PeerOptions};
use crate::slot::{AuthError, Slot, SlotError, SlotInfo, SlotOptions};

use proto::{Command, Reply};

/// Deadline covering the whole handshake up to the request frame
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Socks5Service {
    slot: Arc<Slot>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
    accept_task: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Socks5Service {
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

        let accept_task = tokio::spawn(accept_conns(listener, slot.clone(), cancel.clone()));

        info!("SOCKS5: listening on {local_addr}");

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
impl SlotService for Socks5Service {
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

        // wait the accept loop out so the port is actually released
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }

        self.slot.close();
        Ok(())
    }
}

async fn accept_conns(listener: TcpListener, slot: Arc<Slot>, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return,
            res = listener.accept() => res,
        };

        match next {
            Ok((stream, remote_addr)) => {
                let slot = slot.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_conn(stream, remote_addr, slot).await {
                        debug!(
                            "SOCKS5: connection closed: client_ip={} err={}",
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
                warn!("SOCKS5: accept connection: err={err}");
            }
        }
    }
}

async fn handle_conn(
    mut stream: TcpStream,
    remote_addr: SocketAddr,
    slot: Arc<Slot>,
) -> io::Result<()> {
    let client_ip = remote_addr.ip();

    let handshake = tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        negotiate(&mut stream, client_ip, &slot),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"))?;

    // the deadline no longer applies past this point
    let Some((peer, request)) = handshake? else {
        return Ok(());
    };

    if peer.is_disabled() {
        debug!(
            "SOCKS5: request cancelled; peer disabled: client_ip={} peer={}",
            client_ip,
            peer.display_name(),
        );
        let _ = proto::write_reply(&mut stream, Reply::ErrConnNotAllowed, None).await;
        return Ok(());
    }

    if is_local_address(&request.addr.host) {
        warn!(
            "SOCKS5: dest addr not allowed: client_ip={} dst={}",
            client_ip, request.addr,
        );
        let _ = proto::write_reply(&mut stream, Reply::ErrConnNotAllowed, None).await;
        return Ok(());
    }

    match request.cmd {
        Command::Connect => handle_cmd_connect(stream, client_ip, peer, request.addr).await,
        cmd => {
            debug!(
                "SOCKS5: command not supported: client_ip={} cmd={}",
                client_ip, cmd,
            );
            let _ = proto::write_reply(&mut stream, Reply::ErrCmdNotSupported, None).await;
            Ok(())
        }
    }
}

/// Runs the greeting, auth and request phases. `None` means the connection
/// was already answered and should simply be dropped.
async fn negotiate(
    stream: &mut TcpStream,
    client_ip: IpAddr,
    slot: &Arc<Slot>,
) -> io::Result<Option<(Arc<Peer>, proto::Request)>> {
    let methods = match proto::read_auth_methods(stream).await {
        Ok(val) => val,
        Err(err) => {
            let _ = proto::write_reply(stream, Reply::ErrGeneric, None).await;
            return Err(err);
        }
    };

    if !methods.contains(&proto::AUTH_METHOD_PASSWORD) {
        let _ = proto::write_method(stream, proto::AUTH_METHOD_UNACCEPTABLE).await;
        return Ok(None);
    }

    proto::write_method(stream, proto::AUTH_METHOD_PASSWORD).await?;

    let creds = match proto::read_credentials(stream).await {
        Ok(val) => val,
        Err(err) => {
            let _ = proto::write_auth_status(stream, proto::PASSWORD_AUTH_FAIL).await;
            return Err(err);
        }
    };

    if creds.user.is_empty() {
        let _ = proto::write_auth_status(stream, proto::PASSWORD_AUTH_FAIL).await;
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid credentials: empty user name",
        ));
    }

    let peer = match slot.lookup_with_password(client_ip, &creds.user, &creds.password) {
        Ok(peer) => peer,
        Err(AuthError::RateLimited(err)) => {
            // no reply at all: probing clients get nothing to measure
            debug!(
                "SOCKS5: password auth rate limited: client_ip={} retry_after={}",
                client_ip,
                err.retry_after(),
            );
            return Ok(None);
        }
        Err(err) => {
            warn!(
                "SOCKS5: password auth failed: client_ip={} err={}",
                client_ip, err,
            );
            let _ = proto::write_auth_status(stream, proto::PASSWORD_AUTH_FAIL).await;
            return Ok(None);
        }
    };

    proto::write_auth_status(stream, proto::PASSWORD_AUTH_OK).await?;

    let request = match proto::read_request(stream).await {
        Ok(val) => val,
        Err(err) => {
            warn!(
                "SOCKS5: invalid request: client_ip={} err={}",
                client_ip, err,
            );
            let _ = proto::write_reply(stream, Reply::ErrGeneric, None).await;
            return Ok(None);
        }
    };

    Ok(Some((peer, request)))
}

async fn handle_cmd_connect(
    mut stream: TcpStream,
    client_ip: IpAddr,
    peer: Arc<Peer>,
    addr: proto::Addr,
) -> io::Result<()> {
    let ctl = match peer.connection() {
        Ok(val) => val,
        Err(err) => {
            debug!(
                "SOCKS5: connect: peer connection rejected: client_ip={} peer={} err={}",
                client_ip,
                peer.display_name(),
                err,
            );

            let reply = match err {
                PeerError::TooManyConnections => Reply::ErrConnNotAllowed,
                _ => Reply::ErrGeneric,
            };

            let _ = proto::write_reply(&mut stream, reply, Some(&addr)).await;
            return Ok(());
        }
    };

    let _closer = ConnCloser(&ctl);

    let mut remote = match peer.dialer().dial(&addr.host, addr.port, ctl.cancel_token()).await {
        Ok(val) => val,
        Err(err) => {
            debug!(
                "SOCKS5: connect: unable to dial destination: client_ip={} peer={} remote={} err={}",
                client_ip,
                peer.display_name(),
                addr,
                err,
            );
            let _ = proto::write_reply(&mut stream, Reply::ErrHostUnreachable, Some(&addr)).await;
            return Ok(());
        }
    };

    proto::write_reply(&mut stream, Reply::Ok, Some(&addr)).await?;

    debug!(
        "SOCKS5: connect: client_ip={} peer={} remote={}",
        client_ip,
        peer.display_name(),
        addr,
    );

    if let Err(err) = proxy_bridge(&ctl, &mut stream, &mut remote).await {
        debug!(
            "SOCKS5: connect: broken pipe: client_ip={} peer={} remote={} err={}",
            client_ip,
            peer.display_name(),
            addr,
            err,
        );
    }

    Ok(())
}
