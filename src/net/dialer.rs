//! Outbound TCP dialing for peers
//!
//! Each peer owns one dialer. The local source address tracks the peer's
//! framed IP and can be swapped between dials; the resolver comes from the
//! shared DNS handle.

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_util::sync::CancellationToken;

use super::DnsHandle;

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub struct Dialer {
    dns: DnsHandle,
    local_ip: Mutex<Option<IpAddr>>,
}

impl Dialer {
    pub fn new(dns: DnsHandle, local_ip: Option<IpAddr>) -> Self {
        Self {
            dns,
            local_ip: Mutex::new(local_ip),
        }
    }

    /// Rebinds the local source address for subsequent dials
    pub fn set_local_ip(&self, ip: Option<IpAddr>) {
        *self.local_ip.lock().unwrap() = ip;
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        *self.local_ip.lock().unwrap()
    }

    /// Dials `host:port`, aborting early when `cancel` fires
    pub async fn dial(
        &self,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> io::Result<TcpStream> {
        tokio::select! {
            res = self.dial_addr(host, port) => res,
            _ = cancel.cancelled() => {
                Err(io::Error::new(io::ErrorKind::Interrupted, "dial cancelled"))
            }
        }
    }

    async fn dial_addr(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let addr = self.dns.resolve(host, port).await?;

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };

        if let Some(ip) = self.local_ip() {
            // the bind only applies when the families line up
            if ip.is_ipv4() == addr.is_ipv4() {
                socket.bind(SocketAddr::new(ip, 0))?;
            }
        }

        let stream = tokio::time::timeout(DIAL_TIMEOUT, socket.connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        stream.set_nodelay(true).ok();

        let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_INTERVAL);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive).ok();

        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let dialer = Dialer::new(DnsHandle::new(), None);
        let cancel = CancellationToken::new();

        let stream = dialer
            .dial(&addr.ip().to_string(), addr.port(), &cancel)
            .await
            .unwrap();

        assert_eq!(stream.peer_addr().unwrap(), addr);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_cancelled() {
        let dialer = Dialer::new(DnsHandle::new(), None);

        let cancel = CancellationToken::new();
        cancel.cancel();

        // TEST-NET-1 never answers; cancellation must cut the dial short
        let res = dialer.dial("192.0.2.1", 9, &cancel).await;
        assert_eq!(res.unwrap_err().kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn test_dial_binds_local_ip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = Dialer::new(DnsHandle::new(), Some("127.0.0.1".parse().unwrap()));
        let cancel = CancellationToken::new();

        let stream = dialer
            .dial(&addr.ip().to_string(), addr.port(), &cancel)
            .await
            .unwrap();

        assert_eq!(stream.local_addr().unwrap().ip(), addr.ip());
    }
}
