//! Tenant peers: credentials, connection quotas, bandwidth shares and the
//! live connection set they own.

mod connection;

pub use connection::{ConnCloser, PeerConnection};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::net::{Dialer, DnsHandle};

/// Redistribution cadence
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("too many connections")]
    TooManyConnections,

    #[error("peer closed")]
    PeerClosed,
}

/// Password-auth login pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPassword {
    pub user: String,
    pub password: String,
}

/// Aggregate per-peer bandwidth in bytes per second; zero means unlimited.
/// The min values put a floor under each connection's share.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerBandwidth {
    pub rx: u32,
    pub tx: u32,
    pub min_rx: u32,
    pub min_tx: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerOptions {
    pub id: Uuid,
    pub password_auth: Option<UserPassword>,
    pub max_connections: u32,
    pub bandwidth: PeerBandwidth,
    pub framed_ip: String,
    pub disabled: bool,
}

impl PeerOptions {
    /// Whether both sides carry the same login
    pub fn cmp_credentials(&self, other: &PeerOptions) -> bool {
        match (&self.password_auth, &other.password_auth) {
            (Some(a), Some(b)) => a.user == b.user && a.password == b.password,
            _ => false,
        }
    }

    pub fn display_name(&self) -> String {
        match &self.password_auth {
            Some(auth) => auth.user.clone(),
            None => self.id.to_string(),
        }
    }
}

/// Byte counts accrued since the previous extraction; reported once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDelta {
    #[serde(rename = "peer")]
    pub peer_id: Uuid,
    pub rx: u64,
    pub tx: u64,
}

/// Runtime peer: options plus the live connection map, pending byte deltas
/// and an outbound dialer bound to the peer's framed IP
pub struct Peer {
    state: Mutex<PeerState>,
    dialer: Dialer,

    delta_rx: AtomicU64,
    delta_tx: AtomicU64,

    cancel: CancellationToken,
    closed: AtomicBool,
    refresh_active: AtomicBool,
}

struct PeerState {
    options: PeerOptions,
    next_conn_id: u64,
    conn_map: HashMap<u64, Arc<PeerConnection>>,
}

impl Peer {
    pub fn new(
        options: PeerOptions,
        framed_ip: Option<IpAddr>,
        dns: DnsHandle,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PeerState {
                options,
                next_conn_id: 0,
                conn_map: HashMap::new(),
            }),
            dialer: Dialer::new(dns, framed_ip),
            delta_rx: AtomicU64::new(0),
            delta_tx: AtomicU64::new(0),
            cancel,
            closed: AtomicBool::new(false),
            refresh_active: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.state.lock().unwrap().options.id
    }

    pub fn options(&self) -> PeerOptions {
        self.state.lock().unwrap().options.clone()
    }

    pub fn display_name(&self) -> String {
        self.state.lock().unwrap().options.display_name()
    }

    pub fn is_disabled(&self) -> bool {
        self.state.lock().unwrap().options.disabled
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    pub(crate) fn set_options(&self, options: PeerOptions, framed_ip: Option<IpAddr>) {
        self.state.lock().unwrap().options = options;
        self.dialer.set_local_ip(framed_ip);
    }

    /// Acquires a relay handle, subject to the connection cap
    pub fn connection(self: &Arc<Self>) -> Result<Arc<PeerConnection>, PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PeerError::PeerClosed);
        }

        let mut state = self.state.lock().unwrap();

        if self
            .refresh_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(refresh_routine(Arc::downgrade(self)));
        }

        let max_conns = state.options.max_connections;
        if max_conns > 0 && state.conn_map.len() >= max_conns as usize {
            return Err(PeerError::TooManyConnections);
        }

        let next_id = pick_next_id(&mut state)?;

        let bandwidth = state.options.bandwidth;
        let nconn = state.conn_map.len() as u32;

        let base_share = |aggregate: u32, min: u32| -> u32 {
            let share = if nconn > 1 { aggregate / nconn } else { aggregate };
            share.max(min)
        };

        let conn = Arc::new(PeerConnection::new(
            next_id,
            base_share(bandwidth.rx, bandwidth.min_rx),
            base_share(bandwidth.tx, bandwidth.min_tx),
            self.cancel.child_token(),
        ));

        state.conn_map.insert(next_id, conn.clone());

        Ok(conn)
    }

    /// One redistribution pass: sweeps dead connections, drains per-connection
    /// counters into the peer delta, and reshapes per-connection bandwidth so
    /// that saturated connections pick up the unused headroom of idle ones.
    /// Returns the live connection count.
    pub fn refresh_state(&self) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            return 0;
        }

        let mut state = self.state.lock().unwrap();

        // sweep connections whose context is gone, keeping their byte counts
        let mut swept_rx = 0u64;
        let mut swept_tx = 0u64;
        state.conn_map.retain(|_, conn| {
            if conn.is_closed() {
                swept_rx += conn.take_rx();
                swept_tx += conn.take_tx();
                return false;
            }
            true
        });
        self.delta_rx.fetch_add(swept_rx, Ordering::Relaxed);
        self.delta_tx.fetch_add(swept_tx, Ordering::Relaxed);

        let bandwidth = state.options.bandwidth;
        let nconn = state.conn_map.len();

        let base = |aggregate: u32| -> u32 {
            if nconn > 1 {
                aggregate / nconn as u32
            } else {
                aggregate
            }
        };

        let base_rx = base(bandwidth.rx);
        let base_tx = base(bandwidth.tx);

        let sat_rx = saturation_threshold(base_rx as u64);
        let sat_tx = saturation_threshold(base_tx as u64);

        let now = Instant::now();

        let mut unused_rx = 0u64;
        let mut unused_tx = 0u64;
        let mut nsat_rx = 0u64;
        let mut nsat_tx = 0u64;

        // first pass: count saturated connections, pool unused headroom
        for conn in state.conn_map.values() {
            let updated = conn.updated.lock().unwrap().replace(now);

            let equiv_rx = equivalent_volume(base_rx, updated, now);
            let equiv_tx = equivalent_volume(base_tx, updated, now);

            let vol_rx = conn.peek_rx();
            let vol_tx = conn.peek_tx();

            if vol_rx >= sat_rx {
                nsat_rx += 1;
            } else {
                unused_rx += equiv_rx.saturating_sub(vol_rx);
            }

            if vol_tx >= sat_tx {
                nsat_tx += 1;
            } else {
                unused_tx += equiv_tx.saturating_sub(vol_tx);
            }
        }

        // second pass: drain the counters and apply the new shares
        for conn in state.conn_map.values() {
            let vol_rx = conn.take_rx();
            let vol_tx = conn.take_tx();

            let mut extra_rx = 0u64;
            if nsat_rx > 0 && vol_rx >= sat_rx {
                extra_rx = unused_rx / nsat_rx;
            }

            let mut extra_tx = 0u64;
            if nsat_tx > 0 && vol_tx >= sat_tx {
                extra_tx = unused_tx / nsat_tx;
            }

            conn.set_bandwidth(
                clamp_band(base_rx as u64 + extra_rx).max(bandwidth.min_rx),
                clamp_band(base_tx as u64 + extra_tx).max(bandwidth.min_tx),
            );

            self.delta_rx.fetch_add(vol_rx, Ordering::Relaxed);
            self.delta_tx.fetch_add(vol_tx, Ordering::Relaxed);
        }

        nconn
    }

    /// Cancels every live connection and folds their counters into the
    /// pending delta. The peer itself stays usable.
    pub fn close_connections(&self) {
        let mut state = self.state.lock().unwrap();

        let mut swept_rx = 0u64;
        let mut swept_tx = 0u64;

        for (_, conn) in state.conn_map.drain() {
            conn.close();
            swept_rx += conn.take_rx();
            swept_tx += conn.take_tx();
        }

        self.delta_rx.fetch_add(swept_rx, Ordering::Relaxed);
        self.delta_tx.fetch_add(swept_tx, Ordering::Relaxed);
    }

    /// Permanently shuts the peer down
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.cancel.cancel();
        self.close_connections();
        self.refresh_active.store(false, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Extracts the pending byte counters, if any. Each byte is reported
    /// exactly once: two consecutive calls with no traffic in between yield
    /// a delta only the first time.
    pub fn delta(&self) -> Option<PeerDelta> {
        let rx = self.delta_rx.swap(0, Ordering::Relaxed);
        let tx = self.delta_tx.swap(0, Ordering::Relaxed);

        if rx > 0 || tx > 0 {
            return Some(PeerDelta {
                peer_id: self.id(),
                rx,
                tx,
            });
        }

        None
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Peer")
            .field("id", &state.options.id)
            .field("name", &state.options.display_name())
            .field("connections", &state.conn_map.len())
            .finish()
    }
}

fn pick_next_id(state: &mut PeerState) -> Result<u64, PeerError> {
    if state.next_conn_id < u64::MAX {
        state.next_conn_id += 1;
        return Ok(state.next_conn_id);
    }

    // wrapped around: reuse the lowest id no live connection holds
    for idx in 0..u64::MAX {
        if !state.conn_map.contains_key(&idx) {
            return Ok(idx);
        }
    }

    Err(PeerError::TooManyConnections)
}

/// 90% of the fair share; a connection at or above it counts as saturated
fn saturation_threshold(val: u64) -> u64 {
    val - val / 10
}

/// Volume a connection could have moved since its last sample. Falls back to
/// one second's worth when the sample is fresh or missing.
fn equivalent_volume(base: u32, updated: Option<Instant>, now: Instant) -> u64 {
    if let Some(at) = updated {
        let elapsed = now.saturating_duration_since(at);
        if elapsed > Duration::from_secs(1) {
            return (elapsed.as_secs_f64() * base as f64) as u64;
        }
    }

    base as u64
}

fn clamp_band(val: u64) -> u32 {
    val.min(u32::MAX as u64) as u32
}

/// Periodic redistribution; exits after two successive empty ticks and is
/// restarted by the next connection acquisition.
async fn refresh_routine(peer: Weak<Peer>) {
    let mut last_nconn = 0usize;

    loop {
        tokio::time::sleep(REFRESH_INTERVAL).await;

        let Some(peer) = peer.upgrade() else {
            return;
        };

        if !peer.refresh_active.load(Ordering::SeqCst) {
            return;
        }

        let nconn = peer.refresh_state();
        if nconn.max(last_nconn) < 1 {
            peer.refresh_active.store(false, Ordering::SeqCst);
            return;
        }

        last_nconn = nconn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer(options: PeerOptions) -> Arc<Peer> {
        Peer::new(options, None, DnsHandle::new(), CancellationToken::new())
    }

    fn auth(user: &str, password: &str) -> Option<UserPassword> {
        Some(UserPassword {
            user: user.to_string(),
            password: password.to_string(),
        })
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let peer = test_peer(PeerOptions {
            id: Uuid::new_v4(),
            password_auth: auth("maddsua", "test123"),
            max_connections: 10,
            ..Default::default()
        });

        for idx in 0..20 {
            let res = peer.connection();
            if idx < 10 {
                assert!(res.is_ok(), "unexpected err at idx {idx}: {res:?}");
            } else {
                assert_eq!(res.unwrap_err(), PeerError::TooManyConnections, "at idx {idx}");
            }
        }
    }

    #[tokio::test]
    async fn test_connection_ids_monotonic() {
        let peer = test_peer(PeerOptions {
            id: Uuid::new_v4(),
            ..Default::default()
        });

        for expect in 1..=5u64 {
            assert_eq!(peer.connection().unwrap().id(), expect);
        }
    }

    #[tokio::test]
    async fn test_closed_peer_rejects_connections() {
        let peer = test_peer(PeerOptions {
            id: Uuid::new_v4(),
            ..Default::default()
        });

        let conn = peer.connection().unwrap();
        peer.close();

        assert!(conn.is_closed());
        assert_eq!(peer.connection().unwrap_err(), PeerError::PeerClosed);
    }

    #[tokio::test]
    async fn test_bandwidth_unlimited() {
        let peer = test_peer(PeerOptions {
            id: Uuid::new_v4(),
            password_auth: auth("maddsua", "test123"),
            max_connections: 10,
            ..Default::default()
        });

        for _ in 0..5 {
            let conn = peer.connection().unwrap();
            conn.account_rx(500);
            conn.account_tx(100);
        }

        let conn = peer.connection().unwrap();
        conn.account_rx(2_000);
        conn.account_tx(1_600);

        peer.refresh_state();

        assert_eq!(conn.bandwidth_rx(), None);
        assert_eq!(conn.bandwidth_tx(), None);
    }

    #[tokio::test]
    async fn test_bandwidth_redistribution() {
        let peer = test_peer(PeerOptions {
            id: Uuid::new_v4(),
            password_auth: auth("maddsua", "test123"),
            max_connections: 10,
            bandwidth: PeerBandwidth {
                rx: 10_000,
                tx: 10_000,
                min_rx: 1_000,
                min_tx: 1_000,
            },
            ..Default::default()
        });

        let mut idle = Vec::new();
        for _ in 0..5 {
            let conn = peer.connection().unwrap();
            conn.account_rx(500);
            conn.account_tx(100);
            idle.push(conn);
        }

        let hot = peer.connection().unwrap();
        hot.account_rx(2_000);
        hot.account_tx(1_600);

        peer.refresh_state();

        // base share 10000/6 = 1666, threshold 1500; the five idle
        // connections pool 5*1166 rx and 5*1566 tx of headroom which all
        // goes to the single saturated one
        assert_eq!(hot.bandwidth_rx(), Some(7_496));
        assert_eq!(hot.bandwidth_tx(), Some(9_496));

        for conn in &idle {
            assert_eq!(conn.bandwidth_rx(), Some(1_666));
            assert_eq!(conn.bandwidth_tx(), Some(1_666));
        }
    }

    #[tokio::test]
    async fn test_bandwidth_min_floor() {
        let peer = test_peer(PeerOptions {
            id: Uuid::new_v4(),
            bandwidth: PeerBandwidth {
                rx: 10_000,
                tx: 10_000,
                min_rx: 4_000,
                min_tx: 4_000,
            },
            ..Default::default()
        });

        let mut conns = Vec::new();
        for _ in 0..5 {
            conns.push(peer.connection().unwrap());
        }

        peer.refresh_state();

        // fair share would be 2000, the floor wins
        for conn in &conns {
            assert_eq!(conn.bandwidth_rx(), Some(4_000));
            assert_eq!(conn.bandwidth_tx(), Some(4_000));
        }
    }

    #[tokio::test]
    async fn test_deltas_reported_once() {
        let peer = test_peer(PeerOptions {
            id: Uuid::new_v4(),
            ..Default::default()
        });

        let conn = peer.connection().unwrap();
        conn.account_rx(2_000);
        conn.account_tx(1_000);

        peer.close_connections();

        let delta = peer.delta().expect("pending delta");
        assert_eq!((delta.rx, delta.tx), (2_000, 1_000));

        assert!(peer.delta().is_none());
    }

    #[tokio::test]
    async fn test_refresh_sweeps_closed_connections() {
        let peer = test_peer(PeerOptions {
            id: Uuid::new_v4(),
            ..Default::default()
        });

        let conn = peer.connection().unwrap();
        conn.account_rx(123);
        conn.account_tx(45);
        conn.close();

        assert_eq!(peer.refresh_state(), 0);

        let delta = peer.delta().expect("pending delta");
        assert_eq!((delta.rx, delta.tx), (123, 45));
    }
}
