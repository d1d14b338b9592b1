//! One live relay owned by a peer

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-connection byte counters and bandwidth watermarks. Counters are
/// drained by the peer's redistribution pass; the cancellation token is a
/// child of the peer's own.
#[derive(Debug)]
pub struct PeerConnection {
    id: u64,

    delta_rx: AtomicU64,
    delta_tx: AtomicU64,

    band_rx: AtomicU32,
    band_tx: AtomicU32,

    cancel: CancellationToken,

    /// Last redistribution sample, None until the first pass
    pub(crate) updated: Mutex<Option<Instant>>,
}

impl PeerConnection {
    pub(crate) fn new(id: u64, band_rx: u32, band_tx: u32, cancel: CancellationToken) -> Self {
        Self {
            id,
            delta_rx: AtomicU64::new(0),
            delta_tx: AtomicU64::new(0),
            band_rx: AtomicU32::new(band_rx),
            band_tx: AtomicU32::new(band_tx),
            cancel,
            updated: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current receive cap in bytes per second; None means unlimited
    pub fn bandwidth_rx(&self) -> Option<u32> {
        match self.band_rx.load(Ordering::Relaxed) {
            0 => None,
            val => Some(val),
        }
    }

    /// Current transmit cap in bytes per second; None means unlimited
    pub fn bandwidth_tx(&self) -> Option<u32> {
        match self.band_tx.load(Ordering::Relaxed) {
            0 => None,
            val => Some(val),
        }
    }

    pub fn account_rx(&self, delta: u64) {
        if delta > 0 {
            self.delta_rx.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub fn account_tx(&self, delta: u64) {
        if delta > 0 {
            self.delta_tx.fetch_add(delta, Ordering::Relaxed);
        }
    }

    pub(crate) fn take_rx(&self) -> u64 {
        self.delta_rx.swap(0, Ordering::Relaxed)
    }

    pub(crate) fn take_tx(&self) -> u64 {
        self.delta_tx.swap(0, Ordering::Relaxed)
    }

    pub(crate) fn peek_rx(&self) -> u64 {
        self.delta_rx.load(Ordering::Relaxed)
    }

    pub(crate) fn peek_tx(&self) -> u64 {
        self.delta_tx.load(Ordering::Relaxed)
    }

    pub(crate) fn set_bandwidth(&self, rx: u32, tx: u32) {
        self.band_rx.store(rx, Ordering::Relaxed);
        self.band_tx.store(tx, Ordering::Relaxed);
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Closes the connection when dropped. Keeps handler exits on any path from
/// leaking live map entries until the next sweep.
pub struct ConnCloser<'a>(pub &'a PeerConnection);

impl Drop for ConnCloser<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}
