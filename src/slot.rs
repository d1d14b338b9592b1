//! Listener slots
//!
//! A slot is one listener bound to one address, serving one proxy protocol
//! and owning a set of peers. The slot reconciles declarative peer lists,
//! indexes peers by username for password auth, and collects byte deltas
//! from live and departed peers.

use ring::constant_time;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::net::{parse_framed_ip, DnsHandle};
use crate::peer::{Peer, PeerDelta, PeerOptions};
use crate::ratelimit::{RateLimitError, RateLimiter};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("slot options incompatible")]
    Incompatible,

    #[error("invalid bind address: {0}")]
    InvalidBindAddr(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProto(ProxyProto),

    #[error("listen: {0}")]
    Bind(#[from] std::io::Error),
}

/// Authentication failures. Credential errors carry enough detail for logs
/// while clients see a uniform rejection.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("username not found")]
    UserNotFound,

    #[error("invalid password for {0}")]
    InvalidPassword(String),
}

/// Proxy protocol served by a slot. Unrecognized values survive parsing so
/// that a single bad entry fails validation instead of the whole config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyProto {
    Socks,
    Http,
    #[default]
    Unknown,
}

impl ProxyProto {
    pub fn valid(&self) -> bool {
        !matches!(self, ProxyProto::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProto::Socks => "socks",
            ProxyProto::Http => "http",
            ProxyProto::Unknown => "unknown",
        }
    }
}

impl From<&str> for ProxyProto {
    fn from(val: &str) -> Self {
        match val {
            "socks" => ProxyProto::Socks,
            "http" => ProxyProto::Http,
            _ => ProxyProto::Unknown,
        }
    }
}

impl fmt::Display for ProxyProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ProxyProto {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ProxyProto {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let val = String::deserialize(deserializer)?;
        Ok(ProxyProto::from(val.as_str()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotOptions {
    pub id: Uuid,
    pub proto: ProxyProto,
    pub bind_addr: String,
}

impl SlotOptions {
    /// Compatible slots serve the same protocol on the same address;
    /// the ID is free to change between configs.
    pub fn compatible(&self, other: &SlotOptions) -> bool {
        self.proto == other.proto && self.bind_addr == other.bind_addr
    }

    /// Short log tag
    pub fn handle(&self) -> String {
        format!("{}@{}", self.proto, self.bind_addr)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotInfo {
    pub id: Uuid,
    pub proto: ProxyProto,
    pub bind_addr: String,
    pub up: bool,
    pub registered_peers: usize,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// Shared slot core used by every protocol service
pub struct Slot {
    state: Mutex<SlotState>,
    rl: Arc<RateLimiter>,
    dns: DnsHandle,
    cancel: CancellationToken,
}

struct SlotState {
    options: SlotOptions,
    peer_map: HashMap<Uuid, Arc<Peer>>,
    username_map: HashMap<String, Arc<Peer>>,
    deferred_deltas: Vec<PeerDelta>,
}

impl Slot {
    pub fn new(options: SlotOptions, dns: DnsHandle) -> Self {
        Self {
            state: Mutex::new(SlotState {
                options,
                peer_map: HashMap::new(),
                username_map: HashMap::new(),
                deferred_deltas: Vec::new(),
            }),
            rl: RateLimiter::with_defaults(),
            dns,
            cancel: CancellationToken::new(),
        }
    }

    pub fn options(&self) -> SlotOptions {
        self.state.lock().unwrap().options.clone()
    }

    /// Applies a compatible options update
    pub fn set_options(&self, opts: SlotOptions) -> Result<(), SlotError> {
        let mut state = self.state.lock().unwrap();

        if !state.options.compatible(&opts) {
            return Err(SlotError::Incompatible);
        }

        state.options = opts;
        Ok(())
    }

    pub fn info(&self, up: bool) -> SlotInfo {
        let state = self.state.lock().unwrap();
        SlotInfo {
            id: state.options.id,
            proto: state.options.proto,
            bind_addr: state.options.bind_addr.clone(),
            up,
            registered_peers: state.peer_map.len(),
            error: None,
        }
    }

    /// Drains deferred and live peer deltas, merged per peer ID
    pub fn deltas(&self) -> Vec<PeerDelta> {
        let mut state = self.state.lock().unwrap();

        let mut entries = std::mem::take(&mut state.deferred_deltas);

        for peer in state.peer_map.values() {
            if let Some(delta) = peer.delta() {
                entries.push(delta);
            }
        }

        let mut merged: Vec<PeerDelta> = Vec::with_capacity(entries.len());
        for entry in entries {
            match merged.iter_mut().find(|val| val.peer_id == entry.peer_id) {
                Some(existing) => {
                    existing.rx += entry.rx;
                    existing.tx += entry.tx;
                }
                None => merged.push(entry),
            }
        }

        merged
    }

    /// Reconciles the peer set against a declarative list. Existing peers are
    /// updated in place; removed peers are closed with their byte counts
    /// captured; invalid entries are skipped with a warning.
    pub fn set_peers(&self, entries: Vec<PeerOptions>) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;

        let slot_handle = state.options.handle();

        let mut seen_ids: HashSet<Uuid> = HashSet::new();
        let mut seen_users: HashSet<String> = HashSet::new();

        let mut new_peer_map: HashMap<Uuid, Arc<Peer>> = HashMap::new();

        for entry in entries {
            if let Err(reason) = peer_mappable(&entry, &mut seen_ids, &mut seen_users) {
                warn!(
                    "Update peers: peer option invalid; skipped: peer_id={} name={} slot={} err={}",
                    entry.id,
                    entry.display_name(),
                    slot_handle,
                    reason,
                );
                continue;
            }

            let framed_ip = match parse_framed_ip(&entry.framed_ip) {
                Ok(val) => val,
                Err(err) => {
                    warn!(
                        "Update peers: framed IP unavailable: id={} addr={} name={} slot={} err={}",
                        entry.id,
                        entry.framed_ip,
                        entry.display_name(),
                        slot_handle,
                        err,
                    );
                    None
                }
            };

            if let Some(peer) = state.peer_map.remove(&entry.id) {
                debug!(
                    "Update peer: id={} name={} slot={}",
                    entry.id,
                    entry.display_name(),
                    slot_handle,
                );

                let old = peer.options();
                let credentials_changed = !old.cmp_credentials(&entry);
                let framed_ip_changed = old.framed_ip != entry.framed_ip;
                let disabled_changed = old.disabled != entry.disabled;
                let now_disabled = entry.disabled;

                peer.set_options(entry.clone(), framed_ip);

                // drop connections when the peer transitions to disabled
                if disabled_changed {
                    if now_disabled {
                        peer.close_connections();
                        if let Some(delta) = peer.delta() {
                            state.deferred_deltas.push(delta);
                        }
                        info!(
                            "Peer disabled: id={} name={} slot={}",
                            entry.id,
                            entry.display_name(),
                            slot_handle,
                        );
                    } else {
                        info!(
                            "Peer enabled: id={} name={} slot={}",
                            entry.id,
                            entry.display_name(),
                            slot_handle,
                        );
                    }
                }

                // drop connections when the peer auth or source IP changed
                if credentials_changed || framed_ip_changed {
                    if credentials_changed {
                        info!(
                            "Peer credentials changed; must reauthenticate: id={} name={} slot={}",
                            entry.id,
                            entry.display_name(),
                            slot_handle,
                        );
                    } else {
                        info!(
                            "Peer framed IP changed; must reauthenticate: id={} name={} slot={}",
                            entry.id,
                            entry.display_name(),
                            slot_handle,
                        );
                    }

                    peer.close_connections();
                    if let Some(delta) = peer.delta() {
                        state.deferred_deltas.push(delta);
                    }
                }

                new_peer_map.insert(entry.id, peer);
                continue;
            }

            info!(
                "Create peer: id={} name={} slot={}",
                entry.id,
                entry.display_name(),
                slot_handle,
            );

            let peer = Peer::new(entry, framed_ip, self.dns.clone(), self.cancel.child_token());
            new_peer_map.insert(peer.id(), peer);
        }

        // peers absent from the new set are closed for good
        for (_, peer) in state.peer_map.drain() {
            info!(
                "Remove peer: id={} name={} slot={}",
                peer.id(),
                peer.display_name(),
                slot_handle,
            );

            peer.close();
            if let Some(delta) = peer.delta() {
                state.deferred_deltas.push(delta);
            }
        }

        state.peer_map = new_peer_map;

        // rebuild the username index; exactly one entry per authed peer
        state.username_map = state
            .peer_map
            .values()
            .filter_map(|peer| {
                peer.options()
                    .password_auth
                    .map(|auth| (auth.user, peer.clone()))
            })
            .collect();
    }

    /// Tears down every peer's connections, keeping the peers registered
    pub fn close_peer_connections(&self) {
        let mut state = self.state.lock().unwrap();

        let mut captured = Vec::new();
        for peer in state.peer_map.values() {
            peer.close_connections();
            if let Some(delta) = peer.delta() {
                captured.push(delta);
            }
        }

        state.deferred_deltas.extend(captured);
    }

    /// Shuts the slot down; peers stay in the map so pending deltas remain
    /// collectable through `deltas`.
    pub fn close(&self) {
        self.cancel.cancel();

        let state = self.state.lock().unwrap();
        for peer in state.peer_map.values() {
            peer.close();
        }
    }

    /// Authenticates a client against the peer set. Failed attempts consume
    /// rate-limiter quota keyed by the client address; successful ones don't.
    pub fn lookup_with_password(
        &self,
        client_ip: IpAddr,
        username: &str,
        password: &str,
    ) -> Result<Arc<Peer>, AuthError> {
        let state = self.state.lock().unwrap();

        let ctr = self.rl.get(&format!("pw:{client_ip}"));
        ctr.use_quota()?;

        let Some(peer) = state.username_map.get(username) else {
            return Err(AuthError::UserNotFound);
        };

        let Some(auth) = peer.options().password_auth else {
            return Err(AuthError::UserNotFound);
        };

        if constant_time::verify_slices_are_equal(auth.password.as_bytes(), password.as_bytes())
            .is_err()
        {
            return Err(AuthError::InvalidPassword(username.to_string()));
        }

        ctr.reset();

        Ok(peer.clone())
    }
}

fn peer_mappable(
    entry: &PeerOptions,
    seen_ids: &mut HashSet<Uuid>,
    seen_users: &mut HashSet<String>,
) -> Result<(), String> {
    if entry.id.is_nil() {
        return Err("peer id is nil".to_string());
    }

    if !seen_ids.insert(entry.id) {
        return Err(format!("id not unique: {}", entry.id));
    }

    let Some(auth) = &entry.password_auth else {
        return Err("no auth properties are set".to_string());
    };

    if !seen_users.insert(auth.user.clone()) {
        return Err(format!("user name not unique: {}", auth.user));
    }

    Ok(())
}
