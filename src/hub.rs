//! Service hub
//!
//! Reconciles the declarative service list from the backend into running
//! listener slots, keyed by their canonical bind address. Slots whose
//! options stay compatible are updated in place; everything else is
//! replaced, with byte deltas captured across the swap.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::http::HttpService;
use crate::net::{DnsHandle, NetError};
use crate::peer::{PeerDelta, PeerOptions};
use crate::slot::{ProxyProto, SlotError, SlotInfo, SlotOptions};
use crate::socks5::Socks5Service;

/// Capability set every protocol service exposes to the hub
#[async_trait]
pub trait SlotService: Send + Sync {
    fn info(&self) -> SlotInfo;
    fn deltas(&self) -> Vec<PeerDelta>;
    fn set_peers(&self, entries: Vec<PeerOptions>);
    fn set_options(&self, opts: SlotOptions) -> Result<(), SlotError>;
    async fn close(&self) -> Result<(), SlotError>;
}

/// One slot plus its peer list, as delivered by the backend
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    #[serde(flatten)]
    pub slot: SlotOptions,
    pub peers: Vec<PeerOptions>,
}

/// Canonical listener key for a slot: `ip:port/tcp`. The host part must be
/// a literal IP. The suffix leaves room for UDP transports later.
pub fn service_bind_addr(addr: &str, proto: ProxyProto) -> Result<String, NetError> {
    let sockaddr: SocketAddr = addr
        .parse()
        .map_err(|_| NetError::InvalidAddr(addr.to_string()))?;

    let suffix = match proto {
        ProxyProto::Socks | ProxyProto::Http => "tcp",
        ProxyProto::Unknown => return Err(NetError::UnsupportedProto(proto.to_string())),
    };

    Ok(format!("{sockaddr}/{suffix}"))
}

pub struct ServiceHub {
    dns: DnsHandle,
    state: tokio::sync::Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    bind_map: HashMap<String, Arc<dyn SlotService>>,
    deferred_deltas: Vec<PeerDelta>,
    err_slots: Vec<SlotInfo>,
}

impl Default for ServiceHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHub {
    pub fn new() -> Self {
        Self {
            dns: DnsHandle::new(),
            state: tokio::sync::Mutex::new(HubState::default()),
        }
    }

    pub fn dns(&self) -> DnsHandle {
        self.dns.clone()
    }

    /// Swaps the shared upstream resolver. An empty address reverts to
    /// system resolution.
    pub fn set_dns(&self, addr: &str) {
        if addr.is_empty() {
            self.dns.clear();
            return;
        }

        if let Err(err) = self.dns.set(addr) {
            error!("ServiceHub: set dns: addr={addr} err={err}");
        }
    }

    /// Reconciles running slots against the declarative service list
    pub async fn set_services(&self, entries: Vec<ServiceOptions>) {
        let mut state = self.state.lock().await;

        state.err_slots.clear();

        let mut seen_ids: HashSet<Uuid> = HashSet::new();
        let mut new_bind_map: HashMap<String, Arc<dyn SlotService>> = HashMap::new();

        for entry in entries {
            let ServiceOptions { slot: opts, peers } = entry;

            if let Err(reason) = slot_opts_valid(&opts, &mut seen_ids) {
                warn!(
                    "ServiceHub: import slot: entry invalid; skipped: slot_id={} err={}",
                    opts.id, reason,
                );
                continue;
            }

            let bind_key = match service_bind_addr(&opts.bind_addr, opts.proto) {
                Ok(val) => val,
                Err(err) => {
                    warn!(
                        "ServiceHub: bind addr invalid: val={} err={}",
                        opts.bind_addr, err,
                    );
                    continue;
                }
            };

            if let Some(slot) = state.bind_map.remove(&bind_key) {
                if slot.set_options(opts.clone()).is_ok() {
                    slot.set_peers(peers);

                    debug!(
                        "ServiceHub: update slot: id={} proto={} addr={}",
                        opts.id, opts.proto, opts.bind_addr,
                    );

                    new_bind_map.insert(bind_key, slot);
                    continue;
                }

                // same bind key, different service shape: replace
                if let Err(err) = slot.close().await {
                    error!(
                        "ServiceHub: replace slot: close outdated slot: id={} err={}",
                        slot.info().id,
                        err,
                    );
                    state.bind_map.insert(bind_key, slot);
                    continue;
                }

                let deltas = slot.deltas();
                state.deferred_deltas.extend(deltas);

                info!(
                    "ServiceHub: replace slot: id={} proto={} addr={}",
                    opts.id, opts.proto, opts.bind_addr,
                );
            } else {
                info!(
                    "ServiceHub: create slot: id={} proto={} addr={}",
                    opts.id, opts.proto, opts.bind_addr,
                );
            }

            let service = match create_service(opts.clone(), &self.dns).await {
                Ok(val) => val,
                Err(err) => {
                    error!(
                        "ServiceHub: create slot: id={} proto={} addr={} err={}",
                        opts.id, opts.proto, opts.bind_addr, err,
                    );
                    state.err_slots.push(SlotInfo {
                        id: opts.id,
                        proto: opts.proto,
                        bind_addr: opts.bind_addr.clone(),
                        up: false,
                        registered_peers: 0,
                        error: Some(err.to_string()),
                    });
                    continue;
                }
            };

            service.set_peers(peers);

            new_bind_map.insert(bind_key, service);
        }

        // slots absent from the new config are shut down
        let outdated: Vec<(String, Arc<dyn SlotService>)> = state.bind_map.drain().collect();
        for (key, slot) in outdated {
            let slot_info = slot.info();

            if let Err(err) = slot.close().await {
                warn!(
                    "ServiceHub: slot failed to terminate; keeping and retrying: id={} proto={} addr={} err={}",
                    slot_info.id, slot_info.proto, slot_info.bind_addr, err,
                );
                warn!("ServiceHub: possible service binding conflict");

                state.deferred_deltas.extend(slot.deltas());
                new_bind_map.insert(key, slot);
                continue;
            }

            info!(
                "ServiceHub: remove outdated slot: id={} proto={} addr={}",
                slot_info.id, slot_info.proto, slot_info.bind_addr,
            );

            state.deferred_deltas.extend(slot.deltas());
        }

        state.bind_map = new_bind_map;
    }

    /// Drains byte deltas deferred by slot replacement plus the live slots'
    pub async fn deltas(&self) -> Vec<PeerDelta> {
        let mut state = self.state.lock().await;

        let mut entries = std::mem::take(&mut state.deferred_deltas);

        for slot in state.bind_map.values() {
            entries.extend(slot.deltas());
        }

        entries
    }

    /// Health report: live slots plus the ones that failed to come up
    pub async fn slot_infos(&self) -> Vec<SlotInfo> {
        let state = self.state.lock().await;

        let mut infos: Vec<SlotInfo> = state.bind_map.values().map(|slot| slot.info()).collect();
        infos.extend(state.err_slots.iter().cloned());

        infos
    }

    /// Shuts every slot down, keeping their final deltas
    pub async fn close_slots(&self) {
        let mut state = self.state.lock().await;

        let slots: Vec<(String, Arc<dyn SlotService>)> = state.bind_map.drain().collect();
        for (_, slot) in slots {
            let slot_info = slot.info();

            if let Err(err) = slot.close().await {
                error!(
                    "ServiceHub: slot failed to terminate: id={} proto={} addr={} err={}",
                    slot_info.id, slot_info.proto, slot_info.bind_addr, err,
                );
            } else {
                info!(
                    "ServiceHub: terminate slot: id={} proto={} addr={}",
                    slot_info.id, slot_info.proto, slot_info.bind_addr,
                );
            }

            state.deferred_deltas.extend(slot.deltas());
        }
    }
}

async fn create_service(
    opts: SlotOptions,
    dns: &DnsHandle,
) -> Result<Arc<dyn SlotService>, SlotError> {
    match opts.proto {
        ProxyProto::Socks => Ok(Arc::new(Socks5Service::bind(opts, dns.clone()).await?)),
        ProxyProto::Http => Ok(Arc::new(HttpService::bind(opts, dns.clone()).await?)),
        ProxyProto::Unknown => Err(SlotError::UnsupportedProto(opts.proto)),
    }
}

fn slot_opts_valid(opts: &SlotOptions, seen_ids: &mut HashSet<Uuid>) -> Result<(), String> {
    if opts.id.is_nil() {
        return Err("slot id is nil".to_string());
    }

    if !seen_ids.insert(opts.id) {
        return Err(format!("slot id not unique: {}", opts.id));
    }

    if !opts.proto.valid() {
        return Err(format!("slot proto invalid: {}", opts.proto));
    }

    Ok(())
}
