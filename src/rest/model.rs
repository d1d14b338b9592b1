//! Control-plane wire model

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hub::ServiceOptions;
use crate::peer::PeerDelta;
use crate::slot::SlotInfo;

/// Everything the backend wants this node to run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FullConfig {
    pub services: Vec<ServiceOptions>,
    pub dns: String,
}

/// Identity of the current process run
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub run_id: Uuid,
    /// Seconds since startup
    pub uptime: i64,
}

/// Periodic node report: accumulated byte deltas and slot health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Status {
    pub service: ServiceInfo,
    #[serde(default)]
    pub deltas: Vec<PeerDelta>,
    #[serde(default)]
    pub slots: Vec<SlotInfo>,
}
