use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Tuning hints attached to a device. Opaque to the executor; carried only
/// so external collaborators (the job bodies themselves) can read them back
/// off [`WorkerContext::device`](crate::WorkerContext::device).
pub type DeviceHints = BTreeMap<String, serde_json::Value>;

/// Identity of a logical accelerator (or CPU) mapped 1:1 to a worker.
///
/// Equality and hashing are defined over `device` alone — two `DeviceParams`
/// with the same name but different hints are the same device, matching the
/// "stable identity... unique within a pool" contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceParams {
    /// Stable, pool-unique device name (e.g. `"cuda:0"`, `"cpu"`).
    pub device: String,
    /// Tuning hints the executor never inspects.
    #[serde(default)]
    pub hints: DeviceHints,
}

impl DeviceParams {
    /// Construct a device with no tuning hints.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            hints: DeviceHints::new(),
        }
    }

    /// Construct a device with the given tuning hints.
    pub fn with_hints(device: impl Into<String>, hints: DeviceHints) -> Self {
        Self {
            device: device.into(),
            hints,
        }
    }
}

impl PartialEq for DeviceParams {
    fn eq(&self, other: &Self) -> bool {
        self.device == other.device
    }
}

impl Eq for DeviceParams {}

impl Hash for DeviceParams {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.device.hash(state);
    }
}
