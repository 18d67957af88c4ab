//! Static orchestrator for fixed fleets.
//!
//! Addresses come from the `orchestrator.instances` table of the config file.
//! There is no out-of-band command channel, so key pushes and commands are
//! reported as unsupported; the pool logs those and keeps dialing.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::error::{OrchestratorError, OrchestratorResult};
use super::{ExecOutput, InstanceAddress, Orchestrator};

pub struct StaticOrchestrator {
    instances: RwLock<HashMap<String, InstanceAddress>>,
}

impl StaticOrchestrator {
    pub fn new(instances: HashMap<String, InstanceAddress>) -> Self {
        Self {
            instances: RwLock::new(instances),
        }
    }

    /// Point an instance at a new address (an agent moved hosts).
    pub fn set_address(&self, instance_id: &str, address: InstanceAddress) {
        self.instances
            .write()
            .insert(instance_id.to_string(), address);
    }

    pub fn instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Orchestrator for StaticOrchestrator {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn get_address(&self, instance_id: &str) -> OrchestratorResult<InstanceAddress> {
        self.instances
            .read()
            .get(instance_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(instance_id))
    }

    async fn configure_access(
        &self,
        _instance_id: &str,
        _public_key: &str,
    ) -> OrchestratorResult<()> {
        Err(OrchestratorError::not_supported(self.name(), "configure_access"))
    }

    async fn exec(&self, _instance_id: &str, _command: &str) -> OrchestratorResult<ExecOutput> {
        Err(OrchestratorError::not_supported(self.name(), "exec"))
    }
}
