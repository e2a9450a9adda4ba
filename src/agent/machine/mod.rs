pub mod api;
pub mod config;
pub mod machine;
pub mod metadata;

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    agent::{
        machine::config::{VmConfig, VmConfigInput},
        net::ip_pool::IpRange,
    },
    error::{MetadataError, SupervisorError},
};

#[derive(Debug, Clone)]
pub struct MachineAgentConfig {
    pub firecracker_path: PathBuf,
    pub socket_dir: PathBuf,
    pub boot_args: String,
    pub vcpu_count: u8,
    pub memory_mib: u64,
    pub start_timeout: Duration,
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Configuring,
    Starting,
    Running,
    Stopping,
    Terminated,
    Failed(String),
}

impl MachineState {
    pub fn is_final(&self) -> bool {
        matches!(self, MachineState::Terminated | MachineState::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Ask the guest to shut down, kill the process if it does not exit in time.
    Graceful,
    Forced,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineExit {
    /// Whether someone asked the machine to stop before it exited.
    pub requested: bool,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Handle to one supervised hypervisor process.
#[async_trait]
pub trait Machine: Send + Sync {
    fn state(&self) -> MachineState;

    fn pid(&self) -> Option<u32>;

    /// Resolves once the hypervisor process has exited.
    async fn wait(&self) -> MachineExit;

    async fn stop(&self, mode: StopMode) -> Result<(), SupervisorError>;

    async fn put_metadata(&self, payload: &Value) -> Result<(), MetadataError>;
}

pub type MachineRef = Arc<dyn Machine>;

#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Launches and configures a VM. On error nothing is left running; the socket is removed
    /// but the tap device and image belong to the caller.
    async fn start(
        &self,
        config: &VmConfig,
        token: CancellationToken,
    ) -> Result<MachineRef, SupervisorError>;
}

pub struct MachineAgent {
    config: MachineAgentConfig,
    hypervisor: Arc<dyn Hypervisor>,
}

impl MachineAgent {
    pub fn new(config: MachineAgentConfig, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { config, hypervisor }
    }

    pub fn config(&self) -> &MachineAgentConfig {
        &self.config
    }

    pub fn vm_config(&self, input: VmConfigInput<'_>, range: &IpRange) -> VmConfig {
        VmConfig::new(input, range, &self.config)
    }

    pub async fn start(
        &self,
        config: &VmConfig,
        token: CancellationToken,
    ) -> Result<MachineRef, SupervisorError> {
        info!(
            "starting machine {} ({} on {})",
            config.id, config.ip_addr, config.tap_name
        );

        self.hypervisor.start(config, token).await
    }
}
