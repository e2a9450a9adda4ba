pub mod image;
pub mod machine;
pub mod net;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::agent::{
    image::{ImageAgent, ImageAgentConfig},
    machine::{Hypervisor, MachineAgent, MachineAgentConfig},
    net::{
        NetAgent, NetAgentConfig,
        device::NetOps,
        ip_pool::{IpPool, IpPoolConfig},
    },
};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub net_config: NetAgentConfig,
    pub ip_pool_config: IpPoolConfig,
    pub image_config: ImageAgentConfig,
    pub machine_config: MachineAgentConfig,
}

/// Host-side resource owners, one per concern. The controller composes them into VM lifecycles.
pub struct Agent {
    net: Arc<NetAgent>,
    ip_pool: Arc<IpPool>,
    image: Arc<ImageAgent>,
    machine: Arc<MachineAgent>,
}

impl Agent {
    pub async fn new(
        config: AgentConfig,
        net_ops: Arc<dyn NetOps>,
        hypervisor: Arc<dyn Hypervisor>,
    ) -> Result<Self> {
        let ip_pool = Arc::new(IpPool::new(config.ip_pool_config.clone())?);
        let net = Arc::new(NetAgent::new(config.net_config.clone(), net_ops).await?);
        let image = Arc::new(ImageAgent::new(config.image_config.clone()).await?);
        let machine = Arc::new(MachineAgent::new(config.machine_config.clone(), hypervisor));

        info!(
            "agent ready: {} guest addresses in {}, bridge {}",
            ip_pool.capacity(),
            ip_pool.range().cidr,
            net.config.bridge_name
        );

        Ok(Self {
            net,
            ip_pool,
            image,
            machine,
        })
    }

    pub fn net(&self) -> Arc<NetAgent> {
        self.net.clone()
    }

    pub fn ip_pool(&self) -> Arc<IpPool> {
        self.ip_pool.clone()
    }

    pub fn image(&self) -> Arc<ImageAgent> {
        self.image.clone()
    }

    pub fn machine(&self) -> Arc<MachineAgent> {
        self.machine.clone()
    }
}
