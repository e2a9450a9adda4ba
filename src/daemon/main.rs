mod cmd;
mod config;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kindling::{
    agent::{Agent, machine::machine::FirecrackerHypervisor, net::device::LinuxNetOps},
    api::ApiServer,
    controller::{VmController, signals::spawn_signal_handler},
    utils::tracing::init_tracing,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{cmd::Cli, config::Config};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    let cli = Cli::parse();
    let config = Config::load(cli.config_path).await?;
    info!("loaded config from {}", config.config_path.display());

    let agent_config = config.agent_config();
    let net_ops = Arc::new(LinuxNetOps::new()?);
    let hypervisor = Arc::new(FirecrackerHypervisor::new(
        agent_config.machine_config.clone(),
    ));
    let agent = Arc::new(Agent::new(agent_config, net_ops, hypervisor).await?);

    match agent.net().sweep_stale_devices().await {
        Ok(0) => {}
        Ok(swept) => info!("removed {} stale tap devices", swept),
        Err(e) => warn!("failed to sweep stale tap devices: {:#}", e),
    }

    let controller = VmController::new(agent);
    let shutdown = CancellationToken::new();
    let signals = spawn_signal_handler(controller.clone(), shutdown.clone())?;

    let api_server = ApiServer::new(controller.clone(), config.api_server_config());
    let served = api_server.start(shutdown.clone()).await;

    // stop anything created while the graceful shutdown was running, or everything if the
    // server failed on its own
    shutdown.cancel();
    signals.await?;
    controller.stop_all_forced().await;

    served?;
    info!("kindlingd stopped");

    Ok(())
}
