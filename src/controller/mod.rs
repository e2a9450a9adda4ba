pub mod registry;
pub mod signals;

use std::{
    net::Ipv4Addr,
    path::Path,
    sync::{Arc, Weak},
};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    agent::{
        Agent,
        machine::{MachineRef, StopMode, config::VmConfig, config::VmConfigInput},
        net::ip_pool::Ordinal,
    },
    controller::registry::{Lifecycle, Registry, RunningVm, VmSummary},
    error::{VmError, VmResult},
    utils::{id::new_vm_id, rollback::Rollback},
};

/// Body of a create call. Fields other than the two paths are kept as-is and end up in the
/// guest's metadata document together with them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateVmRequest {
    pub root_image_path: String,
    pub kernel_path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CreateVmRequest {
    pub fn validate(&self) -> VmResult<()> {
        if self.root_image_path.trim().is_empty() {
            return Err(VmError::Validation(
                "root_image_path must not be empty".to_string(),
            ));
        }

        if self.kernel_path.trim().is_empty() {
            return Err(VmError::Validation("kernel_path must not be empty".to_string()));
        }

        Ok(())
    }

    pub fn metadata(&self) -> Value {
        let mut document = Map::new();
        document.insert(
            "root_image_path".to_string(),
            Value::String(self.root_image_path.clone()),
        );
        document.insert(
            "kernel_path".to_string(),
            Value::String(self.kernel_path.clone()),
        );
        document.extend(self.extra.clone());

        Value::Object(document)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CreatedVm {
    pub id: String,
    pub ip_address: Ipv4Addr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_error: Option<String>,
}

struct StartedVm {
    config: VmConfig,
    token: CancellationToken,
    machine: MachineRef,
}

/// Orchestrates VM lifecycles across the agents and owns the registry of running VMs.
pub struct VmController {
    me: Weak<VmController>,
    agent: Arc<Agent>,
    registry: Registry,
    escalated: CancellationToken,
}

impl VmController {
    pub fn new(agent: Arc<Agent>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            agent,
            registry: Registry::new(),
            escalated: CancellationToken::new(),
        })
    }

    pub fn agent(&self) -> Arc<Agent> {
        self.agent.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Builds and registers a VM. The work runs on its own task, so it completes (or unwinds)
    /// even when the caller stops polling.
    pub async fn create(&self, request: CreateVmRequest) -> VmResult<CreatedVm> {
        let Some(controller) = self.me.upgrade() else {
            return Err(VmError::Internal("controller is gone".to_string()));
        };

        tokio::spawn(async move { controller.create_detached(request).await })
            .await
            .map_err(|e| VmError::Internal(format!("create task failed: {e}")))?
    }

    async fn create_detached(&self, request: CreateVmRequest) -> VmResult<CreatedVm> {
        request.validate()?;

        let id = new_vm_id();
        let ip_pool = self.agent.ip_pool();
        let ordinal = ip_pool.allocate().await?;

        let mut rollback = Rollback::new();
        rollback.push("release-ordinal", move || async move {
            ip_pool.release(ordinal).await;
            Ok(())
        });

        let started = match self.start(&id, ordinal, &request, &mut rollback).await {
            Ok(started) => {
                rollback.commit();
                started
            }
            Err(e) => {
                warn!("failed to create vm {}: {}", id, e);
                rollback.unwind().await;
                return Err(e);
            }
        };

        let vm = Arc::new(RunningVm::new(
            started.config,
            started.token,
            started.machine,
        ));

        let lifecycle = vm.lock().await;
        self.registry.insert(vm.clone());
        self.spawn_exit_watcher(vm.clone());

        info!(
            "vm {} running at {} on {}",
            vm.id(),
            vm.config.ip_addr,
            vm.config.tap_name
        );

        let metadata_error = match vm.machine.put_metadata(&request.metadata()).await {
            Ok(()) => None,
            Err(e) => {
                warn!("vm {} is running without metadata: {:#}", vm.id(), e);
                Some(e.to_string())
            }
        };
        drop(lifecycle);

        Ok(CreatedVm {
            id: vm.config.id.clone(),
            ip_address: vm.config.ip_addr,
            metadata_error,
        })
    }

    async fn start(
        &self,
        id: &str,
        ordinal: Ordinal,
        request: &CreateVmRequest,
        rollback: &mut Rollback,
    ) -> VmResult<StartedVm> {
        let image = self.agent.image();
        let image_path = image.provision(&request.root_image_path).await?;
        {
            let image_path = image_path.clone();
            rollback.push("discard-image", move || async move {
                image.discard(&image_path).await;
                Ok(())
            });
        }

        let net = self.agent.net();
        let tap_name = net.tap_name(ordinal);
        let machine_agent = self.agent.machine();
        let config = machine_agent.vm_config(
            VmConfigInput {
                id,
                ordinal,
                tap_name: &tap_name,
                image_path: &image_path,
                kernel_path: Path::new(&request.kernel_path),
            },
            self.agent.ip_pool().range(),
        );

        net.setup(&tap_name).await?;
        rollback.push("teardown-tap", move || async move {
            net.teardown(&tap_name).await;
            Ok(())
        });

        let token = CancellationToken::new();
        {
            let token = token.clone();
            rollback.push("cancel-scope", move || async move {
                token.cancel();
                Ok(())
            });
        }

        let machine = machine_agent.start(&config, token.clone()).await?;

        Ok(StartedVm {
            config,
            token,
            machine,
        })
    }

    fn spawn_exit_watcher(&self, vm: Arc<RunningVm>) {
        let controller = self.me.clone();

        tokio::spawn(async move {
            let exit = tokio::select! {
                exit = vm.machine.wait() => exit,
                _ = vm.token.cancelled() => return,
            };

            if exit.requested || vm.stop_requested() {
                return;
            }

            let Some(controller) = controller.upgrade() else {
                return;
            };

            warn!("vm {} exited unexpectedly ({:?}), reaping it", vm.id(), exit);
            controller.reap(vm.id()).await;
        });
    }

    /// Stops the machine when `mode` is set, then releases everything the VM holds. Returns
    /// false if someone else already tore it down.
    async fn teardown(&self, vm: &RunningVm, mode: Option<StopMode>) -> VmResult<bool> {
        let mut lifecycle = vm.lock().await;
        if *lifecycle == Lifecycle::TornDown {
            return Ok(false);
        }

        vm.request_stop();
        if let Some(mode) = mode {
            self.stop_machine(vm, mode).await?;
        }

        self.agent.image().discard(&vm.config.image_path).await;
        self.agent.net().teardown(&vm.config.tap_name).await;
        self.registry.remove(vm.id());
        // released last so a concurrent create can't pick up the tap name mid-teardown
        self.agent.ip_pool().release(vm.config.ordinal).await;
        vm.token.cancel();

        *lifecycle = Lifecycle::TornDown;
        Ok(true)
    }

    async fn stop_machine(&self, vm: &RunningVm, mode: StopMode) -> VmResult<()> {
        if mode == StopMode::Graceful && !self.escalated.is_cancelled() {
            tokio::select! {
                result = vm.machine.stop(StopMode::Graceful) => {
                    return result.map_err(VmError::from);
                }
                _ = self.escalated.cancelled() => {
                    warn!("graceful stop of vm {} cut short, killing it", vm.id());
                }
            }
        }

        vm.machine.stop(StopMode::Forced).await?;
        Ok(())
    }

    /// Turns every graceful stop, in flight or future, into a forced one.
    pub fn escalate_stops(&self) {
        self.escalated.cancel();
    }

    pub async fn delete(&self, id: &str) -> VmResult<()> {
        let Some(vm) = self.registry.get(id) else {
            debug!("delete of unknown vm {}", id);
            return Err(VmError::NotFound(id.to_string()));
        };

        if !self.teardown(&vm, Some(StopMode::Forced)).await? {
            debug!("vm {} was already torn down", id);
            return Err(VmError::NotFound(id.to_string()));
        }

        info!("vm {} deleted", id);
        Ok(())
    }

    /// Cleans up after a VM whose hypervisor exited on its own.
    pub async fn reap(&self, id: &str) {
        let Some(vm) = self.registry.get(id) else {
            return;
        };

        match self.teardown(&vm, None).await {
            Ok(true) => info!("vm {} reaped", id),
            Ok(false) => {}
            Err(e) => warn!("failed to reap vm {}: {}", id, e),
        }
    }

    /// Stops every registered VM and reclaims its resources. Individual failures are logged and
    /// skipped. Returns how many VMs were torn down.
    pub async fn shutdown_all(&self, mode: StopMode) -> usize {
        let vms = self.registry.all();
        if vms.is_empty() {
            return 0;
        }

        info!("stopping {} vms ({:?})", vms.len(), mode);

        let results = join_all(vms.iter().map(|vm| async move {
            let result = self.teardown(vm, Some(mode)).await;
            (vm.id(), result)
        }))
        .await;

        let mut stopped = 0;
        for (id, result) in results {
            match result {
                Ok(true) => stopped += 1,
                Ok(false) => {}
                Err(e) => warn!("failed to stop vm {}: {}", id, e),
            }
        }

        info!("stopped {} vms", stopped);
        stopped
    }

    pub async fn shutdown_all_graceful(&self) -> usize {
        self.shutdown_all(StopMode::Graceful).await
    }

    pub async fn stop_all_forced(&self) -> usize {
        self.shutdown_all(StopMode::Forced).await
    }

    pub fn list(&self) -> Vec<VmSummary> {
        let mut vms = self
            .registry
            .all()
            .iter()
            .map(|vm| vm.summary())
            .collect::<Vec<_>>();

        vms.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        vms
    }
}
