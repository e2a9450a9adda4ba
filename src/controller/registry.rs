use std::{
    net::Ipv4Addr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use papaya::HashMap;
use serde::Serialize;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::agent::machine::{MachineRef, MachineState, config::VmConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    TornDown,
}

/// A started VM and everything reserved for it.
pub struct RunningVm {
    pub config: VmConfig,
    pub token: CancellationToken,
    pub machine: MachineRef,
    pub created_at: DateTime<Utc>,
    stop_requested: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
}

impl RunningVm {
    pub fn new(config: VmConfig, token: CancellationToken, machine: MachineRef) -> Self {
        Self {
            config,
            token,
            machine,
            created_at: Utc::now(),
            stop_requested: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle::Active),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Serializes registration, metadata injection and teardown of this VM.
    pub async fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().await
    }

    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> VmSummary {
        VmSummary {
            id: self.config.id.clone(),
            ip_address: self.config.ip_addr,
            tap_name: self.config.tap_name.clone(),
            state: self.machine.state(),
            pid: self.machine.pid(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VmSummary {
    pub id: String,
    pub ip_address: Ipv4Addr,
    pub tap_name: String,
    pub state: MachineState,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct Registry {
    vms: HashMap<String, Arc<RunningVm>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, vm: Arc<RunningVm>) {
        let vms = self.vms.pin();
        vms.insert(vm.config.id.clone(), vm);
    }

    pub fn get(&self, id: &str) -> Option<Arc<RunningVm>> {
        let vms = self.vms.pin();
        vms.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<RunningVm>> {
        let vms = self.vms.pin();
        vms.remove(id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<RunningVm>> {
        let vms = self.vms.pin();
        vms.iter().map(|(_, vm)| vm.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.vms.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
