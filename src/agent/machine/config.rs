use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::Value;

use crate::{
    agent::{
        machine::MachineAgentConfig,
        net::ip_pool::{IpRange, Ordinal},
    },
    constants::{GUEST_IFACE_ID, MAC_PREFIX, ROOT_DRIVE_ID},
};

/// Everything needed to bring up one VM, derived from the request and its ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub id: String,
    pub ordinal: Ordinal,
    pub ip_addr: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub tap_name: String,
    pub mac_addr: String,
    pub socket_path: PathBuf,
    pub image_path: PathBuf,
    pub kernel_path: PathBuf,
    pub boot_args: String,
    pub vcpu_count: u8,
    pub memory_mib: u64,
}

pub struct VmConfigInput<'a> {
    pub id: &'a str,
    pub ordinal: Ordinal,
    pub tap_name: &'a str,
    pub image_path: &'a Path,
    pub kernel_path: &'a Path,
}

impl VmConfig {
    pub fn new(input: VmConfigInput<'_>, range: &IpRange, agent_config: &MachineAgentConfig) -> Self {
        let ip_addr = range.host(input.ordinal);
        let gateway = range.gateway();
        let netmask = range.netmask();

        let boot_args = format!(
            "{} ip={}::{}:{}::{}:off",
            agent_config.boot_args.trim_end(),
            ip_addr,
            gateway,
            netmask,
            GUEST_IFACE_ID
        );

        Self {
            id: input.id.to_string(),
            ordinal: input.ordinal,
            ip_addr,
            gateway,
            netmask,
            tap_name: input.tap_name.to_string(),
            mac_addr: format!("{}:{:02x}", MAC_PREFIX, input.ordinal),
            socket_path: agent_config
                .socket_dir
                .join(format!("firecracker-{}.sock", input.ordinal)),
            image_path: input.image_path.to_path_buf(),
            kernel_path: input.kernel_path.to_path_buf(),
            boot_args,
            vcpu_count: agent_config.vcpu_count,
            memory_mib: agent_config.memory_mib,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfiguration {
    pub vcpu_count: u8,
    pub mem_size_mib: u64,
    pub smt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MmdsConfig {
    pub network_interfaces: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub enum ActionType {
    InstanceStart,
    SendCtrlAltDel,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceAction {
    pub action_type: ActionType,
}

impl InstanceAction {
    pub fn new(action_type: ActionType) -> Self {
        Self { action_type }
    }
}

/// The hypervisor-side view of a `VmConfig`: one resource per control-socket endpoint.
#[derive(Debug, Clone)]
pub struct FirecrackerConfig {
    pub machine_config: MachineConfiguration,
    pub boot_source: BootSource,
    pub root_drive: Drive,
    pub network_interface: NetworkInterface,
    pub mmds_config: MmdsConfig,
}

impl From<&VmConfig> for FirecrackerConfig {
    fn from(config: &VmConfig) -> Self {
        Self {
            machine_config: MachineConfiguration {
                vcpu_count: config.vcpu_count,
                mem_size_mib: config.memory_mib,
                smt: false,
            },
            boot_source: BootSource {
                kernel_image_path: config.kernel_path.clone(),
                boot_args: config.boot_args.clone(),
            },
            root_drive: Drive {
                drive_id: ROOT_DRIVE_ID.to_string(),
                path_on_host: config.image_path.clone(),
                is_root_device: true,
                is_read_only: false,
            },
            network_interface: NetworkInterface {
                iface_id: GUEST_IFACE_ID.to_string(),
                guest_mac: config.mac_addr.clone(),
                host_dev_name: config.tap_name.clone(),
            },
            mmds_config: MmdsConfig {
                network_interfaces: vec![GUEST_IFACE_ID.to_string()],
            },
        }
    }
}

impl FirecrackerConfig {
    /// Endpoint/body pairs in the order they have to be applied. The MMDS config refers to the
    /// network interface, so it goes last.
    pub fn requests(&self) -> serde_json::Result<Vec<(String, Value)>> {
        Ok(vec![
            (
                "/machine-config".to_string(),
                serde_json::to_value(&self.machine_config)?,
            ),
            (
                "/boot-source".to_string(),
                serde_json::to_value(&self.boot_source)?,
            ),
            (
                format!("/drives/{}", self.root_drive.drive_id),
                serde_json::to_value(&self.root_drive)?,
            ),
            (
                format!("/network-interfaces/{}", self.network_interface.iface_id),
                serde_json::to_value(&self.network_interface)?,
            ),
            (
                "/mmds/config".to_string(),
                serde_json::to_value(&self.mmds_config)?,
            ),
        ])
    }
}
