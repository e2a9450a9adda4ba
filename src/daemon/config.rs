use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Result, bail};
use kindling::{
    agent::{
        AgentConfig, image::ImageAgentConfig, machine::MachineAgentConfig,
        net::NetAgentConfig, net::ip_pool::IpPoolConfig,
    },
    api::ApiServerConfig,
    constants::{
        DEFAULT_BOOT_ARGS, DEFAULT_BRIDGE_NAME, DEFAULT_FIRST_ORDINAL, DEFAULT_LAST_ORDINAL,
        DEFAULT_MEMORY_MIB, DEFAULT_SHUTDOWN_TIMEOUT_SECS, DEFAULT_START_TIMEOUT_SECS,
        DEFAULT_SUBNET_CIDR, DEFAULT_TAP_PREFIX, DEFAULT_VCPU_COUNT,
    },
};
use serde::{Deserialize, Serialize};
use tokio::fs::read_to_string;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(skip_serializing, skip_deserializing)]
    pub config_path: PathBuf,
    #[serde(skip_serializing, skip_deserializing)]
    pub config_dir: PathBuf,

    #[serde(rename = "api", default)]
    pub api_server_config: ApiConfig,

    #[serde(rename = "net", default)]
    pub net_config: NetConfig,

    #[serde(rename = "machine")]
    pub machine_config: MachineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", default)]
pub struct NetConfig {
    pub bridge_name: String,
    pub subnet_cidr: String,
    pub first_ordinal: u8,
    pub last_ordinal: u8,
    pub tap_prefix: String,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bridge_name: DEFAULT_BRIDGE_NAME.to_string(),
            subnet_cidr: DEFAULT_SUBNET_CIDR.to_string(),
            first_ordinal: DEFAULT_FIRST_ORDINAL,
            last_ordinal: DEFAULT_LAST_ORDINAL,
            tap_prefix: DEFAULT_TAP_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MachineConfig {
    pub firecracker_path: PathBuf,
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    #[serde(default = "default_vcpu_count")]
    pub vcpu_count: u8,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u64,
    #[serde(default = "default_boot_args")]
    pub boot_args: String,
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_image_dir() -> PathBuf {
    PathBuf::from("/images")
}

fn default_vcpu_count() -> u8 {
    DEFAULT_VCPU_COUNT
}

fn default_memory_mib() -> u64 {
    DEFAULT_MEMORY_MIB
}

fn default_boot_args() -> String {
    DEFAULT_BOOT_ARGS.to_string()
}

fn default_start_timeout_secs() -> u64 {
    DEFAULT_START_TIMEOUT_SECS
}

fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

const CONFIG_ENV_VAR: &str = "KINDLING_CONFIG";
const GLOBAL_CONFIG_PATH: &str = "/etc/kindling/config.toml";

/// Default locations, most specific first: working directory, user config dir, system-wide.
fn config_candidates(cwd: &Path) -> Vec<PathBuf> {
    let user_config = directories::ProjectDirs::from("dev", "kindling", "kindling")
        .map(|dirs| dirs.config_dir().join("config.toml"));

    std::iter::once(cwd.join("kindling.toml"))
        .chain(user_config)
        .chain(std::iter::once(PathBuf::from(GLOBAL_CONFIG_PATH)))
        .collect()
}

fn resolve_config_path(path_override: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) =
        path_override.or_else(|| std::env::var_os(CONFIG_ENV_VAR).map(PathBuf::from))
    {
        return Ok(path);
    }

    let candidates = config_candidates(&std::env::current_dir()?);
    match candidates.iter().find(|path| path.is_file()) {
        Some(path) => Ok(path.clone()),
        None => {
            let searched = candidates
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            warn!("no config file found, searched: {}", searched);
            bail!("no config file found, pass --config or set {CONFIG_ENV_VAR}");
        }
    }
}

impl Config {
    pub async fn load(path_override: Option<PathBuf>) -> Result<Self> {
        let config_path = resolve_config_path(path_override)?;

        let config_str = read_to_string(&config_path).await?;
        let mut config = Self::parse(&config_str)?;
        config.config_path = config_path.clone();

        let Some(config_dir) = config_path.parent().map(|p| p.to_path_buf()) else {
            bail!("Couldn't determine config dir");
        };
        config.config_dir = config_dir;

        Ok(config)
    }

    pub fn parse(config_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(config_str)?;

        if config.machine_config.vcpu_count == 0 {
            bail!("machine.vcpu-count must be at least 1");
        }

        if config.machine_config.memory_mib == 0 {
            bail!("machine.memory-mib must be at least 1");
        }

        Ok(config)
    }

    /// Relative paths in the config file are resolved against the file's directory.
    fn resolve(&self, path: &Path) -> PathBuf {
        self.config_dir.join(path)
    }

    pub fn api_server_config(&self) -> ApiServerConfig {
        ApiServerConfig {
            host: self.api_server_config.host.clone(),
            port: self.api_server_config.port,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        let net = &self.net_config;
        let machine = &self.machine_config;

        AgentConfig {
            net_config: NetAgentConfig {
                bridge_name: net.bridge_name.clone(),
                tap_prefix: net.tap_prefix.clone(),
            },
            ip_pool_config: IpPoolConfig {
                cidr: net.subnet_cidr.clone(),
                first_ordinal: net.first_ordinal,
                last_ordinal: net.last_ordinal,
            },
            image_config: ImageAgentConfig {
                image_dir: self.resolve(&machine.image_dir),
            },
            machine_config: MachineAgentConfig {
                firecracker_path: self.resolve(&machine.firecracker_path),
                socket_dir: self.resolve(&machine.socket_dir),
                boot_args: machine.boot_args.clone(),
                vcpu_count: machine.vcpu_count,
                memory_mib: machine.memory_mib,
                start_timeout: Duration::from_secs(machine.start_timeout_secs),
                shutdown_timeout: Duration::from_secs(machine.shutdown_timeout_secs),
            },
        }
    }
}
