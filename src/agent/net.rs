pub mod device;
pub mod ip_pool;

use std::sync::Arc;

use anyhow::{Result, bail};
use tracing::{debug, info, warn};

use crate::{agent::net::device::NetOps, error::ProvisionError};

#[derive(Debug, Clone)]
pub struct NetAgentConfig {
    pub bridge_name: String,
    pub tap_prefix: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    RemoveStaleDevice,
    CreateTap,
    DisableIpv6,
    EnableProxyArp,
    AttachToBridge,
    LinkUp,
}

impl SetupStep {
    pub const ORDER: [SetupStep; 6] = [
        SetupStep::RemoveStaleDevice,
        SetupStep::CreateTap,
        SetupStep::DisableIpv6,
        SetupStep::EnableProxyArp,
        SetupStep::AttachToBridge,
        SetupStep::LinkUp,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SetupStep::RemoveStaleDevice => "remove-stale-device",
            SetupStep::CreateTap => "create-tap",
            SetupStep::DisableIpv6 => "disable-ipv6",
            SetupStep::EnableProxyArp => "enable-proxy-arp",
            SetupStep::AttachToBridge => "attach-to-bridge",
            SetupStep::LinkUp => "link-up",
        }
    }
}

pub struct NetAgent {
    pub config: NetAgentConfig,
    ops: Arc<dyn NetOps>,
}

impl NetAgent {
    pub async fn new(config: NetAgentConfig, ops: Arc<dyn NetOps>) -> Result<Self> {
        if !ops.device_exists(&config.bridge_name).await? {
            bail!("bridge {} not found", config.bridge_name);
        }

        Ok(Self { config, ops })
    }

    pub fn tap_name(&self, ordinal: u8) -> String {
        format!("{}{}", self.config.tap_prefix, ordinal)
    }

    async fn apply(&self, step: SetupStep, tap_name: &str) -> Result<()> {
        match step {
            SetupStep::RemoveStaleDevice => {
                if self.ops.delete_device(tap_name).await? {
                    info!("removed stale device {}", tap_name);
                }
                Ok(())
            }
            SetupStep::CreateTap => self.ops.create_tap(tap_name).await,
            SetupStep::DisableIpv6 => {
                self.ops
                    .set_sysctl(&format!("net.ipv6.conf.{}.disable_ipv6", tap_name), "1")
                    .await
            }
            SetupStep::EnableProxyArp => {
                self.ops
                    .set_sysctl(&format!("net.ipv4.conf.{}.proxy_arp", tap_name), "1")
                    .await
            }
            SetupStep::AttachToBridge => {
                self.ops
                    .attach_to_bridge(tap_name, &self.config.bridge_name)
                    .await
            }
            SetupStep::LinkUp => self.ops.set_up(tap_name).await,
        }
    }

    // deleting the tap also drops its sysctls, bridge membership and link state
    async fn undo(&self, step: SetupStep, tap_name: &str) -> Result<()> {
        match step {
            SetupStep::CreateTap => {
                self.ops.delete_device(tap_name).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Creates the tap device and plugs it into the bridge. Steps run in order and stop at the
    /// first failure, after undoing the completed ones. Safe to retry.
    pub async fn setup(&self, tap_name: &str) -> Result<(), ProvisionError> {
        info!("Configuring tap device {}", tap_name);

        let mut completed = Vec::with_capacity(SetupStep::ORDER.len());
        for step in SetupStep::ORDER {
            debug!("{}: {}", tap_name, step.name());

            if let Err(source) = self.apply(step, tap_name).await {
                warn!("{}: step {} failed: {:#}", tap_name, step.name(), source);

                for done in completed.into_iter().rev() {
                    if let Err(e) = self.undo(done, tap_name).await {
                        warn!("{}: undo of {} failed: {:#}", tap_name, done.name(), e);
                    }
                }

                return Err(ProvisionError::Network {
                    device: tap_name.to_string(),
                    step: step.name(),
                    source,
                });
            }

            completed.push(step);
        }

        Ok(())
    }

    pub async fn teardown(&self, tap_name: &str) {
        match self.ops.delete_device(tap_name).await {
            Ok(true) => info!("removed tap device {}", tap_name),
            Ok(false) => debug!("tap device {} already gone", tap_name),
            Err(e) => warn!("failed to remove tap device {}: {:#}", tap_name, e),
        }
    }

    /// Removes devices left behind by a previous run of the daemon.
    pub async fn sweep_stale_devices(&self) -> Result<usize> {
        let devices = self
            .ops
            .list_devices_with_prefix(&self.config.tap_prefix)
            .await?;

        let mut removed = 0;
        for device in devices {
            match self.ops.delete_device(&device).await {
                Ok(_) => removed += 1,
                Err(e) => warn!("failed to remove stale device {}: {:#}", device, e),
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::HashSet,
        sync::Mutex,
    };

    use async_trait::async_trait;

    use super::*;

    /// In-memory `NetOps` that records every call and can fail a chosen operation.
    #[derive(Default)]
    pub struct FakeNetOps {
        pub devices: Mutex<HashSet<String>>,
        pub calls: Mutex<Vec<String>>,
        pub fail_on: Mutex<Option<String>>,
    }

    impl FakeNetOps {
        pub fn with_bridge(bridge: &str) -> Self {
            let ops = Self::default();
            ops.devices.lock().unwrap().insert(bridge.to_string());
            ops
        }

        pub fn fail_on(&self, op: &str) {
            *self.fail_on.lock().unwrap() = Some(op.to_string());
        }

        pub fn has_device(&self, name: &str) -> bool {
            self.devices.lock().unwrap().contains(name)
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, op: &str, detail: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("{op} {detail}"));
            if self.fail_on.lock().unwrap().as_deref() == Some(op) {
                bail!("injected {op} failure");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl NetOps for FakeNetOps {
        async fn device_exists(&self, name: &str) -> Result<bool> {
            Ok(self.has_device(name))
        }

        async fn delete_device(&self, name: &str) -> Result<bool> {
            self.record("delete", name)?;
            Ok(self.devices.lock().unwrap().remove(name))
        }

        async fn create_tap(&self, name: &str) -> Result<()> {
            self.record("create", name)?;
            self.devices.lock().unwrap().insert(name.to_string());
            Ok(())
        }

        async fn set_sysctl(&self, key: &str, value: &str) -> Result<()> {
            self.record("sysctl", &format!("{key}={value}"))
        }

        async fn attach_to_bridge(&self, name: &str, bridge_name: &str) -> Result<()> {
            self.record("attach", &format!("{name}->{bridge_name}"))
        }

        async fn set_up(&self, name: &str) -> Result<()> {
            self.record("up", name)
        }

        async fn list_devices_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .devices
                .lock()
                .unwrap()
                .iter()
                .filter(|d| d.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    async fn create_test_agent(ops: Arc<FakeNetOps>) -> NetAgent {
        NetAgent::new(
            NetAgentConfig {
                bridge_name: "docker0".to_string(),
                tap_prefix: "fc-tap-".to_string(),
            },
            ops,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_missing_bridge() {
        let ops = Arc::new(FakeNetOps::default());
        let config = NetAgentConfig {
            bridge_name: "docker0".to_string(),
            tap_prefix: "fc-tap-".to_string(),
        };
        assert!(NetAgent::new(config, ops).await.is_err());
    }

    #[tokio::test]
    async fn test_setup_runs_steps_in_order() {
        let ops = Arc::new(FakeNetOps::with_bridge("docker0"));
        let agent = create_test_agent(ops.clone()).await;

        agent.setup("fc-tap-4").await.unwrap();

        assert_eq!(
            ops.calls(),
            vec![
                "delete fc-tap-4",
                "create fc-tap-4",
                "sysctl net.ipv6.conf.fc-tap-4.disable_ipv6=1",
                "sysctl net.ipv4.conf.fc-tap-4.proxy_arp=1",
                "attach fc-tap-4->docker0",
                "up fc-tap-4",
            ]
        );
        assert!(ops.has_device("fc-tap-4"));
    }

    #[tokio::test]
    async fn test_setup_failure_unwinds_and_names_step() {
        let ops = Arc::new(FakeNetOps::with_bridge("docker0"));
        ops.fail_on("attach");
        let agent = create_test_agent(ops.clone()).await;

        let err = agent.setup("fc-tap-5").await.unwrap_err();
        let ProvisionError::Network { step, device, .. } = err else {
            panic!("unexpected error: {err}");
        };

        assert_eq!(step, "attach-to-bridge");
        assert_eq!(device, "fc-tap-5");
        assert!(!ops.has_device("fc-tap-5"));
        assert_eq!(ops.calls().last().unwrap(), "delete fc-tap-5");
    }

    #[tokio::test]
    async fn test_setup_is_retryable_over_leftovers() {
        let ops = Arc::new(FakeNetOps::with_bridge("docker0"));
        ops.devices.lock().unwrap().insert("fc-tap-6".to_string());
        let agent = create_test_agent(ops.clone()).await;

        agent.setup("fc-tap-6").await.unwrap();
        agent.setup("fc-tap-6").await.unwrap();

        assert!(ops.has_device("fc-tap-6"));
    }

    #[tokio::test]
    async fn test_teardown_missing_device_is_not_fatal() {
        let ops = Arc::new(FakeNetOps::with_bridge("docker0"));
        let agent = create_test_agent(ops.clone()).await;

        agent.teardown("fc-tap-9").await;
        ops.fail_on("delete");
        agent.teardown("fc-tap-9").await;
    }

    #[tokio::test]
    async fn test_sweep_stale_devices() {
        let ops = Arc::new(FakeNetOps::with_bridge("docker0"));
        ops.devices.lock().unwrap().insert("fc-tap-7".to_string());
        ops.devices.lock().unwrap().insert("fc-tap-8".to_string());
        let agent = create_test_agent(ops.clone()).await;

        assert_eq!(agent.sweep_stale_devices().await.unwrap(), 2);
        assert!(ops.has_device("docker0"));
        assert!(!ops.has_device("fc-tap-7"));
    }
}
