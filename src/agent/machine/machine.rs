use std::{
    os::unix::process::ExitStatusExt,
    path::Path,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use serde_json::Value;
use tokio::{
    process::{Child, Command},
    sync::watch,
    time::{Instant, sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    agent::machine::{
        Hypervisor, Machine, MachineAgentConfig, MachineExit, MachineRef, MachineState, StopMode,
        api::ApiClient,
        config::{ActionType, FirecrackerConfig, InstanceAction, VmConfig},
        metadata,
    },
    error::{MetadataError, SupervisorError},
};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

async fn remove_socket(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("removed socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove socket {}: {}", path.display(), e),
    }
}

/// Launches one Firecracker process per VM and drives it through its API socket.
pub struct FirecrackerHypervisor {
    config: MachineAgentConfig,
}

impl FirecrackerHypervisor {
    pub fn new(config: MachineAgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Hypervisor for FirecrackerHypervisor {
    async fn start(
        &self,
        config: &VmConfig,
        token: CancellationToken,
    ) -> Result<MachineRef, SupervisorError> {
        let requests = FirecrackerConfig::from(config)
            .requests()
            .map_err(|e| SupervisorError::Configure {
                resource: "config".to_string(),
                source: e.into(),
            })?;

        remove_socket(&config.socket_path).await;
        if let Some(dir) = config.socket_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(SupervisorError::Spawn)?;
        }

        let child = Command::new(&self.config.firecracker_path)
            .arg("--api-sock")
            .arg(&config.socket_path)
            .arg("--id")
            .arg(&config.id)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(SupervisorError::Spawn)?;

        let machine = Arc::new(FirecrackerMachine::new(
            config.id.clone(),
            child.id(),
            ApiClient::new(&config.socket_path, token.clone()),
            self.config.shutdown_timeout,
        ));

        machine.set_state(MachineState::Starting);
        FirecrackerMachine::spawn_exit_waiter(machine.clone(), child, token);

        if let Err(e) = machine.configure(requests, self.config.start_timeout).await {
            machine.abort_start(&e).await;
            return Err(e);
        }

        machine.set_state(MachineState::Running);
        info!("machine {} running (pid {:?})", config.id, machine.pid);

        Ok(machine)
    }
}

pub struct FirecrackerMachine {
    id: String,
    pid: Option<u32>,
    client: ApiClient,
    state: watch::Sender<MachineState>,
    exit: watch::Sender<Option<MachineExit>>,
    stop_requested: AtomicBool,
    shutdown_timeout: Duration,
}

impl FirecrackerMachine {
    fn new(id: String, pid: Option<u32>, client: ApiClient, shutdown_timeout: Duration) -> Self {
        let (state, _) = watch::channel(MachineState::Configuring);
        let (exit, _) = watch::channel(None);

        Self {
            id,
            pid,
            client,
            state,
            exit,
            stop_requested: AtomicBool::new(false),
            shutdown_timeout,
        }
    }

    fn set_state(&self, new_state: MachineState) {
        self.state.send_if_modified(|state| {
            if state.is_final() || *state == new_state {
                return false;
            }

            debug!("machine {} state {:?} -> {:?}", self.id, state, new_state);
            *state = new_state;
            true
        });
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    /// Owns the child until it exits. Cancelling `token` releases the waiter without touching
    /// the process.
    fn spawn_exit_waiter(machine: Arc<Self>, mut child: Child, token: CancellationToken) {
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    debug!("exit waiter for machine {} released", machine.id);
                    return;
                }
            };

            let requested = machine.stop_requested.load(Ordering::SeqCst);
            let exit = match status {
                Ok(status) => MachineExit {
                    requested,
                    code: status.code(),
                    signal: status.signal(),
                },
                Err(e) => {
                    warn!("failed to wait for machine {}: {}", machine.id, e);
                    MachineExit {
                        requested,
                        ..Default::default()
                    }
                }
            };

            if requested {
                info!("machine {} exited ({:?})", machine.id, exit);
            } else {
                warn!("machine {} exited unexpectedly ({:?})", machine.id, exit);
            }

            // waiters must not depend on filesystem cleanup
            machine.set_state(MachineState::Terminated);
            machine.exit.send_replace(Some(exit));
            remove_socket(machine.client.socket_path()).await;
        });
    }

    async fn wait_for_socket(&self, start_timeout: Duration) -> Result<(), SupervisorError> {
        let deadline = Instant::now() + start_timeout;

        loop {
            if self.has_exited() {
                return Err(SupervisorError::ExitedDuringStartup);
            }

            if self.client.is_ready().await {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(SupervisorError::SocketTimeout(
                    self.client.socket_path().to_path_buf(),
                ));
            }

            sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    async fn configure(
        &self,
        requests: Vec<(String, Value)>,
        start_timeout: Duration,
    ) -> Result<(), SupervisorError> {
        self.wait_for_socket(start_timeout).await?;

        for (path, body) in requests {
            self.client
                .put(&path, &body)
                .await
                .map_err(|source| SupervisorError::Configure {
                    resource: path.clone(),
                    source,
                })?;
        }

        self.client
            .put("/actions", &InstanceAction::new(ActionType::InstanceStart))
            .await
            .map_err(|source| SupervisorError::Configure {
                resource: "/actions".to_string(),
                source,
            })
    }

    async fn abort_start(&self, error: &SupervisorError) {
        warn!("machine {} failed to start: {}", self.id, error);

        self.stop_requested.store(true, Ordering::SeqCst);
        self.set_state(MachineState::Failed(error.to_string()));

        if let Err(e) = self.kill() {
            warn!("failed to kill machine {}: {:#}", self.id, e);
        }

        if timeout(self.shutdown_timeout, self.wait()).await.is_err() {
            warn!("machine {} did not exit after a failed start", self.id);
        }

        remove_socket(self.client.socket_path()).await;
    }

    fn kill(&self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }

        let Some(pid) = self.pid else {
            bail!("machine {} has no pid", self.id);
        };

        // the exit waiter reaps the child, so the pid is ours until the exit is published
        match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Machine for FirecrackerMachine {
    fn state(&self) -> MachineState {
        self.state.borrow().clone()
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait(&self) -> MachineExit {
        let mut rx = self.exit.subscribe();
        match rx.wait_for(|exit| exit.is_some()).await {
            Ok(exit) => exit.clone().unwrap_or_default(),
            Err(_) => MachineExit::default(),
        }
    }

    async fn stop(&self, mode: StopMode) -> Result<(), SupervisorError> {
        self.stop_requested.store(true, Ordering::SeqCst);
        if self.has_exited() {
            return Ok(());
        }

        self.set_state(MachineState::Stopping);

        if mode == StopMode::Graceful {
            let action = InstanceAction::new(ActionType::SendCtrlAltDel);
            match self.client.put("/actions", &action).await {
                Ok(()) => {
                    if timeout(self.shutdown_timeout, self.wait()).await.is_ok() {
                        return Ok(());
                    }
                    warn!(
                        "machine {} did not shut down within {:?}, killing it",
                        self.id, self.shutdown_timeout
                    );
                }
                Err(e) => warn!(
                    "graceful shutdown of machine {} failed, killing it: {:#}",
                    self.id, e
                ),
            }
        }

        self.kill().map_err(SupervisorError::Stop)?;

        timeout(self.shutdown_timeout, self.wait())
            .await
            .map_err(|_| SupervisorError::Stop(anyhow!("machine {} did not exit", self.id)))?;

        Ok(())
    }

    async fn put_metadata(&self, payload: &Value) -> Result<(), MetadataError> {
        metadata::push(&self.client, payload).await
    }
}
