use std::sync::Arc;

use anyhow::Result;
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::VmController;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// SIGINT / SIGTERM: stop every VM gracefully, then shut the daemon down. A second signal
    /// while VMs are still stopping kills the rest.
    GracefulShutdown,
    /// SIGQUIT: kill every VM, keep serving.
    ForceStop,
}

impl SignalAction {
    /// Runs the action. Returns true when the daemon should stop handling signals and exit.
    pub async fn apply(self, controller: &VmController, shutdown: &CancellationToken) -> bool {
        match self {
            SignalAction::GracefulShutdown => {
                controller.shutdown_all_graceful().await;
                shutdown.cancel();
                true
            }
            SignalAction::ForceStop => {
                controller.stop_all_forced().await;
                false
            }
        }
    }
}

pub fn spawn_signal_handler(
    controller: Arc<VmController>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let (tx, rx) = mpsc::channel(8);
    let listener_shutdown = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let action = tokio::select! {
                _ = interrupt.recv() => {
                    info!("received SIGINT, shutting down");
                    SignalAction::GracefulShutdown
                }
                _ = terminate.recv() => {
                    info!("received SIGTERM, shutting down");
                    SignalAction::GracefulShutdown
                }
                _ = quit.recv() => {
                    warn!("received SIGQUIT, force stopping all vms");
                    SignalAction::ForceStop
                }
                _ = listener_shutdown.cancelled() => return,
            };

            if tx.send(action).await.is_err() {
                return;
            }
        }
    });

    Ok(tokio::spawn(handle_signals(controller, shutdown, rx)))
}

async fn handle_signals(
    controller: Arc<VmController>,
    shutdown: CancellationToken,
    mut actions: mpsc::Receiver<SignalAction>,
) {
    loop {
        let action = tokio::select! {
            action = actions.recv() => match action {
                Some(action) => action,
                None => return,
            },
            _ = shutdown.cancelled() => return,
        };

        if action == SignalAction::GracefulShutdown {
            drain(&controller, &shutdown, &mut actions).await;
            return;
        }

        action.apply(&controller, &shutdown).await;
    }
}

/// Graceful shutdown that any further signal escalates to a forced stop.
async fn drain(
    controller: &VmController,
    shutdown: &CancellationToken,
    actions: &mut mpsc::Receiver<SignalAction>,
) {
    let graceful = SignalAction::GracefulShutdown.apply(controller, shutdown);
    tokio::pin!(graceful);

    tokio::select! {
        _ = &mut graceful => return,
        action = actions.recv() => {
            if let Some(action) = action {
                warn!("received {:?} while draining, force stopping all vms", action);
                controller.escalate_stops();
            }
        }
    }

    graceful.await;
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use tokio::time::{sleep, timeout};

    use super::*;
    use crate::{agent::machine::StopMode, controller::tests::TestEnv};

    #[tokio::test]
    async fn test_graceful_shutdown_action() {
        let env = TestEnv::new().await;
        let created = env.controller.create(env.request()).await.unwrap();
        let shutdown = CancellationToken::new();

        let done = SignalAction::GracefulShutdown
            .apply(&env.controller, &shutdown)
            .await;

        assert!(done);
        assert!(shutdown.is_cancelled());
        assert!(env.controller.registry().is_empty());

        let machine = env.hypervisor.machine(&created.id);
        assert_eq!(*machine.stops.lock().unwrap(), vec![StopMode::Graceful]);
    }

    #[tokio::test]
    async fn test_force_stop_action_keeps_serving() {
        let env = TestEnv::new().await;
        let created = env.controller.create(env.request()).await.unwrap();
        let shutdown = CancellationToken::new();

        let done = SignalAction::ForceStop
            .apply(&env.controller, &shutdown)
            .await;

        assert!(!done);
        assert!(!shutdown.is_cancelled());
        assert!(env.controller.registry().is_empty());

        let machine = env.hypervisor.machine(&created.id);
        assert_eq!(*machine.stops.lock().unwrap(), vec![StopMode::Forced]);

        // still accepting new work
        assert!(env.controller.create(env.request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_second_signal_escalates_graceful_shutdown() {
        let env = TestEnv::new().await;
        env.hypervisor.ignore_graceful.store(true, Ordering::SeqCst);
        let created = env.controller.create(env.request()).await.unwrap();
        let shutdown = CancellationToken::new();

        let (tx, rx) = mpsc::channel(8);
        let handler = tokio::spawn(handle_signals(env.controller.clone(), shutdown.clone(), rx));

        tx.send(SignalAction::GracefulShutdown).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        // the guest ignores the graceful stop, so the drain hangs
        assert!(!handler.is_finished());
        assert!(!shutdown.is_cancelled());
        assert_eq!(env.controller.registry().len(), 1);

        tx.send(SignalAction::GracefulShutdown).await.unwrap();
        timeout(Duration::from_secs(5), handler)
            .await
            .unwrap()
            .unwrap();

        assert!(shutdown.is_cancelled());
        assert!(env.controller.registry().is_empty());

        let machine = env.hypervisor.machine(&created.id);
        assert_eq!(
            *machine.stops.lock().unwrap(),
            vec![StopMode::Graceful, StopMode::Forced]
        );
    }

    #[tokio::test]
    async fn test_force_stop_signal_keeps_handler_running() {
        let env = TestEnv::new().await;
        env.controller.create(env.request()).await.unwrap();
        let shutdown = CancellationToken::new();

        let (tx, rx) = mpsc::channel(8);
        let handler = tokio::spawn(handle_signals(env.controller.clone(), shutdown.clone(), rx));

        tx.send(SignalAction::ForceStop).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while !env.controller.registry().is_empty() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!handler.is_finished());

        // graceful stops stay graceful after a plain force stop
        let created = env.controller.create(env.request()).await.unwrap();
        tx.send(SignalAction::GracefulShutdown).await.unwrap();
        timeout(Duration::from_secs(5), handler)
            .await
            .unwrap()
            .unwrap();

        assert!(shutdown.is_cancelled());
        let machine = env.hypervisor.machine(&created.id);
        assert_eq!(*machine.stops.lock().unwrap(), vec![StopMode::Graceful]);
    }
}
