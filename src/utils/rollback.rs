use std::future::Future;

use anyhow::Result;
use futures_util::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::{debug, warn};

type UndoFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Stack of undo actions for a multi-step operation. Actions run in reverse push order on
/// `unwind`; `commit` forgets them once the operation has succeeded.
#[derive(Default)]
pub struct Rollback {
    actions: Vec<(&'static str, UndoFn)>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&mut self, name: &'static str, undo: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.actions.push((name, Box::new(move || Box::pin(undo()))));
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn commit(mut self) {
        self.actions.clear();
    }

    pub async fn unwind(mut self) {
        run_undo(std::mem::take(&mut self.actions)).await;
    }
}

async fn run_undo(mut actions: Vec<(&'static str, UndoFn)>) {
    while let Some((name, undo)) = actions.pop() {
        debug!("rolling back {}", name);
        if let Err(e) = undo().await {
            warn!("rollback of {} failed: {:#}", name, e);
        }
    }
}

// A rollback dropped mid-operation (cancelled caller, panic) still unwinds, on a detached task.
impl Drop for Rollback {
    fn drop(&mut self) {
        if self.actions.is_empty() {
            return;
        }

        let actions = std::mem::take(&mut self.actions);
        match Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "rollback dropped with {} pending undo actions, unwinding in background",
                    actions.len()
                );
                handle.spawn(run_undo(actions));
            }
            Err(_) => warn!(
                "rollback dropped outside a runtime, {} undo actions lost",
                actions.len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use anyhow::bail;

    use super::*;

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_and_survives_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rollback = Rollback::new();

        for name in ["first", "second", "third"] {
            let log = log.clone();
            rollback.push(name, move || async move {
                log.lock().unwrap().push(name);
                if name == "second" {
                    bail!("boom");
                }
                Ok(())
            });
        }

        assert_eq!(rollback.len(), 3);
        rollback.unwind().await;

        assert_eq!(*log.lock().unwrap(), vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_commit_discards_actions() {
        let log = Arc::new(Mutex::new(Vec::<&str>::new()));
        let mut rollback = Rollback::new();

        let inner = log.clone();
        rollback.push("never", move || async move {
            inner.lock().unwrap().push("never");
            Ok(())
        });
        rollback.commit();

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_rollback_unwinds_in_background() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut rollback = Rollback::new();

        for name in ["first", "second"] {
            let log = log.clone();
            rollback.push(name, move || async move {
                log.lock().unwrap().push(name);
                Ok(())
            });
        }
        drop(rollback);

        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while log.lock().unwrap().len() < 2 {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
    }
}
