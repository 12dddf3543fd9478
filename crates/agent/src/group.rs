use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use vessel_errors::{VesselError, VesselResult};

/// Tasks sharing one cancellation token. The first task to fail cancels
/// the rest, and [`TaskGroup::wait`] reports that first error.
pub struct TaskGroup {
    token: CancellationToken,
    tasks: JoinSet<VesselResult<()>>,
}

impl TaskGroup {
    /// New group cancelled together with `parent`.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = VesselResult<()>> + Send + 'static,
    {
        let token = self.token.clone();
        self.tasks.spawn(async move {
            let result = task.await;
            match &result {
                Ok(()) => debug!("stage {} finished", name),
                Err(e) => {
                    error!("stage {} failed: {}", name, e);
                    token.cancel();
                }
            }
            result
        });
    }

    /// Wait for every task; returns the first error seen.
    pub async fn wait(mut self) -> VesselResult<()> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined
                .map_err(|e| VesselError::Internal(format!("任务异常退出: {e}")))
                .and_then(|result| result);
            if let Err(e) = result {
                self.token.cancel();
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Token for one last operation after the caller's own token may already be
/// cancelled. It never inherits a parent's cancellation and cancels itself
/// after `timeout`.
pub fn detached_token(timeout: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_error_cancels_siblings() {
        let root = CancellationToken::new();
        let mut group = TaskGroup::new(&root);
        let sibling = group.token();
        group.spawn("waits", async move {
            sibling.cancelled().await;
            Ok(())
        });
        group.spawn("fails", async { Err(VesselError::transport("boom")) });

        let err = group.wait().await.unwrap_err();
        assert!(matches!(err, VesselError::Transport(_)));
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_group() {
        let root = CancellationToken::new();
        let mut group = TaskGroup::new(&root);
        let token = group.token();
        group.spawn("waits", async move {
            token.cancelled().await;
            Ok(())
        });
        root.cancel();
        group.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_detached_token_outlives_cancelled_parent() {
        let parent = CancellationToken::new();
        parent.cancel();
        let token = detached_token(Duration::from_millis(20));
        assert!(!token.is_cancelled());
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }
}
