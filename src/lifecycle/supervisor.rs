//! Supervised background tasks.
//!
//! # Responsibilities
//! - Own one spawned task together with its private shutdown signal
//! - Stop it with a bounded join, aborting on timeout
//!
//! Every periodic loop in the balancer (autoscaler evaluation, rollout
//! steppers, client-pool health checks) runs inside a `BackgroundTask`.

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::lifecycle::shutdown::Shutdown;

/// How a task ended when asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own after the signal.
    Joined,
    /// Did not exit within the timeout and was aborted.
    Aborted,
    /// Panicked or was cancelled before the join.
    Failed,
}

/// A spawned task that listens for its own shutdown signal.
#[derive(Debug)]
pub struct BackgroundTask {
    name: String,
    shutdown: Shutdown,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `body` with a receiver that fires when the task is stopped.
    pub fn spawn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let shutdown = Shutdown::new();
        let rx = shutdown.subscribe();
        let handle = tokio::spawn(body(rx));
        tracing::debug!(task = %name, "Background task started");
        Self {
            name,
            shutdown,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task and cancel it without waiting.
    pub fn abort(self) {
        self.shutdown.trigger();
        self.handle.abort();
    }

    /// Signal the task and wait up to `timeout` for it to exit.
    pub async fn stop(self, timeout: Duration) -> StopOutcome {
        self.shutdown.trigger();
        let mut handle = self.handle;

        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => {
                tracing::debug!(task = %self.name, "Background task stopped");
                StopOutcome::Joined
            }
            Ok(Err(e)) => {
                tracing::error!(task = %self.name, error = %e, "Background task failed");
                StopOutcome::Failed
            }
            Err(_) => {
                tracing::warn!(task = %self.name, ?timeout, "Background task did not stop in time, aborting");
                handle.abort();
                StopOutcome::Aborted
            }
        }
    }
}

/// Stop several tasks concurrently, sharing one deadline.
pub async fn stop_all(tasks: Vec<BackgroundTask>, timeout: Duration) -> Vec<(String, StopOutcome)> {
    let mut joins = tokio::task::JoinSet::new();
    for task in tasks {
        joins.spawn(async move {
            let name = task.name().to_string();
            (name, task.stop(timeout).await)
        });
    }

    let mut outcomes = Vec::new();
    while let Some(res) = joins.join_next().await {
        if let Ok(outcome) = res {
            outcomes.push(outcome);
        }
    }
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));
    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cooperative_task_joins() {
        let task = BackgroundTask::spawn("ticker", |mut shutdown| async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(5));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => break,
                }
            }
        });

        assert!(!task.is_finished());
        assert_eq!(task.stop(Duration::from_secs(1)).await, StopOutcome::Joined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_task_is_aborted() {
        let task = BackgroundTask::spawn("stuck", |_shutdown| async move {
            std::future::pending::<()>().await;
        });

        assert_eq!(task.stop(Duration::from_millis(50)).await, StopOutcome::Aborted);
    }

    #[tokio::test]
    async fn test_stop_all_reports_each_task() {
        let tasks = vec![
            BackgroundTask::spawn("b", |mut rx| async move {
                let _ = rx.recv().await;
            }),
            BackgroundTask::spawn("a", |mut rx| async move {
                let _ = rx.recv().await;
            }),
        ];

        let outcomes = stop_all(tasks, Duration::from_secs(1)).await;
        assert_eq!(
            outcomes,
            vec![
                ("a".to_string(), StopOutcome::Joined),
                ("b".to_string(), StopOutcome::Joined)
            ]
        );
    }
}
