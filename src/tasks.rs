//! Background task handles for long-running operations.
//!
//! Imports, exports and cross-site reports run on the runtime, not on the
//! request path. Each gets a cancellation token and a progress channel;
//! nothing a task does touches presentation state directly.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::AuditError;

// ---

/// Latest progress reported by a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    // ---
    pub step: usize,
    pub total: usize,
    pub message: String,
}

/// Handed to a task body to report progress and observe cancellation.
#[derive(Debug, Clone)]
pub struct TaskContext {
    // ---
    token: CancellationToken,
    progress: Arc<watch::Sender<Progress>>,
}

impl TaskContext {
    // ---
    pub fn report(&self, step: usize, total: usize, message: impl Into<String>) {
        // ---
        let message = message.into();
        debug!("Progress {}/{}: {}", step, total, message);
        self.progress.send_replace(Progress {
            step,
            total,
            message,
        });
    }

    #[cfg(test)]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Bail out with [`AuditError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<(), AuditError> {
        if self.token.is_cancelled() {
            Err(AuditError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Owner side of a spawned task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    // ---
    id: Uuid,
    name: String,
    token: CancellationToken,
    progress: watch::Receiver<Progress>,
    join: JoinHandle<Result<T, AuditError>>,
}

impl<T> TaskHandle<T> {
    // ---
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        info!("Cancelling task {} ({})", self.name, self.id);
        self.token.cancel();
    }

    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.progress.clone()
    }

    /// Cancel the task when the returned guard is dropped without being
    /// disarmed, e.g. when the waiting request goes away.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// Wait for the task to finish.
    ///
    /// A panicking body surfaces as [`AuditError::Aborted`].
    pub async fn join(self) -> Result<T, AuditError> {
        // ---
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(AuditError::Cancelled),
            Err(e) => Err(AuditError::Aborted(e.to_string())),
        }
    }
}

/// Spawn `body` on the runtime with its own cancellation token.
///
/// Cancelling the handle drops the body at its next await point.
pub fn spawn_task<T, F, Fut>(name: &str, body: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = Result<T, AuditError>> + Send + 'static,
{
    // ---
    let id = Uuid::new_v4();
    let token = CancellationToken::new();
    let (tx, rx) = watch::channel(Progress::default());
    let ctx = TaskContext {
        token: token.clone(),
        progress: Arc::new(tx),
    };

    let work = body(ctx);
    let guard = token.clone();
    let task_name = name.to_string();

    let join = tokio::spawn(async move {
        // ---
        debug!("Task {} ({}) started", task_name, id);
        let result = tokio::select! {
            _ = guard.cancelled() => Err(AuditError::Cancelled),
            result = work => result,
        };
        match &result {
            Ok(_) => info!("Task {} ({}) finished", task_name, id),
            Err(AuditError::Cancelled) => info!("Task {} ({}) cancelled", task_name, id),
            Err(e) => warn!("Task {} ({}) failed: {}", task_name, id, e),
        }
        result
    });

    TaskHandle {
        id,
        name: name.to_string(),
        token,
        progress: rx,
        join,
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_task_reports_progress_and_result() {
        // ---
        let handle = spawn_task("count", |ctx| async move {
            for i in 1..=3 {
                ctx.check()?;
                ctx.report(i, 3, format!("step {i}"));
            }
            Ok::<_, AuditError>(42)
        });
        let mut rx = handle.subscribe();

        let value = tokio_test::assert_ok!(handle.join().await);
        assert_eq!(value, 42);
        let last = rx.borrow_and_update().clone();
        assert_eq!(last.step, 3);
        assert_eq!(last.message, "step 3");
    }

    #[tokio::test]
    async fn test_cancel_stops_a_running_task() {
        // ---
        let handle = spawn_task("sleeper", |ctx| async move {
            while !ctx.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            ctx.check()
        });
        handle.cancel();
        assert!(matches!(handle.join().await, Err(AuditError::Cancelled)));
    }

    #[tokio::test]
    async fn test_dropped_guard_cancels_the_task() {
        // ---
        let handle = spawn_task("abandoned", |ctx| async move {
            while !ctx.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            ctx.check()
        });
        let guard = handle.cancel_on_drop();
        drop(guard);
        assert!(matches!(handle.join().await, Err(AuditError::Cancelled)));
    }

    #[tokio::test]
    async fn test_panicking_body_is_reported_as_aborted() {
        // ---
        let explode = true;
        let handle: TaskHandle<()> = spawn_task("boom", move |_ctx| async move {
            if explode {
                panic!("boom");
            }
            Ok(())
        });
        assert!(matches!(handle.join().await, Err(AuditError::Aborted(_))));
    }

    #[tokio::test]
    async fn test_errors_pass_through_unchanged() {
        // ---
        let handle: TaskHandle<()> = spawn_task("fails", |_ctx| async move {
            Err(AuditError::Config(crate::error::ConfigError::NoSiteSelected))
        });
        let err = tokio_test::assert_err!(handle.join().await);
        assert!(err.is_selection_error());
    }
}
