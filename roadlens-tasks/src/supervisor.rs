use roadlens_common::{Error, Result, TaskState};
use roadlens_store::TaskRegistry;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

pub(crate) const METRIC_CONCLUDED_TASKS: &str = "roadlens_concluded_tasks";

/// Owns one concurrent worker and one cancel flag per submitted task.
///
/// Drivers run as plain futures returning `Ok(final reason)` on success;
/// the supervisor performs the single terminal switch into
/// `Finished`/`Canceled`/`Failed` so no driver error ever escapes a
/// worker.
pub struct Supervisor {
    registry: Arc<dyn TaskRegistry>,
    cancels: Mutex<HashMap<String, CancellationToken>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(registry: Arc<dyn TaskRegistry>) -> Self {
        Self {
            registry,
            cancels: Mutex::new(HashMap::new()),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Create the cancel flag for a new task. Must happen before the
    /// worker is spawned so a stop request can never miss the task.
    pub fn register(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let _ = self
            .cancels
            .lock()
            .expect("supervisor lock should not be poisoned")
            .insert(task_id.to_string(), token.clone());
        token
    }

    /// Run a driver future in its own worker and conclude the task from
    /// its result.
    pub fn spawn<F>(self: &Arc<Self>, task_id: String, work: F)
    where
        F: Future<Output = Result<String>> + Send + 'static,
    {
        let supervisor = self.clone();
        let _ = self.tracker.spawn(async move {
            let result = work.await;
            supervisor.conclude(&task_id, result);
        });
    }

    /// Run a long-lived background worker (not tied to one task) under
    /// the same tracker so shutdown waits for it.
    pub fn spawn_worker<F>(&self, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let _ = self.tracker.spawn(work);
    }

    /// Terminal switch at the worker boundary.
    pub fn conclude(&self, task_id: &str, result: Result<String>) {
        let (state, reason) = match result {
            Ok(reason) => {
                if let Err(err) = self.registry.set_progress(task_id, 1.0) {
                    error!("Failed to set final progress of task {task_id}: {err}");
                }
                (TaskState::Finished, reason)
            }
            Err(Error::Canceled(reason)) => (TaskState::Canceled, reason),
            Err(err) => (TaskState::Failed, err.to_string()),
        };

        let label = match state {
            TaskState::Finished => "finished",
            TaskState::Canceled => "canceled",
            _ => "failed",
        };
        metrics::counter!(METRIC_CONCLUDED_TASKS, "result" => label).increment(1);
        info!("Task {task_id} concluded as {label}: {reason}");

        if let Err(err) = self.registry.update(task_id, state, &reason) {
            error!("Failed to record terminal state of task {task_id}: {err}");
        }
    }

    /// Request cancellation. Asynchronous and idempotent: the flag is set
    /// and delivery happens at the task's next suspension point.
    pub fn cancel(&self, task_id: &str) -> Result<()> {
        let cancels = self
            .cancels
            .lock()
            .expect("supervisor lock should not be poisoned");
        match cancels.get(task_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(Error::NotFound(format!("task \"{task_id}\""))),
        }
    }

    /// Drop the cancel flag of a deleted task.
    pub fn forget(&self, task_id: &str) {
        let _ = self
            .cancels
            .lock()
            .expect("supervisor lock should not be poisoned")
            .remove(task_id);
    }

    /// Token observed by long-lived background workers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel everything and wait for all workers to drain.
    pub async fn shutdown(&self) {
        info!("Shutting down task workers");
        self.shutdown.cancel();
        {
            let cancels = self
                .cancels
                .lock()
                .expect("supervisor lock should not be poisoned");
            for token in cancels.values() {
                token.cancel();
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use roadlens_common::TaskItem;
    use roadlens_store::JsonTaskRegistry;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn fixture() -> (tempfile::TempDir, Arc<dyn TaskRegistry>, Arc<Supervisor>) {
        let dir = tempfile::tempdir().unwrap();
        let registry: Arc<dyn TaskRegistry> =
            Arc::new(JsonTaskRegistry::open(&dir.path().join("tasks.json")));
        let supervisor = Arc::new(Supervisor::new(registry.clone()));
        (dir, registry, supervisor)
    }

    fn submit(registry: &Arc<dyn TaskRegistry>) -> TaskItem {
        registry
            .add(TaskItem::new("record", BTreeMap::new(), "submitted"))
            .unwrap()
    }

    async fn wait_for_state(
        registry: &Arc<dyn TaskRegistry>,
        id: &str,
        state: TaskState,
    ) -> TaskItem {
        for _ in 0..100 {
            let task = registry.get(id).unwrap();
            if task.state == state {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {id} never reached {state:?}");
    }

    #[tokio::test]
    async fn test_successful_worker_finishes_with_full_progress() {
        let (_dir, registry, supervisor) = fixture();
        let task = submit(&registry);
        let _ = registry
            .update(&task.id, TaskState::Started, "working")
            .unwrap();

        let _token = supervisor.register(&task.id);
        supervisor.spawn(task.id.clone(), async { Ok("all done".to_string()) });

        let task = wait_for_state(&registry, &task.id, TaskState::Finished).await;
        assert_eq!(task.reason, "all done");
        assert_eq!(task.progress, 1.0);
    }

    #[tokio::test]
    async fn test_cancel_sentinel_concludes_canceled() {
        let (_dir, registry, supervisor) = fixture();
        let task = submit(&registry);

        let token = supervisor.register(&task.id);
        supervisor.cancel(&task.id).unwrap();
        assert!(token.is_cancelled());

        supervisor.spawn(task.id.clone(), async move {
            if token.is_cancelled() {
                return Err(Error::Canceled("stopped by request".to_string()));
            }
            Ok("never".to_string())
        });

        let task = wait_for_state(&registry, &task.id, TaskState::Canceled).await;
        assert_eq!(task.reason, "stopped by request");
    }

    #[tokio::test]
    async fn test_driver_error_concludes_failed() {
        let (_dir, registry, supervisor) = fixture();
        let task = submit(&registry);

        let _token = supervisor.register(&task.id);
        supervisor.spawn(task.id.clone(), async {
            Err(Error::External("ffmpeg exploded".to_string()))
        });

        let task = wait_for_state(&registry, &task.id, TaskState::Failed).await;
        assert!(task.reason.contains("ffmpeg exploded"));
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_not_found() {
        let (_dir, _registry, supervisor) = fixture();
        assert!(matches!(
            supervisor.cancel("nope"),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (_dir, registry, supervisor) = fixture();
        let task = submit(&registry);
        let _ = supervisor.register(&task.id);

        supervisor.cancel(&task.id).unwrap();
        supervisor.cancel(&task.id).unwrap();
    }

    #[tokio::test]
    async fn test_completion_beats_late_cancel() {
        // A task that finishes before observing the flag stays finished;
        // the late flag has no effect.
        let (_dir, registry, supervisor) = fixture();
        let task = submit(&registry);
        let _ = registry
            .update(&task.id, TaskState::Started, "working")
            .unwrap();

        let _token = supervisor.register(&task.id);
        supervisor.spawn(task.id.clone(), async { Ok("done".to_string()) });

        let _ = wait_for_state(&registry, &task.id, TaskState::Finished).await;
        supervisor.cancel(&task.id).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            registry.get(&task.id).unwrap().state,
            TaskState::Finished
        );
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_workers() {
        let (_dir, registry, supervisor) = fixture();
        let task = submit(&registry);
        let _ = registry
            .update(&task.id, TaskState::Started, "working")
            .unwrap();

        let token = supervisor.register(&task.id);
        supervisor.spawn(task.id.clone(), async move {
            token.cancelled().await;
            Err(Error::Canceled("shutting down".to_string()))
        });

        supervisor.shutdown().await;
        assert_eq!(
            registry.get(&task.id).unwrap().state,
            TaskState::Canceled
        );
    }
}
