use crate::Supervisor;
use roadlens_common::{Error, Result, TaskItem, TaskParamMeta};
use roadlens_store::{OutputCatalog, TaskRegistry};
use std::{collections::BTreeMap, sync::Arc};

/// The uniform facade wrapped around each driver: parameter schema,
/// listing, start, stop and delete.
pub trait TaskService: Send + Sync {
    /// Driver label; also the `name` stored on every task it creates.
    fn label(&self) -> &'static str;

    /// Parameter schema for submissions.
    fn params(&self) -> &'static [TaskParamMeta];

    /// All tasks belonging to this driver.
    fn tasks(&self) -> Vec<TaskItem>;

    /// Validate the submission, persist a pending task and hand execution
    /// to the supervisor. Returns the created task.
    fn start(&self, params: BTreeMap<String, String>) -> Result<TaskItem>;

    /// Request cancellation of a task. Asynchronous: the cancel flag is
    /// set and the driver observes it at its next suspension point.
    fn stop(&self, id: &str) -> Result<()>;

    /// Remove a task and everything it produced. Outputs (and their
    /// files) go first, then the task record.
    fn delete(&self, id: &str) -> Result<()>;
}

/// Registry/catalog/supervisor wiring shared by every service.
pub(crate) struct ServiceCore {
    pub registry: Arc<dyn TaskRegistry>,
    pub outputs: Arc<dyn OutputCatalog>,
    pub supervisor: Arc<Supervisor>,
}

impl ServiceCore {
    pub fn tasks(&self, label: &str) -> Vec<TaskItem> {
        self.registry.get_by_name(label)
    }

    pub fn stop(&self, id: &str) -> Result<()> {
        self.supervisor.cancel(id)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let task = self.registry.get(id)?;
        if !task.state.is_terminal() {
            return Err(Error::Validation(format!(
                "task \"{id}\" is still running, stop it before deleting"
            )));
        }

        self.outputs.delete(id)?;
        self.registry.delete(id)?;
        self.supervisor.forget(id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use roadlens_common::{TaskOutput, TaskState, output_type};
    use roadlens_store::{JsonOutputCatalog, JsonTaskRegistry};

    struct Fixture {
        _dir: tempfile::TempDir,
        core: ServiceCore,
        outputs_dir: std::path::PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let outputs_dir = dir.path().join("outputs");
        std::fs::create_dir_all(&outputs_dir).unwrap();

        let registry: Arc<dyn TaskRegistry> =
            Arc::new(JsonTaskRegistry::open(&dir.path().join("tasks.json")));
        let outputs: Arc<dyn OutputCatalog> = Arc::new(JsonOutputCatalog::open(
            &dir.path().join("outputs.json"),
            &outputs_dir,
        ));
        let supervisor = Arc::new(Supervisor::new(registry.clone()));

        Fixture {
            _dir: dir,
            core: ServiceCore {
                registry,
                outputs,
                supervisor,
            },
            outputs_dir,
        }
    }

    fn finished_task(core: &ServiceCore) -> TaskItem {
        let task = core
            .registry
            .add(TaskItem::new("record", BTreeMap::new(), "submitted"))
            .unwrap();
        let _ = core
            .registry
            .update(&task.id, TaskState::Started, "working")
            .unwrap();
        core.registry
            .update(&task.id, TaskState::Finished, "done")
            .unwrap()
    }

    #[tokio::test]
    async fn test_delete_cascades_outputs_then_task() {
        let f = fixture();
        let task = finished_task(&f.core);

        let video = f.outputs_dir.join(format!("{}.mp4", task.id));
        std::fs::write(&video, b"video").unwrap();
        let _ = f
            .core
            .outputs
            .save(TaskOutput::new(
                &task.id,
                &format!("{}.mp4", task.id),
                output_type::VIDEO_MP4,
                "",
                BTreeMap::new(),
            ))
            .unwrap();

        f.core.delete(&task.id).unwrap();

        assert!(f.core.registry.get(&task.id).is_err());
        assert!(f.core.outputs.get_by_taskid(&task.id).is_empty());
        assert!(!video.exists());
    }

    #[tokio::test]
    async fn test_delete_refuses_running_task() {
        let f = fixture();
        let task = f
            .core
            .registry
            .add(TaskItem::new("record", BTreeMap::new(), "submitted"))
            .unwrap();

        assert!(matches!(
            f.core.delete(&task.id),
            Err(Error::Validation(_))
        ));
        assert!(f.core.registry.get(&task.id).is_ok());
    }

    #[tokio::test]
    async fn test_delete_unknown_task_is_not_found() {
        let f = fixture();
        assert!(matches!(f.core.delete("nope"), Err(Error::NotFound(_))));
    }
}
