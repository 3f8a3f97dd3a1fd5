use crate::json_file;
use roadlens_common::{Error, Result, TaskItem, TaskState};
use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::{debug, info};

/// Authoritative store of task records.
///
/// Reads return snapshot copies; mutations are serialised under one
/// registry-wide guard and are durable before they return.
pub trait TaskRegistry: Send + Sync {
    fn add(&self, task: TaskItem) -> Result<TaskItem>;
    fn get(&self, id: &str) -> Result<TaskItem>;
    fn get_by_name(&self, name: &str) -> Vec<TaskItem>;

    /// Atomic state transition. Rejects anything outside the permitted
    /// transition graph, including every transition out of a terminal state.
    fn update(&self, id: &str, state: TaskState, reason: &str) -> Result<TaskItem>;

    /// Update the in-memory progress of a running task. Progress never
    /// decreases; the value reaches disk with the next durable mutation.
    fn set_progress(&self, id: &str, progress: f64) -> Result<()>;

    fn delete(&self, id: &str) -> Result<()>;

    /// Boot-time sweep: every task left in a non-terminal state from a
    /// prior run is rewritten to `Failed`. Returns the number swept.
    fn recover(&self) -> Result<usize>;
}

pub struct JsonTaskRegistry {
    path: PathBuf,
    tasks: Mutex<Vec<TaskItem>>,
}

impl JsonTaskRegistry {
    pub fn open(path: &Path) -> Self {
        let tasks: Vec<TaskItem> = json_file::load_or_default(path);
        debug!("Loaded {} task records from {}", tasks.len(), path.display());
        Self {
            path: path.to_owned(),
            tasks: Mutex::new(tasks),
        }
    }
}

impl TaskRegistry for JsonTaskRegistry {
    #[tracing::instrument(skip_all, fields(id = %task.id))]
    fn add(&self, task: TaskItem) -> Result<TaskItem> {
        let mut tasks = self.tasks.lock().expect("registry lock should not be poisoned");

        if tasks.iter().any(|t| t.id == task.id) {
            return Err(Error::Validation(format!(
                "task id \"{}\" already exists",
                task.id
            )));
        }

        tasks.push(task.clone());
        json_file::save_atomic(&self.path, &*tasks)?;
        Ok(task)
    }

    fn get(&self, id: &str) -> Result<TaskItem> {
        let tasks = self.tasks.lock().expect("registry lock should not be poisoned");
        tasks
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task \"{id}\"")))
    }

    fn get_by_name(&self, name: &str) -> Vec<TaskItem> {
        let tasks = self.tasks.lock().expect("registry lock should not be poisoned");
        tasks.iter().filter(|t| t.name == name).cloned().collect()
    }

    #[tracing::instrument(skip(self))]
    fn update(&self, id: &str, state: TaskState, reason: &str) -> Result<TaskItem> {
        let mut tasks = self.tasks.lock().expect("registry lock should not be poisoned");

        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::NotFound(format!("task \"{id}\"")))?;

        if !task.state.can_transition_to(state) {
            return Err(Error::Validation(format!(
                "illegal task state transition {:?} -> {:?}",
                task.state, state
            )));
        }

        task.state = state;
        task.reason = reason.to_string();
        let snapshot = task.clone();

        json_file::save_atomic(&self.path, &*tasks)?;
        Ok(snapshot)
    }

    fn set_progress(&self, id: &str, progress: f64) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("registry lock should not be poisoned");

        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::NotFound(format!("task \"{id}\"")))?;

        task.progress = task.progress.max(progress.clamp(0.0, 1.0));
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn delete(&self, id: &str) -> Result<()> {
        let mut tasks = self.tasks.lock().expect("registry lock should not be poisoned");
        tasks.retain(|t| t.id != id);
        json_file::save_atomic(&self.path, &*tasks)
    }

    #[tracing::instrument(skip_all)]
    fn recover(&self) -> Result<usize> {
        let mut tasks = self.tasks.lock().expect("registry lock should not be poisoned");

        let mut swept = 0;
        for task in tasks.iter_mut() {
            if matches!(task.state, TaskState::Pending | TaskState::Started) {
                task.state = TaskState::Failed;
                task.reason = "task was interrupted by an unexpected shutdown".to_string();
                swept += 1;
            }
        }

        if swept > 0 {
            info!("Recovery sweep marked {swept} interrupted task(s) as failed");
            json_file::save_atomic(&self.path, &*tasks)?;
        }
        Ok(swept)
    }
}
