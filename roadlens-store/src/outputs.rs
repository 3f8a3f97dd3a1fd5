use crate::json_file;
use roadlens_common::{Error, Result, TaskOutput};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::{debug, warn};

/// Catalog of named artifacts produced by tasks. An entry in the catalog
/// implies the backing file exists under the outputs directory.
pub trait OutputCatalog: Send + Sync {
    fn save(&self, output: TaskOutput) -> Result<TaskOutput>;
    fn get_all(&self) -> Vec<TaskOutput>;
    fn get_by_name(&self, name: &str) -> Result<TaskOutput>;

    /// Outputs of one task, in insertion order.
    fn get_by_taskid(&self, taskid: &str) -> Vec<TaskOutput>;

    /// Remove every output of a task and delete the backing files.
    fn delete(&self, taskid: &str) -> Result<()>;

    /// Directory that artifact files are written to.
    fn outputs_dir(&self) -> &Path;
}

pub struct JsonOutputCatalog {
    path: PathBuf,
    outputs_dir: PathBuf,
    outputs: Mutex<Vec<TaskOutput>>,
}

impl JsonOutputCatalog {
    pub fn open(path: &Path, outputs_dir: &Path) -> Self {
        let outputs: Vec<TaskOutput> = json_file::load_or_default(path);
        debug!(
            "Loaded {} output records from {}",
            outputs.len(),
            path.display()
        );
        Self {
            path: path.to_owned(),
            outputs_dir: outputs_dir.to_owned(),
            outputs: Mutex::new(outputs),
        }
    }
}

impl OutputCatalog for JsonOutputCatalog {
    #[tracing::instrument(skip_all, fields(name = %output.name))]
    fn save(&self, output: TaskOutput) -> Result<TaskOutput> {
        let mut outputs = self.outputs.lock().expect("catalog lock should not be poisoned");

        if outputs.iter().any(|o| o.name == output.name) {
            return Err(Error::Validation(format!(
                "output \"{}\" already exists",
                output.name
            )));
        }

        outputs.push(output.clone());
        json_file::save_atomic(&self.path, &*outputs)?;
        Ok(output)
    }

    fn get_all(&self) -> Vec<TaskOutput> {
        let outputs = self.outputs.lock().expect("catalog lock should not be poisoned");
        outputs.clone()
    }

    fn get_by_name(&self, name: &str) -> Result<TaskOutput> {
        let outputs = self.outputs.lock().expect("catalog lock should not be poisoned");
        outputs
            .iter()
            .find(|o| o.name == name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("output \"{name}\"")))
    }

    fn get_by_taskid(&self, taskid: &str) -> Vec<TaskOutput> {
        let outputs = self.outputs.lock().expect("catalog lock should not be poisoned");
        outputs.iter().filter(|o| o.taskid == taskid).cloned().collect()
    }

    #[tracing::instrument(skip(self))]
    fn delete(&self, taskid: &str) -> Result<()> {
        let removed: Vec<TaskOutput> = {
            let mut outputs = self.outputs.lock().expect("catalog lock should not be poisoned");
            let (removed, kept): (Vec<_>, Vec<_>) =
                outputs.drain(..).partition(|o| o.taskid == taskid);
            *outputs = kept;
            json_file::save_atomic(&self.path, &*outputs)?;
            removed
        };

        // File removal happens outside the guard; a file already gone is
        // not an error.
        for output in removed {
            let path = self.outputs_dir.join(&output.name);
            match fs::remove_file(&path) {
                Ok(()) => debug!("Removed output file {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to remove output file {}: {}", path.display(), err),
            }
        }
        Ok(())
    }

    fn outputs_dir(&self) -> &Path {
        &self.outputs_dir
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use roadlens_common::output_type;
    use std::collections::BTreeMap;

    struct Fixture {
        _dir: tempfile::TempDir,
        catalog: JsonOutputCatalog,
        outputs_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let outputs_dir = dir.path().join("outputs");
        fs::create_dir_all(&outputs_dir).unwrap();
        let catalog = JsonOutputCatalog::open(&dir.path().join("outputs.json"), &outputs_dir);
        Fixture {
            _dir: dir,
            catalog,
            outputs_dir,
        }
    }

    fn output(taskid: &str, name: &str) -> TaskOutput {
        TaskOutput::new(taskid, name, output_type::VIDEO_MP4, "", BTreeMap::new())
    }

    #[test]
    fn test_save_and_get_by_name() {
        let f = fixture();
        let _ = f.catalog.save(output("t1", "t1.mp4")).unwrap();

        let found = f.catalog.get_by_name("t1.mp4").unwrap();
        assert_eq!(found.taskid, "t1");
    }

    #[test]
    fn test_get_by_name_missing_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.catalog.get_by_name("missing.mp4"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_save_rejects_duplicate_name() {
        let f = fixture();
        let _ = f.catalog.save(output("t1", "t1.mp4")).unwrap();
        assert!(f.catalog.save(output("t2", "t1.mp4")).is_err());
    }

    #[test]
    fn test_get_by_taskid_preserves_insertion_order() {
        let f = fixture();
        let _ = f.catalog.save(output("t1", "t1.csv")).unwrap();
        let _ = f.catalog.save(output("t1", "t1.mp4")).unwrap();
        let _ = f.catalog.save(output("t2", "t2.mp4")).unwrap();

        let names: Vec<_> = f
            .catalog
            .get_by_taskid("t1")
            .into_iter()
            .map(|o| o.name)
            .collect();
        assert_eq!(names, vec!["t1.csv", "t1.mp4"]);
    }

    #[test]
    fn test_delete_removes_entries_and_files() {
        let f = fixture();
        fs::write(f.outputs_dir.join("t1.mp4"), b"video").unwrap();
        fs::write(f.outputs_dir.join("t1.csv"), b"rows").unwrap();
        fs::write(f.outputs_dir.join("t2.mp4"), b"video").unwrap();

        let _ = f.catalog.save(output("t1", "t1.mp4")).unwrap();
        let _ = f.catalog.save(output("t1", "t1.csv")).unwrap();
        let _ = f.catalog.save(output("t2", "t2.mp4")).unwrap();

        f.catalog.delete("t1").unwrap();

        assert!(f.catalog.get_by_taskid("t1").is_empty());
        assert!(!f.outputs_dir.join("t1.mp4").exists());
        assert!(!f.outputs_dir.join("t1.csv").exists());
        // Unrelated outputs are untouched.
        assert!(f.outputs_dir.join("t2.mp4").exists());
        assert_eq!(f.catalog.get_by_taskid("t2").len(), 1);
    }

    #[test]
    fn test_delete_tolerates_missing_files() {
        let f = fixture();
        let _ = f.catalog.save(output("t1", "t1.mp4")).unwrap();
        f.catalog.delete("t1").unwrap();
        assert!(f.catalog.get_by_taskid("t1").is_empty());
    }

    #[test]
    fn test_catalog_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let outputs_dir = dir.path().join("outputs");
        fs::create_dir_all(&outputs_dir).unwrap();
        let path = dir.path().join("outputs.json");

        {
            let catalog = JsonOutputCatalog::open(&path, &outputs_dir);
            let _ = catalog.save(output("t1", "t1.mp4")).unwrap();
        }

        let catalog = JsonOutputCatalog::open(&path, &outputs_dir);
        assert_eq!(catalog.get_all().len(), 1);
    }
}
