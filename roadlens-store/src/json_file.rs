use roadlens_common::Result;
use serde::{Serialize, de::DeserializeOwned};
use std::{fs, path::Path};
use tracing::warn;

/// Load a persisted JSON list, falling back to the default on a missing or
/// unreadable file.
pub(crate) fn load_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    match fs::read(path) {
        Ok(data) => match serde_json::from_slice(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "Failed to parse persisted file {}, starting empty, reason: {}",
                    path.display(),
                    err
                );
                T::default()
            }
        },
        Err(_) => T::default(),
    }
}

/// Persist `value` as JSON via a temporary file in the same directory
/// followed by a rename, so a crash mid-write never corrupts the list.
pub(crate) fn save_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    let data = serde_json::to_vec_pretty(value)?;
    fs::write(&tmp, data)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_load_missing_file_gives_default() {
        let list: Vec<String> = load_or_default(&std::env::temp_dir().join("not_a_real_file.json"));
        assert!(list.is_empty());
    }

    #[test]
    fn test_load_garbage_file_gives_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.json");
        fs::write(&path, b"not json at all").unwrap();

        let list: Vec<String> = load_or_default(&path);
        assert!(list.is_empty());
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.json");

        save_atomic(&path, &vec!["a".to_string(), "b".to_string()]).unwrap();
        let back: Vec<String> = load_or_default(&path);
        assert_eq!(back, vec!["a", "b"]);
    }

    #[test]
    fn test_save_leaves_no_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.json");

        save_atomic(&path, &vec![1, 2, 3]).unwrap();
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
