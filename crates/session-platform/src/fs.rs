//! Small JSON-on-disk helpers shared by the file-backed stores.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Serialize, de::DeserializeOwned};

use crate::StoreError;

/// Read and parse a JSON file. A missing file yields `Ok(None)`.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(backend_error("read", path, err)),
    };

    serde_json::from_str::<T>(&raw)
        .map(Some)
        .map_err(|err| StoreError::Serialization(format!("{} is not valid JSON: {err}", path.display())))
}

/// Write JSON through a sibling temp file, then move it over `path`.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| backend_error("create", parent, err))?;
    }

    let encoded = serde_json::to_vec_pretty(value)
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    let staged = temp_path_for(path);
    fs::write(&staged, encoded).map_err(|err| backend_error("stage", &staged, err))?;

    replace_with(&staged, path).inspect_err(|_| {
        let _ = fs::remove_file(&staged);
    })
}

/// Move `staged` over `target`, clearing `target` first on platforms where
/// rename refuses to overwrite.
fn replace_with(staged: &Path, target: &Path) -> Result<(), StoreError> {
    if fs::rename(staged, target).is_ok() {
        return Ok(());
    }
    match fs::remove_file(target) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            return Err(backend_error("replace", target, err));
        }
        _ => {}
    }
    fs::rename(staged, target).map_err(|err| backend_error("replace", target, err))
}

fn backend_error(action: &str, path: &Path, err: io::Error) -> StoreError {
    StoreError::Backend(format!("cannot {action} {}: {err}", path.display()))
}

/// Remove a directory tree; a missing directory is not an error.
pub(crate) fn remove_dir_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(backend_error("remove", path, err)),
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    let mut staged = path.as_os_str().to_owned();
    staged.push(format!(".{}.{stamp}.tmp", std::process::id()));
    PathBuf::from(staged)
}

#[cfg(test)]
mod tests {
    use std::env;

    use super::*;

    fn scratch_dir(label: &str) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_nanos());
        env::temp_dir().join(format!("session-platform-fs-{label}-{stamp}"))
    }

    #[test]
    fn overwrites_existing_file_without_leaving_staged_copies() {
        let dir = scratch_dir("overwrite");
        let path = dir.join("nested").join("value.json");

        write_json_atomic(&path, &vec![1, 2]).expect("first write");
        write_json_atomic(&path, &vec![3]).expect("second write");

        let stored: Option<Vec<u32>> = read_json(&path).expect("read back");
        assert_eq!(stored, Some(vec![3]));
        let leftovers = fs::read_dir(path.parent().expect("parent"))
            .expect("list dir")
            .count();
        assert_eq!(leftovers, 1);

        remove_dir_if_exists(&dir).expect("cleanup");
        remove_dir_if_exists(&dir).expect("second cleanup is a no-op");
    }

    #[test]
    fn unreadable_json_is_a_serialization_error() {
        let dir = scratch_dir("garbage");
        fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join("broken.json");
        fs::write(&path, b"{not json").expect("write garbage");

        let err = read_json::<Vec<u32>>(&path).expect_err("garbage must not parse");
        assert!(matches!(err, StoreError::Serialization(_)));
        assert_eq!(read_json::<Vec<u32>>(&dir.join("missing.json")), Ok(None));

        remove_dir_if_exists(&dir).expect("cleanup");
    }
}
