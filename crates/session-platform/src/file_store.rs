use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use session_core::{CredentialState, InstanceId, ProjectionPatch, ProjectionRecord};

use crate::{
    CredentialStore, ProjectionStore, StoreError,
    fs::{read_json, remove_dir_if_exists, write_json_atomic},
};

const CREDENTIALS_DIR: &str = "auth_info";
const CREDENTIALS_FILE: &str = "creds.json";
const PROJECTION_DIR: &str = "data";

/// Credentials at `<root>/auth_info/<instance>/creds.json`.
#[derive(Debug, Clone)]
pub struct JsonFileCredentialStore {
    root: PathBuf,
}

impl JsonFileCredentialStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn instance_dir(&self, instance_id: &InstanceId) -> PathBuf {
        self.root.join(CREDENTIALS_DIR).join(instance_id.as_str())
    }

    fn creds_path(&self, instance_id: &InstanceId) -> PathBuf {
        self.instance_dir(instance_id).join(CREDENTIALS_FILE)
    }
}

impl CredentialStore for JsonFileCredentialStore {
    fn load(&self, instance_id: &InstanceId) -> Result<CredentialState, StoreError> {
        read_json::<CredentialState>(&self.creds_path(instance_id))?.ok_or(StoreError::NotFound)
    }

    fn save(&self, instance_id: &InstanceId, state: &CredentialState) -> Result<(), StoreError> {
        write_json_atomic(&self.creds_path(instance_id), state)
    }

    fn erase(&self, instance_id: &InstanceId) -> Result<(), StoreError> {
        remove_dir_if_exists(&self.instance_dir(instance_id))
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProjectionFile {
    #[serde(default)]
    bots: BTreeMap<String, ProjectionRecord>,
}

/// Projection records at `<root>/data/store_<instance>.json`.
///
/// The file keeps a `{"bots": {id: record}}` shape. A file that cannot be
/// parsed reads as the default record and is rewritten on the next upsert.
#[derive(Debug)]
pub struct JsonFileProjectionStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileProjectionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn file_path(&self, instance_id: &InstanceId) -> PathBuf {
        self.root
            .join(PROJECTION_DIR)
            .join(format!("store_{}.json", instance_id.as_str()))
    }

    fn read_file(path: &Path) -> ProjectionFile {
        match read_json::<ProjectionFile>(path) {
            Ok(Some(file)) => file,
            Ok(None) => ProjectionFile::default(),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unreadable projection file");
                ProjectionFile::default()
            }
        }
    }
}

impl ProjectionStore for JsonFileProjectionStore {
    fn get(&self, instance_id: &InstanceId) -> Result<ProjectionRecord, StoreError> {
        let file = Self::read_file(&self.file_path(instance_id));
        Ok(file
            .bots
            .get(instance_id.as_str())
            .cloned()
            .unwrap_or_else(|| ProjectionRecord::new(instance_id.clone())))
    }

    fn upsert(
        &self,
        instance_id: &InstanceId,
        patch: &ProjectionPatch,
    ) -> Result<ProjectionRecord, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;

        let path = self.file_path(instance_id);
        let mut file = Self::read_file(&path);
        let record = file
            .bots
            .entry(instance_id.as_str().to_owned())
            .or_insert_with(|| ProjectionRecord::new(instance_id.clone()));
        record.instance_id = instance_id.clone();
        record.apply(patch);
        let record = record.clone();

        write_json_atomic(&path, &file)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        env, fs,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    fn temp_root(label: &str) -> PathBuf {
        let now_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_nanos())
            .unwrap_or(0);
        env::temp_dir().join(format!("session-platform-{label}-{now_nanos}"))
    }

    fn id(raw: &str) -> InstanceId {
        InstanceId::sanitize(Some(raw))
    }

    #[test]
    fn credentials_round_trip_and_erase_removes_directory() {
        let root = temp_root("creds");
        let store = JsonFileCredentialStore::new(&root);
        assert_eq!(store.load(&id("shopA")), Err(StoreError::NotFound));

        let mut state = CredentialState::default();
        state.insert("noise_key", "abc");
        store.save(&id("shopA"), &state).expect("save should work");

        assert!(root.join("auth_info/shopA/creds.json").exists());
        assert_eq!(store.load(&id("shopA")).expect("load"), state);

        store.erase(&id("shopA")).expect("erase should work");
        assert!(!store.instance_dir(&id("shopA")).exists());
        store.erase(&id("shopA")).expect("erase of a missing bundle");

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn corrupt_credentials_surface_serialization_error() {
        let root = temp_root("creds-corrupt");
        let store = JsonFileCredentialStore::new(&root);
        let path = store.instance_dir(&id("a")).join(CREDENTIALS_FILE);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "{not json").expect("write");

        let err = store.load(&id("a")).expect_err("corrupt file must not load");
        assert!(matches!(err, StoreError::Serialization(_)));

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn projection_upsert_writes_bots_map() {
        let root = temp_root("projection");
        let store = JsonFileProjectionStore::new(&root);

        store
            .upsert(&id("shopA"), &ProjectionPatch::pairing_code_issued(10))
            .expect("upsert");
        let record = store
            .upsert(&id("shopA"), &ProjectionPatch::connection(true, 20))
            .expect("upsert");
        assert!(record.connected);
        assert_eq!(record.last_pairing_code_at_ms, Some(10));

        let raw = fs::read_to_string(root.join("data/store_shopA.json")).expect("read file");
        let json: serde_json::Value = serde_json::from_str(&raw).expect("valid json");
        assert_eq!(json["bots"]["shopA"]["connected"], true);
        assert_eq!(json["bots"]["shopA"]["last_connection_update_ms"], 20);

        assert_eq!(store.get(&id("shopA")).expect("get"), record);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn corrupt_projection_reads_as_default_and_is_replaced() {
        let root = temp_root("projection-corrupt");
        let store = JsonFileProjectionStore::new(&root);
        let path = store.file_path(&id("a"));
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, "garbage").expect("write");

        assert_eq!(
            store.get(&id("a")).expect("get"),
            ProjectionRecord::new(id("a"))
        );

        store
            .upsert(&id("a"), &ProjectionPatch::connection(false, 5))
            .expect("upsert over corrupt file");
        assert_eq!(
            store.get(&id("a")).expect("get").last_connection_update_ms,
            Some(5)
        );

        let _ = fs::remove_dir_all(root);
    }
}
