use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use session_core::{CredentialState, InstanceId, ProjectionPatch, ProjectionRecord};
use thiserror::Error;

mod file_store;
mod fs;

pub use file_store::{JsonFileCredentialStore, JsonFileProjectionStore};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("store serialization failure: {0}")]
    Serialization(String),
}

/// Durable key material per instance.
pub trait CredentialStore: Send + Sync {
    /// Load the credential bundle; `NotFound` means the instance was never paired.
    fn load(&self, instance_id: &InstanceId) -> Result<CredentialState, StoreError>;

    fn save(&self, instance_id: &InstanceId, state: &CredentialState) -> Result<(), StoreError>;

    /// Destroy all credential material. Erasing a missing bundle succeeds.
    fn erase(&self, instance_id: &InstanceId) -> Result<(), StoreError>;
}

/// Small observability record per instance.
pub trait ProjectionStore: Send + Sync {
    /// Current record, or a default one when nothing was persisted yet.
    fn get(&self, instance_id: &InstanceId) -> Result<ProjectionRecord, StoreError>;

    /// Merge `patch` into the stored record and return the result.
    fn upsert(
        &self,
        instance_id: &InstanceId,
        patch: &ProjectionPatch,
    ) -> Result<ProjectionRecord, StoreError>;
}

#[derive(Clone, Default)]
pub struct InMemoryCredentialStore {
    data: Arc<RwLock<HashMap<InstanceId, CredentialState>>>,
}

impl CredentialStore for InMemoryCredentialStore {
    fn load(&self, instance_id: &InstanceId) -> Result<CredentialState, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.get(instance_id).cloned().ok_or(StoreError::NotFound)
    }

    fn save(&self, instance_id: &InstanceId, state: &CredentialState) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.insert(instance_id.clone(), state.clone());
        Ok(())
    }

    fn erase(&self, instance_id: &InstanceId) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        data.remove(instance_id);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryProjectionStore {
    data: Arc<RwLock<HashMap<InstanceId, ProjectionRecord>>>,
}

impl ProjectionStore for InMemoryProjectionStore {
    fn get(&self, instance_id: &InstanceId) -> Result<ProjectionRecord, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        Ok(data
            .get(instance_id)
            .cloned()
            .unwrap_or_else(|| ProjectionRecord::new(instance_id.clone())))
    }

    fn upsert(
        &self,
        instance_id: &InstanceId,
        patch: &ProjectionPatch,
    ) -> Result<ProjectionRecord, StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|_| StoreError::Backend("poisoned lock".to_owned()))?;
        let record = data
            .entry(instance_id.clone())
            .or_insert_with(|| ProjectionRecord::new(instance_id.clone()));
        record.apply(patch);
        Ok(record.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: &str) -> InstanceId {
        InstanceId::sanitize(Some(raw))
    }

    fn creds(value: &str) -> CredentialState {
        let mut state = CredentialState::default();
        state.insert("noise_key", value);
        state
    }

    #[test]
    fn in_memory_credentials_load_save_erase() {
        let store = InMemoryCredentialStore::default();
        assert_eq!(store.load(&id("shopA")), Err(StoreError::NotFound));

        store.save(&id("shopA"), &creds("k1")).expect("save should work");
        assert_eq!(store.load(&id("shopA")).expect("load"), creds("k1"));

        store.erase(&id("shopA")).expect("erase should work");
        assert_eq!(store.load(&id("shopA")), Err(StoreError::NotFound));
        store.erase(&id("shopA")).expect("erasing twice is fine");
    }

    #[test]
    fn in_memory_credentials_are_isolated_per_instance() {
        let store = InMemoryCredentialStore::default();
        store.save(&id("a"), &creds("one")).expect("save a");
        store.save(&id("b"), &creds("two")).expect("save b");
        store.erase(&id("a")).expect("erase a");

        assert_eq!(store.load(&id("b")).expect("load b"), creds("two"));
    }

    #[test]
    fn in_memory_projection_merges_patches() {
        let store = InMemoryProjectionStore::default();
        assert!(!store.get(&id("a")).expect("get").connected);

        store
            .upsert(&id("a"), &ProjectionPatch::pairing_code_issued(5))
            .expect("upsert");
        let record = store
            .upsert(&id("a"), &ProjectionPatch::connection(true, 9))
            .expect("upsert");

        assert_eq!(record.instance_id, id("a"));
        assert!(record.connected);
        assert_eq!(record.last_pairing_code_at_ms, Some(5));
        assert_eq!(record.last_connection_update_ms, Some(9));
    }

    #[derive(Default)]
    struct FailingStore;

    impl CredentialStore for FailingStore {
        fn load(&self, _instance_id: &InstanceId) -> Result<CredentialState, StoreError> {
            Err(StoreError::Unavailable("mock outage".to_owned()))
        }

        fn save(
            &self,
            _instance_id: &InstanceId,
            _state: &CredentialState,
        ) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("mock outage".to_owned()))
        }

        fn erase(&self, _instance_id: &InstanceId) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("mock outage".to_owned()))
        }
    }

    #[test]
    fn failures_surface_through_trait_objects() {
        let store: Arc<dyn CredentialStore> = Arc::new(FailingStore);
        let err = store.erase(&id("a")).expect_err("erase must fail");
        assert_eq!(err, StoreError::Unavailable("mock outage".to_owned()));
    }
}
