use std::{
    collections::BTreeMap,
    sync::{PoisonError, RwLock},
};

use session_core::InstanceId;

use crate::{transport::Transport, worker::InstanceHandle};

/// Explicit map of instance id to its worker handle.
///
/// Owned by the composition root and handed to the controller; entries are
/// never removed while the process runs.
pub struct InstanceRegistry<T: Transport> {
    instances: RwLock<BTreeMap<InstanceId, InstanceHandle<T>>>,
}

impl<T: Transport> InstanceRegistry<T> {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, instance_id: &InstanceId) -> Option<InstanceHandle<T>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(instance_id)
            .cloned()
    }

    /// Return the existing handle or insert the one built by `create`.
    ///
    /// `create` runs under the write lock, so it runs at most once per id.
    pub fn get_or_insert_with(
        &self,
        instance_id: &InstanceId,
        create: impl FnOnce() -> InstanceHandle<T>,
    ) -> InstanceHandle<T> {
        if let Some(handle) = self.get(instance_id) {
            return handle;
        }

        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        instances
            .entry(instance_id.clone())
            .or_insert_with(create)
            .clone()
    }

    /// Handles ordered by instance id.
    pub fn list(&self) -> Vec<InstanceHandle<T>> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Transport> Default for InstanceRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}
