use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Live cancellation handles keyed by task id. One registry per
/// orchestrator instance; clones share the same map.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    handles: Arc<DashMap<Uuid, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle it replaced, if any.
    pub fn insert(&self, task_id: Uuid, token: CancellationToken) -> Option<CancellationToken> {
        self.handles.insert(task_id, token)
    }

    #[cfg(test)]
    pub fn get(&self, task_id: Uuid) -> Option<CancellationToken> {
        self.handles.get(&task_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, task_id: Uuid) -> Option<CancellationToken> {
        self.handles.remove(&task_id).map(|(_, token)| token)
    }

    /// Cancels every live handle and returns how many there were. Entries
    /// stay until their runs finalize and remove them.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.handles.iter() {
            entry.value().cancel();
            cancelled += 1;
        }
        cancelled
    }

    #[cfg(test)]
    pub fn contains(&self, task_id: Uuid) -> bool {
        self.handles.contains_key(&task_id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.handles.len()
    }
}
