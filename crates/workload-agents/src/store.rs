//! Workload record persistence seam.

use std::collections::HashMap;

use async_trait::async_trait;
use coordination::workload::{Workload, WorkloadId};
use tokio::sync::RwLock;

use crate::error::{WorkloadError, WorkloadResult};

/// Stores workload records. `modify` applies a mutation atomically so
/// concurrent writers never lose each other's updates.
#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn insert(&self, workload: Workload) -> WorkloadResult<()>;

    async fn get(&self, id: &WorkloadId) -> WorkloadResult<Option<Workload>>;

    /// Apply `f` to the stored record and return the updated copy.
    async fn modify(
        &self,
        id: &WorkloadId,
        f: &mut (dyn for<'a> FnMut(&'a mut Workload) + Send),
    ) -> WorkloadResult<Workload>;

    async fn list(&self) -> WorkloadResult<Vec<Workload>>;
}

#[derive(Default)]
pub struct InMemoryWorkloadStore {
    records: RwLock<HashMap<WorkloadId, Workload>>,
}

impl InMemoryWorkloadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkloadStore for InMemoryWorkloadStore {
    async fn insert(&self, workload: Workload) -> WorkloadResult<()> {
        self.records.write().await.insert(workload.id, workload);
        Ok(())
    }

    async fn get(&self, id: &WorkloadId) -> WorkloadResult<Option<Workload>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn modify(
        &self,
        id: &WorkloadId,
        f: &mut (dyn for<'a> FnMut(&'a mut Workload) + Send),
    ) -> WorkloadResult<Workload> {
        let mut records = self.records.write().await;
        let workload = records.get_mut(id).ok_or(WorkloadError::NotFound(*id))?;
        f(workload);
        Ok(workload.clone())
    }

    async fn list(&self) -> WorkloadResult<Vec<Workload>> {
        let mut all: Vec<Workload> = self.records.read().await.values().cloned().collect();
        all.sort_by_key(|w| w.created_at);
        Ok(all)
    }
}
