use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Per-project async mutex table. Every state transition for a project
/// (provision, teardown, run start, resume) happens under its lock, which
/// gives single-writer semantics without a global lock.
#[derive(Clone, Default)]
pub struct ProjectLocks {
    inner: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, project_id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
