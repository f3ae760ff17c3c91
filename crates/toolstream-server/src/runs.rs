use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use toolstream_core::ids::RunId;

/// Active runs, keyed by run id, so they can be cancelled from another request.
#[derive(Default)]
pub struct RunRegistry {
    runs: DashMap<RunId, CancellationToken>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new run. Returns `None` if a run with this id is already active.
    pub fn register(self: &Arc<Self>, run_id: RunId) -> Option<RunGuard> {
        let token = CancellationToken::new();
        match self.runs.entry(run_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => return None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let _ = slot.insert(token.clone());
            }
        }
        Some(RunGuard {
            registry: Arc::clone(self),
            run_id,
            token,
        })
    }

    /// Cancel an active run. Returns whether it was found.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        match self.runs.get(run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every active run. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut signalled = 0;
        for entry in self.runs.iter() {
            entry.value().cancel();
            signalled += 1;
        }
        signalled
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.runs.contains_key(run_id)
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// Removes its run from the registry when dropped.
pub struct RunGuard {
    registry: Arc<RunRegistry>,
    run_id: RunId,
    token: CancellationToken,
}

impl RunGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let _ = self.registry.runs.remove(&self.run_id);
    }
}
