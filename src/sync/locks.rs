use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::errors::{SyncError, SyncOutcome};

/// One mutex per (account, folder). Held for the duration of a folder sync.
#[derive(Clone, Default)]
pub struct FolderLocks {
    locks: Arc<Mutex<HashMap<(String, String), Arc<Mutex<()>>>>>,
}

impl FolderLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, account_id: &str, folder: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((account_id.to_string(), folder.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fails with `FolderBusy` instead of queueing behind a running sync.
    pub async fn try_acquire(&self, account_id: &str, folder: &str) -> SyncOutcome<OwnedMutexGuard<()>> {
        self.entry(account_id, folder)
            .await
            .try_lock_owned()
            .map_err(|_| SyncError::FolderBusy(folder.to_string()))
    }

    pub async fn acquire(&self, account_id: &str, folder: &str) -> OwnedMutexGuard<()> {
        self.entry(account_id, folder).await.lock_owned().await
    }
}
